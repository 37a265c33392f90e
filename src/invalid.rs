//! Tracking of assets whose compiles failed.
//!
//! Failed requests are recorded here so tools can present the error list
//! to the user (most usefully for shader and model compile errors). The
//! list survives the process through a JSON sidecar in the active store
//! branch.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// One failed asset and the error its compiler reported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidAssetRecord {
    pub name: String,
    pub error: String,
}

#[derive(Default)]
struct TrackerState {
    assets: Vec<InvalidAssetRecord>,
    sidecar: Option<PathBuf>,
}

/// Runtime list of invalid assets. Clones share one list.
#[derive(Clone, Default)]
pub struct InvalidAssetTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl InvalidAssetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists the list to `path`, seeding it with whatever a previous
    /// run left there.
    pub fn attach_sidecar(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut state = self.state.lock();
        if state.assets.is_empty() {
            if let Ok(text) = fs::read_to_string(&path) {
                match serde_json::from_str::<Vec<InvalidAssetRecord>>(&text) {
                    Ok(assets) => state.assets = assets,
                    Err(err) => warn!("ignoring invalid-asset sidecar \"{}\": {err}", path.display()),
                }
            }
        }
        state.sidecar = Some(path);
    }

    pub fn mark_invalid(&self, name: &str, error: &str) {
        let mut state = self.state.lock();
        match state.assets.iter_mut().find(|record| record.name == name) {
            Some(record) => record.error = error.to_string(),
            None => state
                .assets
                .push(InvalidAssetRecord { name: name.to_string(), error: error.to_string() }),
        }
        write_sidecar(&state);
    }

    pub fn mark_valid(&self, name: &str) {
        let mut state = self.state.lock();
        let before = state.assets.len();
        state.assets.retain(|record| record.name != name);
        if state.assets.len() != before {
            write_sidecar(&state);
        }
    }

    pub fn assets(&self) -> Vec<InvalidAssetRecord> {
        self.state.lock().assets.clone()
    }
}

impl std::fmt::Debug for InvalidAssetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidAssetTracker")
            .field("assets", &self.state.lock().assets.len())
            .finish()
    }
}

fn write_sidecar(state: &TrackerState) {
    let Some(path) = state.sidecar.as_deref() else { return };
    match serde_json::to_string_pretty(&state.assets) {
        Ok(text) => {
            if let Err(err) = fs::write(path, text) {
                warn!("failed to write invalid-asset sidecar \"{}\": {err}", path.display());
            }
        }
        Err(err) => warn!("failed to serialize invalid-asset list: {err}"),
    }
}

/// Default sidecar file name inside a store branch.
pub fn sidecar_path(branch_directory: &Path) -> PathBuf {
    branch_directory.join("invalid_assets.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_replaces_and_clears() {
        let tracker = InvalidAssetTracker::new();
        tracker.mark_invalid("a.dae", "boom");
        tracker.mark_invalid("b.dae", "bang");
        tracker.mark_invalid("a.dae", "boom 2");

        let assets = tracker.assets();
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].error, "boom 2");

        tracker.mark_valid("a.dae");
        assert_eq!(tracker.assets().len(), 1);
        assert_eq!(tracker.assets()[0].name, "b.dae");
    }

    #[test]
    fn sidecar_round_trips_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = sidecar_path(dir.path());

        let tracker = InvalidAssetTracker::new();
        tracker.attach_sidecar(&sidecar);
        tracker.mark_invalid("chest.dae", "missing texture");
        assert!(sidecar.exists());

        let reloaded = InvalidAssetTracker::new();
        reloaded.attach_sidecar(&sidecar);
        assert_eq!(reloaded.assets(), tracker.assets());
    }
}
