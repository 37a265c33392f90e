//! Compile futures.
//!
//! A [`CompileMarker`] is the handle a caller holds while a compile is in
//! flight. The marker doubles as the queued operation: the background
//! worker keeps only a weak reference, so a request abandoned by its
//! caller is skipped without ever running.

use crate::{
    artifact::ArtifactCollection,
    chunkfile::{SerializedArtifact, CHUNK_TYPE_LOG, CHUNK_TYPE_METRICS, CHUNK_TYPE_MULTI},
    depval::DependencyValidation,
    store::Store,
    utils, AssetState,
};
use parking_lot::{Condvar, Mutex};
use std::{path::PathBuf, sync::Arc};

pub mod worker;
pub use worker::CompilationThread;

/// Name of the diagnostic artifact an `Invalid` marker carries.
pub const DIAGNOSTIC_ARTIFACT: &str = "Exception";

/// Where a finished compile's primary artifact lives, plus the validation
/// that governs its freshness.
#[derive(Clone, Debug)]
pub struct ArtifactLocator {
    /// Path of the primary stored artifact (the manifest name).
    pub source_id0: PathBuf,
    /// Secondary discriminator for requests sharing a path.
    pub source_id1: u64,
    pub validation: DependencyValidation,
}

struct MarkerInner {
    state: AssetState,
    locator: Option<ArtifactLocator>,
    collection: Option<Arc<ArtifactCollection>>,
    diagnostics: Vec<SerializedArtifact>,
}

/// The future of one compile request.
///
/// State moves Pending -> Ready or Pending -> Invalid exactly once; after
/// a terminal state has been observed the marker's data never changes
/// again.
pub struct CompileMarker {
    type_code: u64,
    initializer: String,
    request_hash: u64,
    compiler_index: usize,
    store: Arc<Store>,
    inner: Mutex<MarkerInner>,
    resolved: Condvar,
}

impl CompileMarker {
    pub(crate) fn pending(
        type_code: u64,
        initializer: &str,
        compiler_index: usize,
        store: Arc<Store>,
        request_hash: u64,
    ) -> Self {
        Self {
            type_code,
            initializer: initializer.to_string(),
            request_hash,
            compiler_index,
            store,
            inner: Mutex::new(MarkerInner {
                state: AssetState::Pending,
                locator: None,
                collection: None,
                diagnostics: Vec::new(),
            }),
            resolved: Condvar::new(),
        }
    }

    /// A marker that is terminal from the start (warm cache hits).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn resolved(
        type_code: u64,
        initializer: &str,
        compiler_index: usize,
        store: Arc<Store>,
        request_hash: u64,
        state: AssetState,
        locator: ArtifactLocator,
        collection: Arc<ArtifactCollection>,
    ) -> Self {
        let marker = Self::pending(type_code, initializer, compiler_index, store, request_hash);
        marker.complete(state, Some(locator), Some(collection));
        marker
    }

    pub fn initializer(&self) -> &str {
        &self.initializer
    }

    pub fn type_code(&self) -> u64 {
        self.type_code
    }

    pub(crate) fn compiler_index(&self) -> usize {
        self.compiler_index
    }

    pub(crate) fn request_hash(&self) -> u64 {
        self.request_hash
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Non-blocking state probe.
    pub fn try_resolve(&self) -> AssetState {
        self.inner.lock().state
    }

    /// Blocks the caller until the marker reaches a terminal state.
    pub fn stall_while_pending(&self) -> AssetState {
        let mut inner = self.inner.lock();
        while inner.state == AssetState::Pending {
            self.resolved.wait(&mut inner);
        }
        inner.state
    }

    /// The locator of the finished artifacts. Only meaningful once the
    /// marker is `Ready`.
    pub fn locator(&self) -> Option<ArtifactLocator> {
        let inner = self.inner.lock();
        if inner.state == AssetState::Ready {
            inner.locator.clone()
        } else {
            None
        }
    }

    /// The artifact collection of a `Ready` marker.
    pub fn collection(&self) -> Option<Arc<ArtifactCollection>> {
        let inner = self.inner.lock();
        if inner.state == AssetState::Ready {
            inner.collection.clone()
        } else {
            None
        }
    }

    /// Fetches a named artifact: `main`, `metrics` or `log` from the
    /// stored products of a `Ready` marker, or a diagnostic (such as
    /// [`DIAGNOSTIC_ARTIFACT`]) attached when the compile failed.
    pub fn get_artifact(&self, name: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        if let Some(diagnostic) = inner.diagnostics.iter().find(|d| d.name == name) {
            return Some(diagnostic.data.clone());
        }

        let collection = inner.collection.as_ref()?;
        let type_id = match name {
            "main" => CHUNK_TYPE_MULTI,
            "metrics" => CHUNK_TYPE_METRICS,
            "log" => CHUNK_TYPE_LOG,
            _ => return None,
        };
        collection.read_product(type_id).ok()
    }

    pub(crate) fn set_ready(
        &self,
        locator: ArtifactLocator,
        collection: Arc<ArtifactCollection>,
    ) {
        self.complete(AssetState::Ready, Some(locator), Some(collection));
    }

    pub(crate) fn set_invalid(&self, message: String) {
        {
            let mut inner = self.inner.lock();
            if inner.state == AssetState::Pending {
                inner.diagnostics.push(SerializedArtifact {
                    type_id: utils::hash64(DIAGNOSTIC_ARTIFACT.as_bytes()),
                    version: 0,
                    name: DIAGNOSTIC_ARTIFACT.to_string(),
                    data: message.into_bytes(),
                });
            }
        }
        self.complete(AssetState::Invalid, None, None);
    }

    fn complete(
        &self,
        state: AssetState,
        locator: Option<ArtifactLocator>,
        collection: Option<Arc<ArtifactCollection>>,
    ) {
        debug_assert!(state != AssetState::Pending);
        let mut inner = self.inner.lock();
        if inner.state != AssetState::Pending {
            debug_assert_eq!(inner.state, state, "marker resolved twice with different states");
            return;
        }
        inner.state = state;
        inner.locator = locator;
        inner.collection = collection;
        drop(inner);
        self.resolved.notify_all();
    }
}

impl std::fmt::Debug for CompileMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileMarker")
            .field("initializer", &self.initializer)
            .field("state", &self.try_resolve())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depval::DependencyTracker;
    use crate::VersionInfo;
    use std::time::Duration;

    fn test_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            dir.path(),
            "marker-tests",
            "debug",
            VersionInfo::default(),
            DependencyTracker::new(false),
        )
        .unwrap();
        (dir, Arc::new(store))
    }

    #[test]
    fn invalid_markers_carry_a_diagnostic() {
        let (_dir, store) = test_store();
        let marker = CompileMarker::pending(1, "broken.dae", 0, store, 7);
        assert_eq!(marker.try_resolve(), AssetState::Pending);

        marker.set_invalid("the input was malformed".to_string());
        assert_eq!(marker.try_resolve(), AssetState::Invalid);
        let diagnostic = marker.get_artifact(DIAGNOSTIC_ARTIFACT).unwrap();
        assert_eq!(diagnostic, b"the input was malformed");
        assert!(marker.locator().is_none());
    }

    #[test]
    fn terminal_state_is_sticky() {
        let (_dir, store) = test_store();
        let marker = CompileMarker::pending(1, "a.dae", 0, store, 7);
        marker.set_invalid("first".to_string());
        // a second resolution with the same state is ignored
        marker.set_invalid("second".to_string());
        assert_eq!(marker.get_artifact(DIAGNOSTIC_ARTIFACT).unwrap(), b"first");
    }

    #[test]
    fn stall_wakes_on_resolution() {
        let (_dir, store) = test_store();
        let marker = Arc::new(CompileMarker::pending(1, "a.dae", 0, store, 7));
        let waiter = {
            let marker = Arc::clone(&marker);
            std::thread::spawn(move || marker.stall_while_pending())
        };
        std::thread::sleep(Duration::from_millis(50));
        marker.set_invalid("done".to_string());
        assert_eq!(waiter.join().unwrap(), AssetState::Invalid);
    }
}
