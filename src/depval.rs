//! Dependency validation.
//!
//! Every cached artifact is tied to the source files it was built from
//! through a validation record. Records live in an arena; parent edges are
//! stored as indices so the graph cannot form ownership cycles. When a
//! registered file changes on disk, the record's validation index is
//! bumped and the change propagates to every ancestor.

use crate::{
    error::{AssetError, Result},
    utils,
};
use notify::{RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, HashSet},
    ffi::OsString,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};

/// Observed state of one source file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileStatus {
    Normal,
    DoesNotExist,
    /// The file was marked as locally overridden; it always compares as
    /// changed against a recorded `Normal` state.
    Shadowed,
}

/// A snapshot of one dependent file: identity, modification time and
/// status. Two snapshots are equal iff all three fields match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependentFileState {
    pub path: PathBuf,
    pub modification_time: u64,
    pub status: FileStatus,
}

impl DependentFileState {
    pub fn new(path: impl Into<PathBuf>, modification_time: u64) -> Self {
        Self { path: path.into(), modification_time, status: FileStatus::Normal }
    }

    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), modification_time: 0, status: FileStatus::DoesNotExist }
    }
}

struct Node {
    /// Live handles plus incoming parent edges.
    refs: u32,
    validation_index: AtomicU32,
    parents: Vec<usize>,
    files: Vec<DependentFileState>,
}

impl Node {
    fn new() -> Self {
        Self { refs: 1, validation_index: AtomicU32::new(0), parents: Vec::new(), files: Vec::new() }
    }
}

#[derive(Default)]
struct Graph {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
}

impl Graph {
    fn alloc(&mut self) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.nodes[index] = Some(Node::new());
                index
            }
            None => {
                self.nodes.push(Some(Node::new()));
                self.nodes.len() - 1
            }
        }
    }

    fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.nodes.get_mut(index).and_then(|n| n.as_mut())
    }

    fn retain(&mut self, index: usize) {
        if let Some(node) = self.node_mut(index) {
            node.refs += 1;
        }
    }

    /// Drops one reference; nodes release their parent edges when freed.
    fn release(&mut self, index: usize) {
        let mut pending = vec![index];
        while let Some(index) = pending.pop() {
            let Some(node) = self.node_mut(index) else { continue };
            node.refs -= 1;
            if node.refs == 0 {
                let node = self.nodes[index].take();
                self.free.push(index);
                if let Some(node) = node {
                    pending.extend(node.parents);
                }
            }
        }
    }

    /// True when `to` is reachable from `from` along parent edges.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut visited = HashSet::new();
        let mut pending = vec![from];
        while let Some(index) = pending.pop() {
            if index == to {
                return true;
            }
            if !visited.insert(index) {
                continue;
            }
            if let Some(node) = self.node(index) {
                pending.extend(node.parents.iter().copied());
            }
        }
        false
    }
}

struct TrackerInner {
    graph: RwLock<Graph>,
    shadowed: Mutex<HashSet<PathBuf>>,
    /// directory -> file name -> interested validation records
    watches: Mutex<HashMap<PathBuf, HashMap<OsString, Vec<usize>>>>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    watching_enabled: bool,
}

impl TrackerInner {
    /// Bumps the node and every ancestor. Diamonds in the graph are
    /// visited once per sweep.
    fn on_change(&self, index: usize) {
        let graph = self.graph.read();
        let mut visited = HashSet::new();
        let mut pending = vec![index];
        while let Some(index) = pending.pop() {
            if !visited.insert(index) {
                continue;
            }
            if let Some(node) = graph.node(index) {
                node.validation_index.fetch_add(1, Ordering::AcqRel);
                pending.extend(node.parents.iter().copied());
            }
        }
    }

    fn on_path_changed(&self, path: &Path) {
        let interested = {
            let mut watches = self.watches.lock();
            let Some(dir) = path.parent() else { return };
            let Some(name) = path.file_name() else { return };
            let Some(files) = watches.get_mut(dir) else { return };
            match files.get(name) {
                Some(indices) => indices.clone(),
                None => return,
            }
        };
        trace!("change event for \"{}\" invalidates {} records", path.display(), interested.len());
        for index in interested {
            self.on_change(index);
        }
    }
}

/// The dependency-validation service: owns the record arena, the shadow
/// set and the filesystem-change subscriptions. Clones share one service.
#[derive(Clone)]
pub struct DependencyTracker {
    inner: Arc<TrackerInner>,
}

impl DependencyTracker {
    /// `watching` controls whether filesystem-change subscriptions are
    /// installed; with it off, records still compare file states but only
    /// explicit change notifications bump validation indices.
    pub fn new(watching: bool) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                graph: RwLock::new(Graph::default()),
                shadowed: Mutex::new(HashSet::new()),
                watches: Mutex::new(HashMap::new()),
                watcher: Mutex::new(None),
                watching_enabled: watching,
            }),
        }
    }

    /// Creates a fresh validation record with index 0.
    pub fn make_validation(&self) -> DependencyValidation {
        let index = self.inner.graph.write().alloc();
        DependencyValidation { inner: Arc::clone(&self.inner), index }
    }

    /// Records `path`'s current state into the validation and subscribes
    /// to changes of the containing directory.
    pub fn register_file_dependency(&self, validation: &DependencyValidation, path: &Path) {
        let state = self.dependent_file_state(path);
        {
            let mut graph = self.inner.graph.write();
            if let Some(node) = graph.node_mut(validation.index) {
                node.files.push(state);
            }
        }
        self.subscribe(path, validation.index);
    }

    /// Makes `parent` invalidate whenever `child` does. Fails when the new
    /// edge would close a cycle.
    pub fn register_asset_dependency(
        &self,
        parent: &DependencyValidation,
        child: &DependencyValidation,
    ) -> Result<()> {
        let mut graph = self.inner.graph.write();
        if parent.index == child.index || graph.reaches(parent.index, child.index) {
            return Err(AssetError::AssetDependency(format!(
                "registering this dependency would create a cycle (records {} and {})",
                parent.index, child.index
            )));
        }
        graph.retain(parent.index);
        if let Some(node) = graph.node_mut(child.index) {
            node.parents.push(parent.index);
        }
        Ok(())
    }

    /// Observes the filesystem right now. Shadowed paths report
    /// `FileStatus::Shadowed` regardless of what is on disk.
    pub fn dependent_file_state(&self, path: &Path) -> DependentFileState {
        let simplified = utils::simplify_path(path);
        if self.inner.shadowed.lock().contains(&simplified) {
            return DependentFileState {
                path: simplified,
                modification_time: 0,
                status: FileStatus::Shadowed,
            };
        }
        match utils::modification_time(&simplified) {
            Some(time) => DependentFileState::new(simplified, time),
            None => DependentFileState::missing(simplified),
        }
    }

    /// Marks a path as locally overridden. Only registrations made after
    /// this call observe the shadowed status; existing records keep their
    /// recorded states until re-requested.
    pub fn shadow_file(&self, path: &Path) {
        self.inner.shadowed.lock().insert(utils::simplify_path(path));
    }

    /// Explicit change notification, equivalent to a watcher event for
    /// `path`.
    pub fn notify_path_changed(&self, path: &Path) {
        self.inner.on_path_changed(&utils::simplify_path(path));
    }

    /// Installs the watch-map entry for `path`; when watching is enabled
    /// the containing directory also gets an OS-level subscription.
    fn subscribe(&self, path: &Path, index: usize) {
        let path = utils::simplify_path(path);
        let Some(dir) = path.parent().map(Path::to_path_buf) else { return };
        let Some(name) = path.file_name().map(OsString::from) else { return };

        let mut watches = self.inner.watches.lock();
        let new_dir = !watches.contains_key(&dir);
        watches.entry(dir.clone()).or_default().entry(name).or_default().push(index);
        drop(watches);

        if new_dir && self.inner.watching_enabled {
            self.ensure_watcher();
            let mut guard = self.inner.watcher.lock();
            if let Some(watcher) = guard.as_mut() {
                if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                    warn!("failed to watch \"{}\": {err}", dir.display());
                }
            }
        }
    }

    fn ensure_watcher(&self) {
        let mut guard = self.inner.watcher.lock();
        if guard.is_none() {
            let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
            match notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                let Ok(event) = result else { return };
                let Some(inner) = weak.upgrade() else { return };
                for path in &event.paths {
                    inner.on_path_changed(path);
                }
            }) {
                Ok(watcher) => *guard = Some(watcher),
                Err(err) => warn!("failed to create filesystem watcher: {err}"),
            }
        }
    }

    #[cfg(test)]
    fn live_records(&self) -> usize {
        self.inner.graph.read().nodes.iter().flatten().count()
    }
}

impl std::fmt::Debug for DependencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.inner.graph.read();
        f.debug_struct("DependencyTracker")
            .field("records", &graph.nodes.iter().flatten().count())
            .field("watching", &self.inner.watching_enabled)
            .finish()
    }
}

/// Handle to one validation record. Clones share the record; the record is
/// reclaimed when the last handle drops and no child references it.
pub struct DependencyValidation {
    inner: Arc<TrackerInner>,
    index: usize,
}

impl DependencyValidation {
    /// 0 means the record has never been invalidated since creation.
    pub fn validation_index(&self) -> u32 {
        self.inner
            .graph
            .read()
            .node(self.index)
            .map(|node| node.validation_index.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// The file states recorded at registration time.
    pub fn file_states(&self) -> Vec<DependentFileState> {
        self.inner
            .graph
            .read()
            .node(self.index)
            .map(|node| node.files.clone())
            .unwrap_or_default()
    }
}

impl Clone for DependencyValidation {
    fn clone(&self) -> Self {
        self.inner.graph.write().retain(self.index);
        Self { inner: Arc::clone(&self.inner), index: self.index }
    }
}

impl Drop for DependencyValidation {
    fn drop(&mut self) {
        self.inner.graph.write().release(self.index);
    }
}

impl std::fmt::Debug for DependencyValidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyValidation")
            .field("index", &self.index)
            .field("validation_index", &self.validation_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn fresh_record_has_index_zero() {
        let tracker = DependencyTracker::new(false);
        let validation = tracker.make_validation();
        assert_eq!(validation.validation_index(), 0);
    }

    #[test]
    fn change_propagates_to_ancestors() {
        let tracker = DependencyTracker::new(false);
        let child = tracker.make_validation();
        let parent = tracker.make_validation();
        let grandparent = tracker.make_validation();
        tracker.register_asset_dependency(&parent, &child).unwrap();
        tracker.register_asset_dependency(&grandparent, &parent).unwrap();

        tracker.inner.on_change(child.index);
        assert_eq!(child.validation_index(), 1);
        assert_eq!(parent.validation_index(), 1);
        assert_eq!(grandparent.validation_index(), 1);
    }

    #[test]
    fn diamond_bumps_apex_once_per_sweep() {
        let tracker = DependencyTracker::new(false);
        let child = tracker.make_validation();
        let left = tracker.make_validation();
        let right = tracker.make_validation();
        let apex = tracker.make_validation();
        tracker.register_asset_dependency(&left, &child).unwrap();
        tracker.register_asset_dependency(&right, &child).unwrap();
        tracker.register_asset_dependency(&apex, &left).unwrap();
        tracker.register_asset_dependency(&apex, &right).unwrap();

        tracker.inner.on_change(child.index);
        assert_eq!(apex.validation_index(), 1);
    }

    #[test]
    fn cycles_are_rejected() {
        let tracker = DependencyTracker::new(false);
        let a = tracker.make_validation();
        let b = tracker.make_validation();
        tracker.register_asset_dependency(&a, &b).unwrap();
        let err = tracker.register_asset_dependency(&b, &a).unwrap_err();
        assert!(matches!(err, AssetError::AssetDependency(_)));
        // self-edges are cycles too
        assert!(tracker.register_asset_dependency(&a, &a).is_err());
    }

    #[test]
    fn records_are_reclaimed_with_their_edges() {
        let tracker = DependencyTracker::new(false);
        let child = tracker.make_validation();
        let parent = tracker.make_validation();
        tracker.register_asset_dependency(&parent, &child).unwrap();
        assert_eq!(tracker.live_records(), 2);

        // the child edge keeps the parent alive
        drop(parent);
        assert_eq!(tracker.live_records(), 2);
        drop(child);
        assert_eq!(tracker.live_records(), 0);
    }

    #[test]
    fn file_states_reflect_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.dae");
        fs::write(&present, b"x").unwrap();

        let tracker = DependencyTracker::new(false);
        let state = tracker.dependent_file_state(&present);
        assert_eq!(state.status, FileStatus::Normal);
        assert!(state.modification_time > 0);

        let missing = tracker.dependent_file_state(&dir.path().join("gone.dae"));
        assert_eq!(missing.status, FileStatus::DoesNotExist);
        assert_eq!(missing.modification_time, 0);
    }

    #[test]
    fn shadowing_is_not_retroactive() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mat.material");
        fs::write(&file, b"x").unwrap();

        let tracker = DependencyTracker::new(false);
        let before = tracker.dependent_file_state(&file);
        assert_eq!(before.status, FileStatus::Normal);

        tracker.shadow_file(&file);
        let after = tracker.dependent_file_state(&file);
        assert_eq!(after.status, FileStatus::Shadowed);
        // the earlier snapshot is untouched
        assert_eq!(before.status, FileStatus::Normal);
    }

    #[test]
    fn registered_files_receive_change_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("chest.dae");
        fs::write(&file, b"x").unwrap();

        let tracker = DependencyTracker::new(false);
        let validation = tracker.make_validation();
        tracker.register_file_dependency(&validation, &file);

        let states = validation.file_states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status, FileStatus::Normal);

        tracker.notify_path_changed(&file);
        assert_eq!(validation.validation_index(), 1);

        // unrelated files in the same directory do not invalidate
        tracker.notify_path_changed(&dir.path().join("other.dae"));
        assert_eq!(validation.validation_index(), 1);
    }
}
