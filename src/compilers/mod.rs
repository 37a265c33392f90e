//! Compiler contracts and the registry that dispatches requests.
//!
//! Compilers are anything implementing [`AssetCompiler`]: in-process
//! implementations registered directly, or external shared libraries
//! attached through [`library::CompilerLibrary`]. The [`CompilerSet`]
//! routes a request to a compiler by file extension and target type mask,
//! answers warm hits straight from the store, and queues everything else
//! onto the background worker.

use crate::{
    chunkfile::SerializedArtifact,
    compile::{ArtifactLocator, CompileMarker},
    error::{AssetError, Result},
    store::Store,
    utils, AssetServices, AssetState, CompilationThread, VersionInfo,
};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::{
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::Arc,
};

pub mod abi;
pub mod library;

/// Well-known target type codes, usable as bits in a
/// [`FileKind::type_mask`].
pub mod types {
    pub const MODEL: u64 = 1 << 0;
    pub const SKELETON: u64 = 1 << 1;
    pub const ANIMATION_SET: u64 = 1 << 2;
    pub const RAW_MATERIAL: u64 = 1 << 3;
    pub const SHADER: u64 = 1 << 4;
}

/// One file kind a compiler can consume: an extension and the mask of
/// target type codes it can produce from such files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileKind {
    pub extension: String,
    pub type_mask: u64,
}

/// Static description of a compiler.
#[derive(Clone, Debug, Default)]
pub struct CompilerDesc {
    pub name: String,
    pub file_kinds: Vec<FileKind>,
}

impl CompilerDesc {
    pub fn handles(&self, extension: &str, type_code: u64) -> bool {
        self.file_kinds.iter().any(|kind| {
            kind.extension.eq_ignore_ascii_case(extension) && kind.type_mask & type_code != 0
        })
    }
}

/// One target a compile operation can serialize.
#[derive(Clone, Debug)]
pub struct TargetDesc {
    pub type_code: u64,
    pub name: String,
}

/// A single compile request inside a compiler.
pub trait CompileOperation: Send {
    fn target_count(&self) -> usize;
    fn target(&self, index: usize) -> TargetDesc;
    /// Serializes one target into chunks ready for the store.
    fn serialize_target(&mut self, index: usize) -> Result<Vec<SerializedArtifact>>;
    /// Source files consulted beyond the primary input.
    fn dependencies(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// The uniform contract every compiler satisfies.
pub trait AssetCompiler: Send + Sync {
    fn description(&self) -> CompilerDesc;
    fn version_information(&self) -> VersionInfo;
    fn create_compile_operation(&self, identifier: &str) -> Result<Box<dyn CompileOperation>>;
}

struct CompilerSetInner {
    compilers: RwLock<Vec<Arc<dyn AssetCompiler>>>,
    search_directories: RwLock<Vec<PathBuf>>,
    discovery: OnceCell<()>,
}

/// The registry of known compilers. Clones share one registry.
#[derive(Clone)]
pub struct CompilerSet {
    inner: Arc<CompilerSetInner>,
}

impl CompilerSet {
    /// An empty registry whose library search path starts with the
    /// process's executable directory.
    pub fn new() -> Self {
        let mut search_directories = Vec::new();
        if let Some(dir) =
            std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            search_directories.push(dir);
        }
        Self {
            inner: Arc::new(CompilerSetInner {
                compilers: RwLock::new(Vec::new()),
                search_directories: RwLock::new(search_directories),
                discovery: OnceCell::new(),
            }),
        }
    }

    pub fn add_compiler(&self, compiler: Arc<dyn AssetCompiler>) {
        self.inner.compilers.write().push(compiler);
    }

    /// Adds a directory to scan for compiler libraries. Must be called
    /// before the first `prepare` triggers discovery.
    pub fn add_library_search_directory(&self, directory: impl Into<PathBuf>) {
        debug_assert!(self.inner.discovery.get().is_none(), "library discovery already ran");
        self.inner.search_directories.write().push(directory.into());
    }

    /// Scans the search directories once for attachable compiler
    /// libraries. Attach failures are logged and the candidate skipped.
    pub fn discover_libraries(&self) {
        self.inner.discovery.get_or_init(|| {
            let directories = self.inner.search_directories.read().clone();
            for candidate in library::discover_library_candidates(&directories) {
                match library::CompilerLibrary::attach(&candidate) {
                    Ok(lib) => {
                        debug!("attached compiler library \"{}\"", candidate.display());
                        self.add_compiler(Arc::new(lib));
                    }
                    Err(err) => {
                        warn!("skipping compiler library \"{}\": {err}", candidate.display());
                    }
                }
            }
        });
    }

    /// Finds the compiler for an extension/type-code pair. Later
    /// registrations win over earlier ones.
    pub fn find_compiler(&self, extension: &str, type_code: u64) -> Option<usize> {
        let compilers = self.inner.compilers.read();
        compilers
            .iter()
            .enumerate()
            .rev()
            .find(|(_, compiler)| compiler.description().handles(extension, type_code))
            .map(|(index, _)| index)
    }

    pub fn compiler(&self, index: usize) -> Option<Arc<dyn AssetCompiler>> {
        self.inner.compilers.read().get(index).cloned()
    }

    /// Resolves a request to a marker: a terminal marker when the store
    /// still holds fresh artifacts, otherwise a pending marker backed by a
    /// queued compile. Fails synchronously with `NoCompiler` when no
    /// compiler handles the request's extension.
    pub fn prepare(
        &self,
        type_code: u64,
        initializer: &str,
        store: &Arc<Store>,
        thread: &CompilationThread,
    ) -> Result<Arc<CompileMarker>> {
        self.discover_libraries();

        let split = utils::split_request(initializer);
        let compiler_index = self
            .find_compiler(split.extension, type_code)
            .ok_or_else(|| AssetError::NoCompiler(initializer.to_string()))?;
        let hash = utils::hash64(initializer.as_bytes());

        if let Some(collection) = store.retrieve_compile_products(initializer, hash) {
            if collection.dependency_validation().validation_index() == 0 {
                trace!("warm hit for \"{initializer}\"");
                let state = collection.state();
                let locator = ArtifactLocator {
                    source_id0: store.make_intermediate_name(initializer),
                    source_id1: 0,
                    validation: collection.dependency_validation().clone(),
                };
                return Ok(Arc::new(CompileMarker::resolved(
                    type_code,
                    initializer,
                    compiler_index,
                    Arc::clone(store),
                    hash,
                    state,
                    locator,
                    Arc::new(collection),
                )));
            }
        }

        debug!("queueing compile for \"{initializer}\"");
        let marker = Arc::new(CompileMarker::pending(
            type_code,
            initializer,
            compiler_index,
            Arc::clone(store),
            hash,
        ));
        thread.push(&marker);
        Ok(marker)
    }

    /// The worker's per-job body. Never returns an error and never panics
    /// outward: every failure ends as an `Invalid` marker carrying a
    /// diagnostic artifact.
    pub(crate) fn perform_compile(&self, marker: &CompileMarker, services: &AssetServices) {
        let initializer = marker.initializer().to_string();
        debug!("compiling \"{initializer}\"");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_compile(marker)));
        let outcome = match outcome {
            Ok(result) => result,
            Err(payload) => Err(AssetError::CompilerFailure {
                initializer: initializer.clone(),
                message: panic_message(payload),
            }),
        };

        match outcome {
            Ok((locator, collection)) => {
                services.invalid_assets.mark_valid(&initializer);
                marker.set_ready(locator, collection);
            }
            Err(err) => {
                error!("compile of \"{initializer}\" failed: {err}");
                services.invalid_assets.mark_invalid(&initializer, &err.to_string());
                marker.set_invalid(err.to_string());
            }
        }
    }

    fn run_compile(
        &self,
        marker: &CompileMarker,
    ) -> Result<(ArtifactLocator, Arc<crate::artifact::ArtifactCollection>)> {
        let compiler = self
            .compiler(marker.compiler_index())
            .ok_or_else(|| AssetError::msg("compiler index out of range"))?;
        let initializer = marker.initializer();
        let split = utils::split_request(initializer);

        let mut operation = compiler.create_compile_operation(initializer)?;

        let mut artifacts = Vec::new();
        let mut found_target = false;
        for index in 0..operation.target_count() {
            if operation.target(index).type_code == marker.type_code() {
                artifacts.extend(operation.serialize_target(index)?);
                found_target = true;
            }
        }
        if !found_target {
            return Err(AssetError::CompilerFailure {
                initializer: initializer.to_string(),
                message: "no target of the requested type in the compile operation".to_string(),
            });
        }

        let store = marker.store();
        let mut dependencies = vec![store.dependent_file_state(Path::new(split.path))];
        for reported in operation.dependencies() {
            let state = store.dependent_file_state(&reported);
            if !dependencies.iter().any(|d| d.path == state.path) {
                dependencies.push(state);
            }
        }

        let collection = store.store_compile_products(
            initializer,
            marker.request_hash(),
            &artifacts,
            AssetState::Ready,
            &dependencies,
        )?;
        let locator = ArtifactLocator {
            source_id0: store.make_intermediate_name(initializer),
            source_id1: 0,
            validation: collection.dependency_validation().clone(),
        };
        Ok((locator, Arc::new(collection)))
    }
}

impl Default for CompilerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompilerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerSet")
            .field("compilers", &self.inner.compilers.read().len())
            .finish()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic in compiler".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubCompiler {
        desc: CompilerDesc,
    }

    impl StubCompiler {
        fn new(name: &str, extension: &str, type_mask: u64) -> Arc<Self> {
            Arc::new(Self {
                desc: CompilerDesc {
                    name: name.into(),
                    file_kinds: vec![FileKind { extension: extension.into(), type_mask }],
                },
            })
        }
    }

    impl AssetCompiler for StubCompiler {
        fn description(&self) -> CompilerDesc {
            self.desc.clone()
        }

        fn version_information(&self) -> VersionInfo {
            VersionInfo { version: "stub".into(), build_date: String::new() }
        }

        fn create_compile_operation(&self, identifier: &str) -> Result<Box<dyn CompileOperation>> {
            Err(AssetError::CompilerFailure {
                initializer: identifier.to_string(),
                message: "stub".into(),
            })
        }
    }

    #[test]
    fn routing_matches_extension_and_mask() {
        let set = CompilerSet::new();
        set.add_compiler(StubCompiler::new("models", "dae", types::MODEL | types::SKELETON));
        set.add_compiler(StubCompiler::new("materials", "material", types::RAW_MATERIAL));

        assert_eq!(set.find_compiler("dae", types::MODEL), Some(0));
        assert_eq!(set.find_compiler("DAE", types::SKELETON), Some(0));
        assert_eq!(set.find_compiler("material", types::RAW_MATERIAL), Some(1));
        // wrong type code for the extension
        assert_eq!(set.find_compiler("dae", types::RAW_MATERIAL), None);
        assert_eq!(set.find_compiler("fbx", types::MODEL), None);
    }

    #[test]
    fn later_registrations_win() {
        let set = CompilerSet::new();
        set.add_compiler(StubCompiler::new("old", "dae", types::MODEL));
        set.add_compiler(StubCompiler::new("new", "dae", types::MODEL));

        let index = set.find_compiler("dae", types::MODEL).unwrap();
        assert_eq!(set.compiler(index).unwrap().description().name, "new");
    }
}
