#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{AssetError, AssetIoError, Result};

pub mod utils;

pub mod keyed;

pub mod chunkfile;
pub use chunkfile::SerializedArtifact;

pub mod blocks;

pub mod depval;
pub use depval::{DependencyTracker, DependencyValidation, DependentFileState, FileStatus};

pub mod manifest;

pub mod store;
pub use store::Store;

pub mod artifact;
pub use artifact::{ArtifactCollection, ChunkLoadMode, ChunkRequest, ChunkResult};

pub mod invalid;
pub use invalid::InvalidAssetTracker;

pub mod compilers;
pub use compilers::{AssetCompiler, CompileOperation, CompilerDesc, CompilerSet, FileKind};

mod compile;
pub use compile::{ArtifactLocator, CompilationThread, CompileMarker, DIAGNOSTIC_ARTIFACT};

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Lifecycle of an asset request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetState {
    Pending,
    Ready,
    Invalid,
}

/// Build identification recorded into chunk files and store branches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub build_date: String,
}

/// The explicit service context threaded through the pipeline: dependency
/// tracking, the invalid-asset list and build identification. There are
/// no process-wide singletons; everything that needs these services holds
/// a reference.
#[derive(Clone, Debug)]
pub struct AssetServices {
    pub dependencies: DependencyTracker,
    pub invalid_assets: InvalidAssetTracker,
    pub version: VersionInfo,
}

/// The asset compilation pipeline: an intermediate store, a compiler
/// registry and one background compile thread.
///
/// # Examples
///
/// ```no_run
/// use asset_compilers::{compilers::types, AssetPipeline, AssetState};
///
/// let pipeline = AssetPipeline::builder()
///     .root("intermediate")
///     .engine_version("engine-2026.1")
///     .build()?;
///
/// let marker = pipeline.prepare(types::MODEL, "models/chest.dae")?;
/// if marker.stall_while_pending() == AssetState::Ready {
///     let collection = marker.collection().unwrap();
///     println!("compiled into {:?}", collection.main_bundle_path());
/// }
/// # Ok::<_, Box<dyn std::error::Error>>(())
/// ```
pub struct AssetPipeline {
    services: Arc<AssetServices>,
    store: Arc<Store>,
    compilers: CompilerSet,
    thread: CompilationThread,
}

impl AssetPipeline {
    /// Convenience function to call `AssetPipelineBuilder::default()`.
    pub fn builder() -> AssetPipelineBuilder {
        AssetPipelineBuilder::default()
    }

    pub fn services(&self) -> &Arc<AssetServices> {
        &self.services
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn compilers(&self) -> &CompilerSet {
        &self.compilers
    }

    /// Requests an artifact by type code and request name.
    ///
    /// Returns a `Ready` marker synchronously when the store still holds
    /// fresh artifacts for the request; otherwise queues a compile and
    /// returns a `Pending` marker. Fails with
    /// [`AssetError::NoCompiler`] when no compiler handles the request.
    pub fn prepare(&self, type_code: u64, initializer: &str) -> Result<Arc<CompileMarker>> {
        self.compilers.prepare(type_code, initializer, &self.store, &self.thread)
    }

    /// See [`CompilationThread::stall_on_pending_operations`].
    pub fn stall_on_pending_operations(&self, cancel_all: bool) {
        self.thread.stall_on_pending_operations(cancel_all);
    }

    /// Marks a source file as locally overridden; subsequent requests
    /// that depend on it rebuild.
    pub fn shadow_file(&self, path: &Path) {
        self.services.dependencies.shadow_file(path);
    }
}

impl std::fmt::Debug for AssetPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetPipeline")
            .field("store", &self.store)
            .field("compilers", &self.compilers)
            .finish()
    }
}

/// Configures and builds an [`AssetPipeline`].
pub struct AssetPipelineBuilder {
    root: PathBuf,
    engine_version: String,
    configuration: String,
    version_info: VersionInfo,
    file_watching: bool,
    compilers: Vec<Arc<dyn AssetCompiler>>,
    search_directories: Vec<PathBuf>,
}

impl Default for AssetPipelineBuilder {
    fn default() -> Self {
        Self {
            root: PathBuf::from("intermediate"),
            engine_version: "unversioned".to_string(),
            configuration: "default".to_string(),
            version_info: VersionInfo {
                version: env!("CARGO_PKG_VERSION").to_string(),
                build_date: String::new(),
            },
            file_watching: true,
            compilers: Vec::new(),
            search_directories: Vec::new(),
        }
    }
}

impl AssetPipelineBuilder {
    /// Root directory of the intermediate store.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Engine version string; stores with different versions get separate
    /// branch directories.
    pub fn engine_version(mut self, version: impl Into<String>) -> Self {
        self.engine_version = version.into();
        self
    }

    /// Configuration string (for example `debug` / `release`), the second
    /// half of the branch identity.
    pub fn configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = configuration.into();
        self
    }

    /// Build identification written into produced chunk files.
    pub fn version_info(mut self, version_info: VersionInfo) -> Self {
        self.version_info = version_info;
        self
    }

    /// Whether source files are watched for changes. Disable in headless
    /// tools that re-request instead of reacting to invalidation.
    pub fn file_watching(mut self, enabled: bool) -> Self {
        self.file_watching = enabled;
        self
    }

    /// Registers an in-process compiler.
    pub fn compiler(mut self, compiler: Arc<dyn AssetCompiler>) -> Self {
        self.compilers.push(compiler);
        self
    }

    /// Adds a directory scanned for external compiler libraries.
    pub fn library_search_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.search_directories.push(directory.into());
        self
    }

    pub fn build(self) -> Result<AssetPipeline> {
        let dependencies = DependencyTracker::new(self.file_watching);
        let invalid_assets = InvalidAssetTracker::new();

        let store = Arc::new(Store::open(
            &self.root,
            &self.engine_version,
            &self.configuration,
            self.version_info.clone(),
            dependencies.clone(),
        )?);
        invalid_assets.attach_sidecar(invalid::sidecar_path(store.branch_directory()));

        let services = Arc::new(AssetServices {
            dependencies,
            invalid_assets,
            version: self.version_info,
        });

        let compilers = CompilerSet::new();
        for directory in self.search_directories {
            compilers.add_library_search_directory(directory);
        }
        for compiler in self.compilers {
            compilers.add_compiler(compiler);
        }

        let thread = CompilationThread::new({
            let compilers = compilers.clone();
            let services = Arc::clone(&services);
            move |marker| compilers.perform_compile(&marker, &services)
        })?;

        debug!("asset pipeline ready (branch \"{}\")", store.branch_directory().display());
        Ok(AssetPipeline { services, store, compilers, thread })
    }
}
