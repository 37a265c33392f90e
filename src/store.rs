//! The intermediate store.
//!
//! Compiled artifacts are cached under one *branch* directory per
//! `(engine-version, configuration)` pair so different builds of the
//! engine can share a store root without trampling each other's caches.
//! Every request owns a manifest file beside its artifacts; retrieval
//! re-validates the manifest's dependencies against the filesystem before
//! anything is handed out.

use crate::{
    artifact::ArtifactCollection,
    chunkfile::{self, SerializedArtifact, CHUNK_TYPE_LOG, CHUNK_TYPE_METRICS, CHUNK_TYPE_MULTI},
    depval::{DependencyTracker, DependencyValidation, DependentFileState, FileStatus},
    error::{AssetError, Result},
    keyed::{self, KeyedWriter},
    manifest::{CompileProduct, CompileProducts},
    utils, AssetState, VersionInfo,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

const STORE_MARKER: &str = ".store";
const STAGING_SUFFIX: &str = ".staging";

/// Read-reference counts per request hash. A request's artifacts must not
/// be overwritten while any reader holds them open.
#[derive(Debug, Default)]
pub struct StoreReferenceCounts {
    counts: Mutex<HashMap<u64, u32>>,
}

impl StoreReferenceCounts {
    pub fn begin_read(&self, hash: u64) {
        *self.counts.lock().entry(hash).or_insert(0) += 1;
    }

    pub fn end_read(&self, hash: u64) {
        let mut counts = self.counts.lock();
        match counts.get_mut(&hash) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(&hash);
            }
            None => error!("missing read-reference marker during cleanup ({hash:#018x})"),
        }
    }

    pub fn readers(&self, hash: u64) -> u32 {
        self.counts.lock().get(&hash).copied().unwrap_or(0)
    }
}

/// On-disk cache of compiled artifacts for one engine version and
/// configuration. Open at most one `Store` per branch directory per
/// process; concurrent stores over the same branch would race the staging
/// renames.
pub struct Store {
    branch_directory: PathBuf,
    version_id: String,
    version_info: VersionInfo,
    tracker: DependencyTracker,
    ref_counts: Arc<StoreReferenceCounts>,
}

impl Store {
    /// Selects or creates the branch directory for
    /// `<engine_version>-<configuration>` under `root`.
    ///
    /// Existing `d<n>` directories are probed in order; the first whose
    /// `.store` marker carries a matching version string wins. Otherwise
    /// the first unused `d<n>` name is claimed and a fresh marker written.
    pub fn open(
        root: impl AsRef<Path>,
        engine_version: &str,
        configuration: &str,
        version_info: VersionInfo,
        tracker: DependencyTracker,
    ) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|err| AssetError::io(err, root))?;
        let version_id = format!("{engine_version}-{configuration}");

        if let Some(branch) = find_matching_branch(root, &version_id)? {
            debug!("reusing intermediate branch \"{}\" for {version_id}", branch.display());
            return Ok(Self {
                branch_directory: branch,
                version_id,
                version_info,
                tracker,
                ref_counts: Arc::new(StoreReferenceCounts::default()),
            });
        }

        // no usable branch; claim the first unused name
        for index in 0u32.. {
            let branch = root.join(format!("d{index}"));
            if branch.exists() {
                continue;
            }
            fs::create_dir_all(&branch).map_err(|err| AssetError::io(err, &branch))?;
            let marker = branch.join(STORE_MARKER);
            let mut writer = KeyedWriter::new();
            writer.value("VersionString", &version_id);
            fs::write(&marker, writer.finish()).map_err(|err| AssetError::io(err, &marker))?;
            debug!("created intermediate branch \"{}\" for {version_id}", branch.display());
            return Ok(Self {
                branch_directory: branch,
                version_id,
                version_info,
                tracker,
                ref_counts: Arc::new(StoreReferenceCounts::default()),
            });
        }
        unreachable!("branch index space exhausted")
    }

    pub fn branch_directory(&self) -> &Path {
        &self.branch_directory
    }

    pub fn version_id(&self) -> &str {
        &self.version_id
    }

    pub fn tracker(&self) -> &DependencyTracker {
        &self.tracker
    }

    pub fn reference_counts(&self) -> &Arc<StoreReferenceCounts> {
        &self.ref_counts
    }

    /// The cache path for a request: the request name under the branch
    /// directory, with `:` and `*` replaced by `-`. Absolute request names
    /// are re-rooted inside the branch.
    pub fn make_intermediate_name(&self, request: &str) -> PathBuf {
        let sanitized: String =
            request.chars().map(|c| if c == ':' || c == '*' { '-' } else { c }).collect();
        self.branch_directory.join(sanitized.trim_start_matches(['/', '\\']))
    }

    /// Observes the current state of a source file (see
    /// [`DependencyTracker::dependent_file_state`]).
    pub fn dependent_file_state(&self, path: &Path) -> DependentFileState {
        self.tracker.dependent_file_state(path)
    }

    /// Marks a source file as locally overridden so later registrations
    /// force a rebuild.
    pub fn shadow_file(&self, path: &Path) {
        self.tracker.shadow_file(path);
    }

    /// Loads the cached artifacts for a request if they are still fresh.
    ///
    /// Returns `None` when there is no manifest, the manifest cannot be
    /// parsed, or any recorded dependency no longer matches the
    /// filesystem. On success the returned collection holds a read
    /// reference for `hash` and a validation registered over every
    /// dependency.
    pub fn retrieve_compile_products(
        &self,
        request: &str,
        hash: u64,
    ) -> Option<ArtifactCollection> {
        let products_name = self.make_intermediate_name(request);
        let text = match utils::read_to_string(&products_name) {
            Ok(text) => text,
            Err(err) => {
                trace!("no usable manifest for \"{request}\": {err}");
                return None;
            }
        };
        let products = match CompileProducts::parse(&text, &products_name) {
            Ok(products) => products,
            Err(err) => {
                warn!("discarding manifest \"{}\": {err}", products_name.display());
                return None;
            }
        };

        let validation = self.tracker.make_validation();
        for dep in &products.dependencies {
            let full_path = if products.base_path.as_os_str().is_empty() {
                dep.path.clone()
            } else {
                products.base_path.join(&dep.path)
            };
            let current = self.tracker.dependent_file_state(&full_path);
            let fresh = current.status == dep.status
                && (dep.status != FileStatus::Normal
                    || current.modification_time == dep.modification_time);
            if !fresh {
                trace!(
                    "cached \"{request}\" is stale: dependency \"{}\" changed ({:?} -> {:?})",
                    dep.path.display(),
                    (dep.status, dep.modification_time),
                    (current.status, current.modification_time),
                );
                return None;
            }
            self.tracker.register_file_dependency(&validation, &full_path);
        }

        trace!("cached \"{request}\" is fresh ({} products)", products.products.len());
        Some(ArtifactCollection::new(
            request.to_string(),
            products,
            validation,
            Arc::clone(&self.ref_counts),
            hash,
        ))
    }

    /// Commits the outputs of one compile operation.
    ///
    /// Side-file chunk types (`Metrics`, `Log`) become separate files next
    /// to the main bundle; everything else is packed into a single
    /// `.chunk` file. All files are written to `.staging` siblings first
    /// and renamed over their final names only after every write has
    /// succeeded, the manifest last.
    pub fn store_compile_products(
        &self,
        request: &str,
        hash: u64,
        artifacts: &[SerializedArtifact],
        state: AssetState,
        dependencies: &[DependentFileState],
    ) -> Result<ArtifactCollection> {
        debug_assert!(state != AssetState::Pending);
        if self.ref_counts.readers(hash) > 0 {
            return Err(AssetError::msg(format!(
                "cannot overwrite artifacts for \"{request}\" while they are open for reading"
            )));
        }

        let mut products = CompileProducts::new(state);
        products.dependencies = dependencies
            .iter()
            .map(|dep| DependentFileState {
                path: utils::simplify_path(&dep.path),
                ..dep.clone()
            })
            .collect();

        let products_name = self.make_intermediate_name(request);
        utils::create_parent_dir_all(&products_name)?;

        let mut rename_ops: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut main_chunks: Vec<&SerializedArtifact> = Vec::new();
        for artifact in artifacts {
            let suffix = match artifact.type_id {
                CHUNK_TYPE_METRICS => "metrics",
                CHUNK_TYPE_LOG => "log",
                _ => {
                    main_chunks.push(artifact);
                    continue;
                }
            };
            let side_name = side_file_name(&products_name, &artifact.name, suffix);
            let staging = staging_name(&side_name);
            fs::write(&staging, &artifact.data).map_err(|err| AssetError::io(err, &staging))?;
            products
                .products
                .push(CompileProduct { type_id: artifact.type_id, artifact: side_name.clone() });
            rename_ops.push((staging, side_name));
        }

        if !main_chunks.is_empty() {
            let mut bundle_name = products_name.clone().into_os_string();
            bundle_name.push(".chunk");
            let bundle_name = PathBuf::from(bundle_name);
            let staging = staging_name(&bundle_name);
            let mut file =
                fs::File::create(&staging).map_err(|err| AssetError::io(err, &staging))?;
            let owned: Vec<SerializedArtifact> = main_chunks.into_iter().cloned().collect();
            chunkfile::build_chunk_file(&mut file, &owned, &self.version_info, |_| true)
                .map_err(|err| AssetError::io(err, &staging))?;
            drop(file);
            products
                .products
                .push(CompileProduct { type_id: CHUNK_TYPE_MULTI, artifact: bundle_name.clone() });
            rename_ops.push((staging, bundle_name));
        }

        let manifest_staging = staging_name(&products_name);
        fs::write(&manifest_staging, products.serialize())
            .map_err(|err| AssetError::io(err, &manifest_staging))?;
        rename_ops.push((manifest_staging, products_name.clone()));

        #[cfg(debug_assertions)]
        for (i, (staging, final_name)) in rename_ops.iter().enumerate() {
            for (other_staging, other_final) in &rename_ops[..i] {
                if staging == other_staging || final_name == other_final {
                    return Err(AssetError::msg(format!(
                        "duplicated artifact name \"{}\" for \"{request}\"",
                        final_name.display()
                    )));
                }
            }
        }

        // every staging file is on disk; flip them all into place
        for (staging, final_name) in &rename_ops {
            let _ = fs::remove_file(final_name);
            fs::rename(staging, final_name).map_err(|err| AssetError::io(err, final_name))?;
        }

        let validation = self.register_written_dependencies(&products);
        Ok(ArtifactCollection::new(
            request.to_string(),
            products,
            validation,
            Arc::clone(&self.ref_counts),
            hash,
        ))
    }

    fn register_written_dependencies(&self, products: &CompileProducts) -> DependencyValidation {
        let validation = self.tracker.make_validation();
        for dep in &products.dependencies {
            let full_path = if products.base_path.as_os_str().is_empty() {
                dep.path.clone()
            } else {
                products.base_path.join(&dep.path)
            };
            self.tracker.register_file_dependency(&validation, &full_path);
        }
        validation
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("branch_directory", &self.branch_directory)
            .field("version_id", &self.version_id)
            .finish()
    }
}

fn find_matching_branch(root: &Path, version_id: &str) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => return Err(AssetError::io(err, root)),
    };

    let mut branches: Vec<(u32, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let Some(index) = name.strip_prefix('d').and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        branches.push((index, path));
    }
    branches.sort_by_key(|(index, _)| *index);

    for (_, branch) in branches {
        let marker = branch.join(STORE_MARKER);
        let Ok(text) = fs::read_to_string(&marker) else { continue };
        let Ok(document) = keyed::parse(&text) else {
            warn!("ignoring branch with unreadable marker \"{}\"", marker.display());
            continue;
        };
        match keyed::find_value(&document, "VersionString") {
            Some(recorded) if recorded.eq_ignore_ascii_case(version_id) => {
                return Ok(Some(branch));
            }
            _ => {
                // a store for some other build; try the next one
                trace!("branch \"{}\" belongs to another version", branch.display());
            }
        }
    }
    Ok(None)
}

fn side_file_name(products_name: &Path, chunk_name: &str, suffix: &str) -> PathBuf {
    let mut name: OsString = products_name.to_path_buf().into_os_string();
    if chunk_name.is_empty() {
        name.push(format!(".{suffix}"));
    } else {
        let safe: String = chunk_name
            .chars()
            .map(|c| if matches!(c, ':' | '*' | '/' | '\\') { '-' } else { c })
            .collect();
        name.push(format!("-{safe}.{suffix}"));
    }
    PathBuf::from(name)
}

fn staging_name(final_name: &Path) -> PathBuf {
    let mut name: OsString = final_name.to_path_buf().into_os_string();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}
