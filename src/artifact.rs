//! Artifact collections.
//!
//! An [`ArtifactCollection`] represents the stored outputs of one compile
//! request. It opens the main chunk bundle lazily, resolves typed chunk
//! requests into buffers, and holds a read reference in the store's
//! refcount table for as long as it lives so the worker cannot overwrite
//! files that are still being consumed.

use crate::{
    blocks,
    chunkfile::{self, CHUNK_TYPE_MULTI},
    depval::DependencyValidation,
    error::{AssetError, Result},
    manifest::CompileProducts,
    store::StoreReferenceCounts,
    utils, AssetState,
};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
    sync::Arc,
};

/// How a requested chunk's payload should be materialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkLoadMode {
    /// Only locate the chunk; report offset and size without reading.
    DontLoad,
    /// Read the payload into a fresh buffer.
    Raw,
    /// Read the payload and run the block-serializer fixup pass.
    BlockSerializer,
}

/// One typed chunk request. `name` is used for error reporting only.
#[derive(Clone, Copy, Debug)]
pub struct ChunkRequest {
    pub name: &'static str,
    pub type_id: u64,
    pub expected_version: u32,
    pub mode: ChunkLoadMode,
}

/// The resolution of one [`ChunkRequest`], in request order.
#[derive(Clone, Debug)]
pub struct ChunkResult {
    pub offset: u32,
    pub size: u32,
    /// `None` for `DontLoad` requests.
    pub data: Option<Vec<u8>>,
}

/// The artifacts of one stored compile request plus the validation
/// governing their freshness.
pub struct ArtifactCollection {
    request: String,
    products: CompileProducts,
    validation: DependencyValidation,
    ref_counts: Arc<StoreReferenceCounts>,
    hash: u64,
}

impl ArtifactCollection {
    pub(crate) fn new(
        request: String,
        products: CompileProducts,
        validation: DependencyValidation,
        ref_counts: Arc<StoreReferenceCounts>,
        hash: u64,
    ) -> Self {
        ref_counts.begin_read(hash);
        Self { request, products, validation, ref_counts, hash }
    }

    /// The request name these artifacts were compiled for.
    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn state(&self) -> AssetState {
        self.products.state
    }

    pub fn products(&self) -> &CompileProducts {
        &self.products
    }

    pub fn dependency_validation(&self) -> &DependencyValidation {
        &self.validation
    }

    /// Path of the main `.chunk` bundle, when the compile produced one.
    pub fn main_bundle_path(&self) -> Option<&Path> {
        self.products.find_product(CHUNK_TYPE_MULTI).map(|p| p.artifact.as_path())
    }

    /// Reads the raw bytes of the product stored for `type_id`.
    pub fn read_product(&self, type_id: u64) -> Result<Vec<u8>> {
        let product = self
            .products
            .find_product(type_id)
            .ok_or_else(|| AssetError::msg(format!("no product of type {type_id:#018x}")))?;
        utils::read_to_vec(&product.artifact)
    }

    /// Opens the main bundle and resolves every request against its table.
    ///
    /// All requests are checked before anything is read, so a missing
    /// chunk or version mismatch fails the whole resolution. Results come
    /// back in request order; the file is closed before returning.
    pub fn resolve_requests(&self, requests: &[ChunkRequest]) -> Result<Vec<ChunkResult>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if self.products.state == AssetState::Invalid {
            return Err(AssetError::InvalidAsset {
                name: self.request.clone(),
                message: "the stored compile products are marked invalid".to_string(),
            });
        }
        let bundle = self.main_bundle_path().ok_or_else(|| {
            AssetError::msg("artifact collection has no main chunk bundle")
        })?;
        let mut file = File::open(bundle).map_err(|err| AssetError::io(err, bundle))?;
        let table = chunkfile::load_chunk_table(&mut file, bundle)?;

        // verify everything is present before reading any payload
        for request in requests {
            chunkfile::find_chunk(bundle, &table, request.type_id, request.expected_version)
                .map_err(|err| {
                    trace!("request \"{}\" failed against \"{}\"", request.name, bundle.display());
                    err
                })?;
        }

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let header =
                chunkfile::find_chunk(bundle, &table, request.type_id, request.expected_version)?;
            let mut result =
                ChunkResult { offset: header.file_offset, size: header.size, data: None };
            if request.mode != ChunkLoadMode::DontLoad {
                let mut buffer = vec![0u8; header.size as usize];
                file.seek(SeekFrom::Start(header.file_offset as u64))
                    .map_err(|err| AssetError::io(err, bundle))?;
                file.read_exact(&mut buffer).map_err(|err| AssetError::io(err, bundle))?;
                if request.mode == ChunkLoadMode::BlockSerializer {
                    blocks::initialize(&mut buffer).map_err(|err| AssetError::Format {
                        path: bundle.to_path_buf(),
                        message: format!("chunk \"{}\": {err}", request.name),
                    })?;
                }
                result.data = Some(buffer);
            }
            results.push(result);
        }
        Ok(results)
    }
}

impl Drop for ArtifactCollection {
    fn drop(&mut self) {
        self.ref_counts.end_read(self.hash);
    }
}

impl std::fmt::Debug for ArtifactCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCollection")
            .field("request", &self.request)
            .field("state", &self.state())
            .field("products", &self.products.products.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunkfile::SerializedArtifact,
        depval::DependencyTracker,
        manifest::CompileProduct,
        VersionInfo,
    };
    use std::fs;

    const SKIN: u64 = 0x11;
    const SKELETON: u64 = 0x22;

    fn build_collection(dir: &Path, refs: &Arc<StoreReferenceCounts>) -> ArtifactCollection {
        let chunks = vec![
            SerializedArtifact { type_id: SKIN, version: 1, name: "skin".into(), data: b"mesh".to_vec() },
            SerializedArtifact {
                type_id: SKELETON,
                version: 2,
                name: "skel".into(),
                data: {
                    let mut builder = blocks::BlockBuilder::new();
                    builder.write_pointer(8);
                    builder.write_bytes(b"bones");
                    builder.finish()
                },
            },
        ];
        let bundle = dir.join("chest.dae.chunk");
        let mut file = fs::File::create(&bundle).unwrap();
        let version = VersionInfo { version: "t".into(), build_date: "d".into() };
        chunkfile::build_chunk_file(&mut file, &chunks, &version, |_| true).unwrap();
        drop(file);

        let mut products = CompileProducts::new(AssetState::Ready);
        products.products.push(CompileProduct { type_id: CHUNK_TYPE_MULTI, artifact: bundle });

        let tracker = DependencyTracker::new(false);
        ArtifactCollection::new(
            "chest.dae".to_string(),
            products,
            tracker.make_validation(),
            Arc::clone(refs),
            42,
        )
    }

    #[test]
    fn resolves_requests_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let refs = Arc::new(StoreReferenceCounts::default());
        let collection = build_collection(dir.path(), &refs);

        let results = collection
            .resolve_requests(&[
                ChunkRequest {
                    name: "skeleton",
                    type_id: SKELETON,
                    expected_version: 2,
                    mode: ChunkLoadMode::BlockSerializer,
                },
                ChunkRequest {
                    name: "skin",
                    type_id: SKIN,
                    expected_version: 1,
                    mode: ChunkLoadMode::Raw,
                },
                ChunkRequest {
                    name: "skin-span",
                    type_id: SKIN,
                    expected_version: 1,
                    mode: ChunkLoadMode::DontLoad,
                },
            ])
            .unwrap();

        assert_eq!(results.len(), 3);
        // block-serialized chunk was fixed up: body is the patched payload
        let skeleton = results[0].data.as_ref().unwrap();
        assert_eq!(&skeleton[skeleton.len() - 5..], b"bones");
        assert_eq!(results[1].data.as_deref(), Some(&b"mesh"[..]));
        assert!(results[2].data.is_none());
        assert!(results[2].size > 0);
    }

    #[test]
    fn missing_chunk_fails_the_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let refs = Arc::new(StoreReferenceCounts::default());
        let collection = build_collection(dir.path(), &refs);

        let err = collection
            .resolve_requests(&[ChunkRequest {
                name: "anim",
                type_id: 0x99,
                expected_version: 1,
                mode: ChunkLoadMode::Raw,
            }])
            .unwrap_err();
        assert!(matches!(err, AssetError::MissingChunk { type_id: 0x99, .. }));
    }

    #[test]
    fn version_mismatch_is_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let refs = Arc::new(StoreReferenceCounts::default());
        let collection = build_collection(dir.path(), &refs);

        let err = collection
            .resolve_requests(&[ChunkRequest {
                name: "skin",
                type_id: SKIN,
                expected_version: 9,
                mode: ChunkLoadMode::Raw,
            }])
            .unwrap_err();
        assert!(matches!(err, AssetError::UnsupportedVersion { expected: 9, actual: 1, .. }));
    }

    #[test]
    fn invalid_collections_refuse_resolution() {
        let refs = Arc::new(StoreReferenceCounts::default());
        let tracker = DependencyTracker::new(false);
        let collection = ArtifactCollection::new(
            "broken.dae".to_string(),
            CompileProducts::new(AssetState::Invalid),
            tracker.make_validation(),
            Arc::clone(&refs),
            1,
        );

        let err = collection
            .resolve_requests(&[ChunkRequest {
                name: "skin",
                type_id: SKIN,
                expected_version: 1,
                mode: ChunkLoadMode::Raw,
            }])
            .unwrap_err();
        assert!(matches!(err, AssetError::InvalidAsset { name, .. } if name == "broken.dae"));
    }

    #[test]
    fn read_reference_is_held_for_the_collection_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let refs = Arc::new(StoreReferenceCounts::default());
        let collection = build_collection(dir.path(), &refs);
        assert_eq!(refs.readers(42), 1);
        drop(collection);
        assert_eq!(refs.readers(42), 0);
    }
}
