//! Attachment of external compiler libraries.
//!
//! A compiler library is a shared library exporting the entry points
//! described in [`super::abi`]. Attachment resolves the well-known
//! symbols, runs `AttachLibrary`, and caches the compiler description so
//! extension routing never has to call back into the library.

use super::{abi, AssetCompiler, CompileOperation, CompilerDesc, FileKind, TargetDesc};
use crate::{
    chunkfile::SerializedArtifact,
    error::{AssetError, Result},
    VersionInfo,
};
use glob::Pattern;
use libloading::Library;
use std::{
    ffi::{CStr, CString},
    os::raw::c_char,
    path::{Path, PathBuf},
    slice,
    sync::Arc,
};
use walkdir::WalkDir;

/// Scans each directory (non-recursively) for library candidates matching
/// `*Conversion.<platform suffix>`.
pub fn discover_library_candidates(directories: &[PathBuf]) -> Vec<PathBuf> {
    let Ok(pattern) = Pattern::new(&format!("*Conversion.{}", std::env::consts::DLL_EXTENSION))
    else {
        return Vec::new();
    };

    let mut candidates = Vec::new();
    for directory in directories {
        for entry in WalkDir::new(directory).max_depth(1).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            if pattern.matches(&entry.file_name().to_string_lossy()) {
                let path = entry.into_path();
                let path = crate::utils::canonicalize(&path).unwrap_or(path);
                candidates.push(path);
            }
        }
    }
    candidates.sort();
    candidates.dedup();
    candidates
}

struct LibraryInner {
    path: PathBuf,
    desc: CompilerDesc,
    version: VersionInfo,
    create: abi::CreateCompileOperationFn,
    detach: Option<abi::DetachLibraryFn>,
    // dropped last: the function pointers above point into this mapping
    _library: Library,
}

impl Drop for LibraryInner {
    fn drop(&mut self) {
        if let Some(detach) = self.detach {
            unsafe { detach() };
        }
    }
}

/// A loaded compiler library. Cheap to clone; the mapping stays attached
/// until the last clone and every outstanding operation are gone.
#[derive(Clone)]
pub struct CompilerLibrary {
    inner: Arc<LibraryInner>,
}

impl CompilerLibrary {
    /// Loads the library and resolves its entry points.
    ///
    /// `GetCompilerDesc` and `GetVersionInformation` are optional; a
    /// library without them simply advertises no file kinds. A library
    /// without `CreateCompileOperation` cannot compile anything and is
    /// rejected outright.
    pub fn attach(path: &Path) -> Result<Self> {
        let library = unsafe { Library::new(path) }.map_err(|err| {
            AssetError::msg(format!(
                "could not load compiler library \"{}\": {err}",
                path.display()
            ))
        })?;

        unsafe {
            let create = *library
                .get::<abi::CreateCompileOperationFn>(abi::SYM_CREATE_COMPILE_OPERATION)
                .map_err(|err| {
                    AssetError::msg(format!(
                        "compiler library \"{}\" is missing CreateCompileOperation: {err}",
                        path.display()
                    ))
                })?;

            if let Ok(attach) = library.get::<abi::AttachLibraryFn>(abi::SYM_ATTACH_LIBRARY) {
                let globals = abi::RawLibraryGlobals {
                    abi_version: abi::ABI_VERSION,
                    log: Some(forward_library_log),
                };
                let status = attach(&globals);
                if status != 0 {
                    return Err(AssetError::msg(format!(
                        "AttachLibrary failed with status {status} for \"{}\"",
                        path.display()
                    )));
                }
            }

            let desc = match library.get::<abi::GetCompilerDescFn>(abi::SYM_GET_COMPILER_DESC) {
                Ok(get_desc) => read_compiler_desc(get_desc()),
                Err(_) => CompilerDesc::default(),
            };
            let version = match library
                .get::<abi::GetVersionInformationFn>(abi::SYM_GET_VERSION_INFORMATION)
            {
                Ok(get_version) => {
                    let raw = get_version();
                    VersionInfo {
                        version: read_c_string(raw.version),
                        build_date: read_c_string(raw.build_date),
                    }
                }
                Err(_) => VersionInfo::default(),
            };
            let detach =
                library.get::<abi::DetachLibraryFn>(abi::SYM_DETACH_LIBRARY).ok().map(|sym| *sym);

            Ok(Self {
                inner: Arc::new(LibraryInner {
                    path: path.to_path_buf(),
                    desc,
                    version,
                    create,
                    detach,
                    _library: library,
                }),
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl AssetCompiler for CompilerLibrary {
    fn description(&self) -> CompilerDesc {
        self.inner.desc.clone()
    }

    fn version_information(&self) -> VersionInfo {
        self.inner.version.clone()
    }

    fn create_compile_operation(&self, identifier: &str) -> Result<Box<dyn CompileOperation>> {
        let identifier_c = CString::new(identifier).map_err(|_| {
            AssetError::msg(format!("request name \"{identifier}\" contains a NUL byte"))
        })?;
        let raw = unsafe { (self.inner.create)(identifier_c.as_ptr()) };
        if raw.is_null() {
            return Err(AssetError::CompilerFailure {
                initializer: identifier.to_string(),
                message: format!(
                    "\"{}\" refused to create a compile operation",
                    self.inner.path.display()
                ),
            });
        }
        Ok(Box::new(LibraryCompileOperation { raw, _library: Arc::clone(&self.inner) }))
    }
}

impl std::fmt::Debug for CompilerLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerLibrary")
            .field("path", &self.inner.path)
            .field("name", &self.inner.desc.name)
            .finish()
    }
}

struct LibraryCompileOperation {
    raw: *mut abi::RawCompileOperation,
    _library: Arc<LibraryInner>,
}

// The handle is an opaque pointer the ABI requires to be usable from any
// single thread at a time; the worker owns the operation exclusively.
unsafe impl Send for LibraryCompileOperation {}

impl CompileOperation for LibraryCompileOperation {
    fn target_count(&self) -> usize {
        unsafe { ((*self.raw).target_count)(self.raw) as usize }
    }

    fn target(&self, index: usize) -> TargetDesc {
        let raw = unsafe { ((*self.raw).get_target)(self.raw, index as u32) };
        TargetDesc { type_code: raw.type_code, name: read_c_string(raw.name) }
    }

    fn serialize_target(&mut self, index: usize) -> Result<Vec<SerializedArtifact>> {
        let mut list = abi::RawChunkList::empty();
        let status = unsafe { ((*self.raw).serialize_target)(self.raw, index as u32, &mut list) };
        if status != 0 {
            release_chunk_list(&mut list);
            return Err(AssetError::msg(format!(
                "serialize_target({index}) failed with status {status}"
            )));
        }

        let mut artifacts = Vec::with_capacity(list.count as usize);
        if !list.chunks.is_null() {
            let chunks = unsafe { slice::from_raw_parts(list.chunks, list.count as usize) };
            for chunk in chunks {
                let data = if chunk.data.is_null() {
                    Vec::new()
                } else {
                    unsafe { slice::from_raw_parts(chunk.data, chunk.data_len) }.to_vec()
                };
                artifacts.push(SerializedArtifact {
                    type_id: chunk.type_id,
                    version: chunk.version,
                    name: read_c_string(chunk.name),
                    data,
                });
            }
        }
        release_chunk_list(&mut list);
        Ok(artifacts)
    }

    fn dependencies(&self) -> Vec<PathBuf> {
        let Some(list_dependencies) = (unsafe { (*self.raw).list_dependencies }) else {
            return Vec::new();
        };
        let mut list = abi::RawPathList::empty();
        let status = unsafe { list_dependencies(self.raw, &mut list) };
        if status != 0 {
            release_path_list(&mut list);
            return Vec::new();
        }

        let mut paths = Vec::with_capacity(list.count as usize);
        if !list.paths.is_null() {
            let raw_paths = unsafe { slice::from_raw_parts(list.paths, list.count as usize) };
            for &raw_path in raw_paths {
                paths.push(PathBuf::from(read_c_string(raw_path)));
            }
        }
        release_path_list(&mut list);
        paths
    }
}

impl Drop for LibraryCompileOperation {
    fn drop(&mut self) {
        unsafe { ((*self.raw).dispose)(self.raw) };
    }
}

fn release_chunk_list(list: &mut abi::RawChunkList) {
    if let Some(release) = list.release.take() {
        unsafe { release(list) };
    }
}

fn release_path_list(list: &mut abi::RawPathList) {
    if let Some(release) = list.release.take() {
        unsafe { release(list) };
    }
}

fn read_c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

unsafe fn read_compiler_desc(raw: *const abi::RawCompilerDesc) -> CompilerDesc {
    if raw.is_null() {
        return CompilerDesc::default();
    }
    let raw = &*raw;
    let mut file_kinds = Vec::with_capacity(raw.file_kind_count as usize);
    if !raw.file_kinds.is_null() {
        for kind in slice::from_raw_parts(raw.file_kinds, raw.file_kind_count as usize) {
            file_kinds.push(FileKind {
                extension: read_c_string(kind.extension),
                type_mask: kind.type_mask,
            });
        }
    }
    CompilerDesc { name: read_c_string(raw.name), file_kinds }
}

unsafe extern "C" fn forward_library_log(level: i32, message: *const c_char) {
    let message = read_c_string(message);
    match level {
        0 => trace!("[compiler library] {message}"),
        1 => debug!("[compiler library] {message}"),
        2 => warn!("[compiler library] {message}"),
        _ => error!("[compiler library] {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discovery_matches_the_conversion_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let suffix = std::env::consts::DLL_EXTENSION;
        let model = dir.path().join(format!("ModelConversion.{suffix}"));
        fs::write(&model, b"").unwrap();
        fs::write(dir.path().join("Readme.txt"), b"").unwrap();
        fs::write(dir.path().join(format!("Other.{suffix}")), b"").unwrap();

        let candidates = discover_library_candidates(&[dir.path().to_path_buf()]);
        let expected = crate::utils::canonicalize(&model).unwrap_or(model);
        assert_eq!(candidates, vec![expected]);
    }

    #[test]
    fn discovery_tolerates_missing_directories() {
        let candidates = discover_library_candidates(&[PathBuf::from("/definitely/not/here")]);
        assert!(candidates.is_empty());
    }

    #[test]
    fn attaching_a_non_library_fails() {
        let dir = tempfile::tempdir().unwrap();
        let suffix = std::env::consts::DLL_EXTENSION;
        let bogus = dir.path().join(format!("BogusConversion.{suffix}"));
        fs::write(&bogus, b"not a shared library").unwrap();
        assert!(CompilerLibrary::attach(&bogus).is_err());
    }
}
