//! Utility functions

use crate::error::{AssetError, AssetIoError, Result};
use std::{
    fs,
    path::{Component, Path, PathBuf},
    time::UNIX_EPOCH,
};

/// 64-bit FNV-1a, usable in const position so chunk-type identifiers and
/// request hashes share one stable hash.
pub const fn hash64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash
}

/// A request name split into its parts: `path/to/file.ext[:parameters]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitRequest<'a> {
    /// Everything before the parameter divider.
    pub path: &'a str,
    /// File extension of `path`, without the dot.
    pub extension: &'a str,
    /// The sub-selector after `:`, without the divider itself.
    pub parameters: &'a str,
}

/// Splits a request name into path, extension and colon parameters.
///
/// The divider is the first `:` after the final path separator, so drive
/// prefixes like `c:/` survive intact.
pub fn split_request(request: &str) -> SplitRequest<'_> {
    let name_start = request.rfind(['/', '\\']).map(|i| i + 1).unwrap_or(0);
    let (path, parameters) = match request[name_start..].find(':') {
        Some(i) => (&request[..name_start + i], &request[name_start + i + 1..]),
        None => (request, ""),
    };
    let extension = match path[name_start..].rfind('.') {
        Some(i) => &path[name_start + i + 1..],
        None => "",
    };
    SplitRequest { path, extension, parameters }
}

/// Lexically simplifies a path: resolves `.` and `..` components without
/// touching the filesystem.
pub fn simplify_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Canonicalize the path, returning an error that carries the path on failure.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf, AssetIoError> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| AssetIoError::new(err, path))
}

/// Reads the file's modification time as milliseconds since the epoch.
/// Returns `None` when the file does not exist or the time is unavailable.
pub fn modification_time(path: impl AsRef<Path>) -> Option<u64> {
    let metadata = fs::metadata(path.as_ref()).ok()?;
    let modified = metadata.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as u64)
}

pub fn read_to_vec(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => AssetError::FileNotFound(path.to_path_buf()),
        _ => AssetError::io(err, path),
    })
}

pub fn read_to_string(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => AssetError::FileNotFound(path.to_path_buf()),
        _ => AssetError::io(err, path),
    })
}

/// Creates all parent directories of the given file path.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AssetError::msg(format!(
                "Failed to create artifact parent folder \"{}\": {err}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}

/// Copies a fixed-size, null-padded field out of a string, truncating on
/// overflow. Used for the build-version fields of the chunk-file header.
pub fn copy_padded<const N: usize>(value: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = value.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Reverses [`copy_padded`]: interprets a null-padded field as UTF-8,
/// dropping trailing padding and any invalid tail.
pub fn from_padded(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
