use std::{
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = AssetError> = std::result::Result<T, E>;

/// Errors produced by the asset pipeline.
///
/// `FileNotFound` and `UnsupportedVersion` are recoverable at the store
/// boundary: they mean "no usable cached result" and trigger a rebuild
/// instead of surfacing to the caller.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error(transparent)]
    Io(#[from] AssetIoError),
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("format error in \"{path}\": {message}")]
    Format { path: PathBuf, message: String },
    #[error("unsupported version in \"{path}\": expected {expected}, got {actual}")]
    UnsupportedVersion { path: PathBuf, expected: u32, actual: u32 },
    #[error("missing chunk {type_id:#018x} in \"{path}\"")]
    MissingChunk { path: PathBuf, type_id: u64 },
    #[error("no compiler registered for request \"{0}\"")]
    NoCompiler(String),
    #[error("compiler failure for \"{initializer}\": {message}")]
    CompilerFailure { initializer: String, message: String },
    #[error("invalid asset \"{name}\": {message}")]
    InvalidAsset { name: String, message: String },
    #[error("asset dependency error: {0}")]
    AssetDependency(String),
    #[error("{0}")]
    Message(String),
}

impl AssetError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        AssetIoError::new(err, path).into()
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        AssetError::Message(msg.to_string())
    }

    /// Returns true for error kinds the store converts into "no cached
    /// result" rather than reporting to the caller.
    pub fn is_recoverable(&self) -> bool {
        match self {
            AssetError::FileNotFound(_) | AssetError::UnsupportedVersion { .. } => true,
            AssetError::Io(err) => err.source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// An `io::Error` paired with the path that produced it.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {source}", .path.display())]
pub struct AssetIoError {
    #[source]
    source: io::Error,
    path: PathBuf,
}

impl AssetIoError {
    pub fn new(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { source, path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> &io::Error {
        &self.source
    }
}

impl From<AssetIoError> for io::Error {
    fn from(value: AssetIoError) -> Self {
        value.source
    }
}
