use std::path::PathBuf;
use thiserror::Error;

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload offset mismatch: expected {expected}, got {got}")]
    OffsetMismatch { expected: u64, got: u64 },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Wrong headers: {0}")]
    WrongHeaders(String),

    #[error("Staged file {found} does not match session file {expected}")]
    PathIntegrity { expected: String, found: String },

    #[error("Storage I/O failed during {op}: {from:?} -> {to:?}: {source}")]
    StorageIo {
        op: &'static str,
        from: Option<PathBuf>,
        to: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload not found")]
    NotFound,

    #[error("Upload session already promoted")]
    AlreadyPromoted,

    #[error("Chunk of {len} bytes at offset {offset} exceeds upload length {size}")]
    ChunkOverflow { offset: u64, len: u64, size: u64 },

    #[error("Upload length {size} exceeds maximum allowed {max}")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session store error: {0}")]
    Store(String),
}

impl UploadError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UploadError::StorageIo {
            op,
            from: Some(path.into()),
            to: None,
            source,
        }
    }

    pub fn io_move(
        op: &'static str,
        from: impl Into<PathBuf>,
        to: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        UploadError::StorageIo {
            op,
            from: Some(from.into()),
            to: Some(to.into()),
            source,
        }
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(e: serde_json::Error) -> Self {
        UploadError::Store(e.to_string())
    }
}
