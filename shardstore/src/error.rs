use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Error taxonomy shared by the device and every [`ObjectStoreClient`](crate::ObjectStoreClient).
///
/// Backends map their native failures onto these kinds; the device passes
/// them through to the caller unchanged.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Malformed or empty logical name / key.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("object not found: {0}")]
    NotFound(String),

    /// Transport, authentication or service failure.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A non-final part is smaller than the backend minimum.
    #[error("part {part_number} is {size} bytes, below the minimum part size of {minimum} bytes")]
    PartSizeViolation {
        part_number: u32,
        size: usize,
        minimum: usize,
    },

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    /// The upload session handed in does not belong to this upload.
    #[error("upload session mismatch: {0}")]
    SessionMismatch(String),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("size mismatch after upload: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns true for [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
