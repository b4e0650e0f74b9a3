//! Error types for the blob store.

/// Errors that can occur when working with a blob store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Default(#[from] anyhow::Error),

    /// Object storage error
    #[error("object storage error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The object does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The store URL could not be parsed or uses an unknown scheme
    #[error("invalid store url: {0}")]
    InvalidUrl(String),

    /// The requested byte range lies outside the object
    #[error("invalid range {start}..{end} for {path}")]
    InvalidRange { path: String, start: u64, end: u64 },

    /// S3 bucket not found - must be created before use
    #[error("S3 bucket '{0}' does not exist. Create it before opening a safe on it.")]
    BucketNotFound(String),
}

impl StoreError {
    /// Whether the error means the object (or directory) is absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::ObjectStore(object_store::Error::NotFound { .. }) => true,
            StoreError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result type alias for blob store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
