use thiserror::Error;

/// Record store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection or command failure in the storage backend
    #[error("store backend: {0}")]
    Backend(String),
    /// A record could not be encoded or decoded
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}
