use lanchat_shared::ProtocolError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Generic I/O error (disk full, permission denied, ...).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored file is not valid JSON of the expected shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid identity or pair supplied by the caller.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An attachment path that escapes its pair directory.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Expected record does not exist.
    #[error("Record not found")]
    NotFound,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
