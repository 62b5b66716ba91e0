//! Error types for attache.

use thiserror::Error;

/// Result type alias using attache's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for attachment operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Blob is not (or no longer) registered
    #[error("Blob not found: {0}")]
    BlobNotFound(uuid::Uuid),

    /// Slot name was never declared for the owner type
    #[error("Unknown attachment slot: {0}")]
    UnknownSlot(String),

    /// Attachable input matched none of the recognized shapes
    #[error("Could not find or build blob: expected attachable, got {0}")]
    InvalidAttachable(String),

    /// Attempted to attach nothing
    #[error("Cannot attach nil to {0}")]
    Unattachable(String),

    /// Signed ID was malformed, tampered with, expired, or for another purpose
    #[error("Invalid signed id: {0}")]
    InvalidSignedId(String),

    /// Owner has no durable identity yet
    #[error("Owner not persisted: {0}")]
    OwnerNotPersisted(String),

    /// Owner failed validation; the surrounding write was rolled back
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Content store operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Deferred task queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
