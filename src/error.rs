//! Error types for the stream repository.

use crate::types::{Cid, StreamId, Timestamp};
use thiserror::Error;

/// Main error type for repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("Invalid sync option: {0}")]
    InvalidSyncOption(u8),

    #[error("Cannot unpin stream indexed under model {0}")]
    CannotUnpinIndexed(String),

    #[error("Pin store contract violation: {0}")]
    PinStoreContractViolation(String),

    #[error("{0} is closed")]
    QueueClosed(&'static str),

    #[error("Commit {commit} not in log of stream {stream}")]
    CommitNotInLog { stream: StreamId, commit: Cid },

    #[error("Stream has no anchor commit at or before {0}")]
    NoAnchorBefore(Timestamp),

    #[error("Capability expired at {0}")]
    CapabilityExpired(Timestamp),

    #[error("No handler registered for stream type {0}")]
    NoHandler(u8),

    #[error("Invalid commit: {0}")]
    InvalidCommit(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Repository dependencies not installed")]
    NotInitialized,

    #[error("Repository dependencies already installed")]
    AlreadyInitialized,
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RepositoryError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RepositoryError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RepositoryError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RepositoryError::Deserialization(e.to_string())
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;
