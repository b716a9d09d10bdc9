//! Error types for the record store and counters.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store file not found: {0}")]
    StoreNotFound(PathBuf),

    #[error("Record {0} not in use")]
    InvalidRecord(u64),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid id generator: {0}")]
    InvalidIdGenerator(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store requires rebuild before use: {0}")]
    StoreNotOk(String),

    #[error("Store is closed")]
    Closed,

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store is read-only")]
    ReadOnly,

    #[error("Counter mismatch for {context}: legacy {legacy:?}, current {current:?}")]
    CountsMismatch {
        context: String,
        legacy: (i64, i64),
        current: (i64, i64),
    },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Page {0} out of bounds")]
    PageOutOfBounds(u64),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
