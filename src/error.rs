//! Error types for pmlsm
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using LsmError
pub type Result<T> = std::result::Result<T, LsmError>;

/// Unified error type for pmlsm operations
#[derive(Debug, Error)]
pub enum LsmError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    /// The segment pool (or the SSD segment id space) has no free segment left
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    /// On-media state violates an invariant (key order, magic, checksum, ...)
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Manifest mismatch: {0}")]
    ManifestMismatch(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Client Errors
    // -------------------------------------------------------------------------
    /// The key collides with the block padding sentinel
    #[error("Invalid key: {0:#x} is reserved")]
    InvalidKey(u64),

    /// The value collides with the tombstone marker
    #[error("Invalid value: {0} is reserved")]
    InvalidValue(u64),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for LsmError {
    fn from(e: bincode::Error) -> Self {
        LsmError::Serialization(e.to_string())
    }
}
