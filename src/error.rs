//! Error types for pagevault
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using VaultError
pub type Result<T> = std::result::Result<T, VaultError>;

/// Unified error type for pagevault operations
#[derive(Debug, Error)]
pub enum VaultError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Allocation Errors
    // -------------------------------------------------------------------------
    #[error("Out of space: {0}")]
    OutOfSpace(String),

    #[error("Invalid page range: {0}")]
    InvalidRange(String),

    // -------------------------------------------------------------------------
    // Record / Block Errors
    // -------------------------------------------------------------------------
    #[error("Record too large for page: {size} bytes exceeds {max} bytes")]
    RecordTooLargeForPage { size: usize, max: usize },

    #[error("Corrupt block '{name}': {reason}")]
    CorruptBlock { name: String, reason: String },

    #[error("Corrupt overflow chain at offset {offset}: {reason}")]
    CorruptChain { offset: u64, reason: String },

    // -------------------------------------------------------------------------
    // File Format Errors
    // -------------------------------------------------------------------------
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL replay failed: {0}")]
    ReplayFailure(String),

    #[error("WAL region full: {needed} bytes needed, {available} available")]
    WalFull { needed: u64, available: u64 },

    #[error("Transaction {0} is not open")]
    TransactionClosed(u64),

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

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Timed out waiting for {0} lock")]
    Timeout(&'static str),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<bincode::Error> for VaultError {
    fn from(err: bincode::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}
