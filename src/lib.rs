//! # pagevault
//!
//! A single-file paged storage engine with:
//! - Bitmap free-space allocation with extent coalescing
//! - A name → location block registry persisted in batches
//! - A self-describing binary row codec with overflow chains
//! - Write-Ahead Logging (WAL) with crash replay
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Storage Provider                          │
//! │       (write_block / read_block / free_block / flush)        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!     ┌─────────────────┼──────────────────┬──────────────────┐
//!     │                 │                  │                  │
//!     ▼                 ▼                  ▼                  ▼
//! ┌─────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │   Row   │    │  Overflow   │    │    Block    │    │     WAL     │
//! │  Codec  │───►│   Chains    │    │  Registry   │    │  (Append)   │
//! └─────────┘    └──────┬──────┘    └──────┬──────┘    └─────────────┘
//!                       │                  │
//!                       ▼                  ▼
//!                ┌─────────────────────────────────┐
//!                │       Free Space Manager         │
//!                │    (bitmap + free extents)       │
//!                └─────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! page 0        header slots A and B (512 bytes each)
//! pages 1..=W   WAL region
//! pages W+1..   registry region, FSM snapshot, data and overflow pages
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod checksum;
pub mod cancel;

pub mod io;
pub mod fsm;
pub mod registry;
pub mod row;
pub mod overflow;
pub mod wal;
pub mod txn;
pub mod provider;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, VaultError};
pub use config::{AllocationStrategy, Config, WalSyncStrategy};
pub use cancel::{CancelToken, WriteOptions};
pub use checksum::Checksum;
pub use overflow::CompressionAlgorithm;
pub use provider::{OrphanReport, ProviderStats, StorageProvider, VerifyReport};
pub use registry::BlockEntry;
pub use row::{Row, Value};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of pagevault
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
