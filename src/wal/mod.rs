//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Append log entries before any mutation
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering
//! - Per-transaction state: Open → Committed | RolledBack
//! - Crash recovery and replay
//!
//! ## Region Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Page 0: region header                   │
//! │ magic, version, checkpoint LSN, resets  │
//! ├─────────────────────────────────────────┤
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The log is a fixed region inside the storage file. A checkpoint resets
//! the append position to the first frame; LSNs keep increasing, so frames
//! left over from before the reset never look like the next entry.

mod entry;
mod reader;
mod recovery;
mod region;
mod writer;

pub use entry::{EntryType, FrameHeader, Operation, WalEntry, HEADER_SIZE, MAX_FRAME_OVERHEAD};
pub use reader::WalReader;
pub use recovery::{RecoveryResult, WalRecovery, WalScan};
pub use region::{WalRegion, WalRegionHeader};
pub use writer::{TxnState, WalWriter, OUTCOME_RESERVE};
