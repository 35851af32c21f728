//! Free Space Manager (FSM) Module
//!
//! Tracks which pages of the backing file are allocated.
//!
//! ## Responsibilities
//! - Serve contiguous and scattered page allocations
//! - Coalesce freed runs with their neighbours
//! - Grow the file geometrically when no free run is large enough
//! - Persist the page bitmap at checkpoint
//!
//! ## Structure
//! ```text
//! Level 1: one bit per page (1 = allocated)
//! ┌──┬──┬──┬──┬──┬──┬──┬──┬──┬──┬──┬──┐
//! │1 │1 │1 │0 │0 │0 │1 │1 │0 │0 │0 │0 │
//! └──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴──┴──┘
//!
//! Level 2: free extents (start, length)
//! ┌────────┬────────┐
//! │ (3, 3) │ (8, 4) │
//! └────────┴────────┘
//! ```
//!
//! Invariant: allocated bits == total pages - sum of extent lengths.

mod bitmap;
mod extents;
mod manager;

pub use bitmap::PageBitmap;
pub use extents::FreeExtents;
pub use manager::{FreeSpaceManager, FsmOptions, FsmStats};
