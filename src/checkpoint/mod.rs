//! Checkpoint module for durable, resumable filtering runs.
//!
//! Provides:
//! - `write_kept_rows`: Atomic rewrite of the filtered table
//! - `CheckpointState`: Decisions and counters accumulated during a run
//! - `CheckpointManager`: Interval tracking, persistence and resume

mod state;
mod table;

pub use state::*;
pub use table::*;
