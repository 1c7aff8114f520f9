//! Simulator introspection and rollback: delta checkpointing over
//! line-paginated state regions, plus an interval-indexed view of the
//! per-cycle transaction stream.
//!
//! This crate re-exports the workspace members; see each for the details:
//!
//! - [`archdata`]: byte-addressable state regions with dirty tracking.
//! - [`checkpoint`]: the delta-checkpoint tree and its manager.
//! - [`db`]: the SQLite-backed windowed checkpoint overlay.
//! - [`interval`]: the interval skip list.
//! - [`window`]: the sliding tick-window over a transaction record stream.

pub use rewind_archdata as archdata;
pub use rewind_checkpoint as checkpoint;
pub use rewind_db as db;
pub use rewind_interval as interval;
pub use rewind_window as window;
