//! Sliding tick-window over an on-disk transaction record stream.
//!
//! An [`IntervalWindowService`] owns a [`RecordReader`] and a background
//! worker that keeps a window of transaction intervals, buffered around
//! the viewer's active cycle, loaded into an interval skip list.
//! Foreground [`stabbing_query`](IntervalWindow::stabbing_query) calls are
//! O(log n + k) against the in-memory window; a query that jumps outside
//! the window blocks until the worker has re-centered it.

mod record;
mod window;


pub use crate::record::{
    RecordKind, TransactionInterval, MAX_ANNOTATION_BYTES, RECORD_TYPE_MASK,
};
pub use crate::window::{IntervalWindow, IntervalWindowService, RecordReader, WindowConfig};

/// Simulation tick (cycle) number.
pub type Tick = u64;
