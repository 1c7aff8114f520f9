//! Interval skip list for stabbing queries over large, churning interval
//! sets.
//!
//! The structure indexes half-open [`Interval`]s by their endpoints and
//! maintains per-edge marker sets so that a stabbing query (all intervals
//! covering a point) runs in O(log n + k) without scanning. Intervals are
//! referenced by caller-chosen handles; the caller owns the interval
//! payloads and the list holds only the bounds it needs for marker
//! maintenance.

mod interval;
mod skiplist;

#[cfg(test)]
mod tests;

pub use crate::interval::Interval;
pub use crate::skiplist::{IntervalHandle, IntervalSkipList, MAX_FORWARD};
