//! Byte-addressable, line-paginated regions of simulator state.
//!
//! An [`ArchData`] owns a sparse set of fixed-size [`Line`]s, each with a
//! dirty bit. Checkpointers walk the lines through the [`storage`] traits:
//! `save` emits only dirty lines (a delta), `save_all` emits every allocated
//! line (a snapshot), and the restore calls replay stored lines back onto
//! the region. Logical sub-regions are declared as [`Segment`]s and assigned
//! offsets by a one-shot layout pass; a [`DataView`] is a typed,
//! bounds-checked accessor over one placed segment.

mod archdata;
mod error;
mod scalar;
mod segment;
pub mod storage;
mod view;

#[cfg(test)]
mod tests;

pub use crate::archdata::{
    ArchData, Line, DEFAULT_INITIAL_FILL, DEFAULT_INITIAL_FILL_SIZE, DEFAULT_LINE_SIZE,
    HOST_WORD_SIZE, MAX_LINE_SIZE,
};
pub use crate::error::{AccessError, LayoutError, StorageError};
pub use crate::scalar::Scalar;
pub use crate::segment::{Segment, SegmentId, SegmentSpec};
pub use crate::view::DataView;

/// Byte offset into an [`ArchData`].
pub type Offset = u64;

/// Index of a [`Line`] within an [`ArchData`].
pub type LineIndex = u64;
