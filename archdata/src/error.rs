use crate::{LineIndex, Offset, SegmentId};
use thiserror::Error;

/// Segment registration and layout failures. These are programming errors
/// on the simulator side; there is no retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("line size {0} is not a power of two")]
    LineSizeNotPowerOfTwo(Offset),

    #[error("line size {got} exceeds the maximum of {max}")]
    LineSizeTooLarge { got: Offset, max: Offset },

    #[error("initial fill size {0} must be 1, 2, 4 or 8 bytes")]
    BadFillSize(u16),

    #[error("initial fill {fill:#x} has nonzero bits above its {size}-byte pattern")]
    FillOverflow { fill: u64, size: u16 },

    #[error("archdata is already laid out")]
    AlreadyLaidOut,

    #[error("archdata is not laid out yet")]
    NotLaidOut,

    #[error("duplicate segment id {0}")]
    DuplicateSegment(SegmentId),

    #[error("segment {0} has zero size")]
    ZeroSizeSegment(SegmentId),

    #[error("segment {id} size {size} is not a power of two")]
    SegmentSizeNotPowerOfTwo { id: SegmentId, size: Offset },

    #[error("segment {id} of {size} B exceeds the line size {line_size}")]
    SegmentExceedsLine {
        id: SegmentId,
        size: Offset,
        line_size: Offset,
    },

    #[error("segment {id} is a subset of unknown segment {parent}")]
    UnknownParent { id: SegmentId, parent: SegmentId },

    #[error(
        "segment {id} at subset offset {subset_offset:#x} with {size} B \
         exceeds parent {parent} of {parent_size} B"
    )]
    SubsetOverflow {
        id: SegmentId,
        parent: SegmentId,
        subset_offset: Offset,
        size: Offset,
        parent_size: Offset,
    },

    #[error("segment {id} initial value holds {got} B but the segment is {expected} B")]
    InitialSizeMismatch {
        id: SegmentId,
        expected: Offset,
        got: usize,
    },

    #[error("cannot layout a range when {0} segments are registered")]
    RangeWithSegments(usize),

    #[error("no segment with id {0}")]
    UnknownSegment(SegmentId),
}

/// Out-of-bounds or malformed accesses. Also programming errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("offset {offset:#x} is outside this archdata of {size:#x} B")]
    OutOfRange { offset: Offset, size: Offset },

    #[error("access at line offset {offset:#x}+{len} B exceeds the line size {line_size}")]
    OutOfBounds {
        offset: Offset,
        len: usize,
        line_size: u32,
    },

    #[error("access size {0} must be a nonzero power of two no larger than the line")]
    BadAccessSize(usize),

    #[error("line {idx} starts past the end of this archdata ({size:#x} B)")]
    LineBeyondEnd { idx: LineIndex, size: Offset },
}

/// Malformed checkpoint data reported by a [`storage`](crate::storage)
/// sink or source. Surfaced to checkpointer callers as restore corruption.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("line {0} stored twice in a row")]
    DuplicateLine(LineIndex),

    #[error("line bytes written without an open line")]
    NoOpenLine,

    #[error("unexpected control tag {0:#04x} in checkpoint stream")]
    UnknownTag(u8),

    #[error("checkpoint stream ended prematurely")]
    UnexpectedEnd,

    #[error("kept reading past the end of checkpoint data")]
    PastEnd,

    #[error("stored line holds {stored} B but {expected} B were requested")]
    SizeMismatch { stored: usize, expected: usize },

    #[error("restored line {idx} lies outside the region of {size:#x} B")]
    LineOutOfRegion { idx: LineIndex, size: Offset },
}
