use crate::Offset;

/// Distinguishes segments registered in the same archdata.
pub type SegmentId = u32;

/// Declaration of a logical sub-region before layout assigns it a home.
#[derive(Debug, Clone)]
pub struct SegmentSpec {
    /// Identifier, unique within the owning archdata.
    pub id: SegmentId,
    /// Size in bytes. Must be a nonzero power of two no larger than a line.
    pub size: Offset,
    /// Segment this one is laid out inside of, if any.
    pub subset_of: Option<SegmentId>,
    /// Offset within the parent segment. Ignored unless `subset_of` is set.
    pub subset_offset: Offset,
    /// Bytes written into the segment at layout and on every reset.
    pub initial: Option<Vec<u8>>,
}

impl SegmentSpec {
    pub fn new(id: SegmentId, size: Offset) -> SegmentSpec {
        SegmentSpec {
            id,
            size,
            subset_of: None,
            subset_offset: 0,
            initial: None,
        }
    }

    /// Lay this segment out inside `parent` at `offset`.
    pub fn subset_of(mut self, parent: SegmentId, offset: Offset) -> SegmentSpec {
        self.subset_of = Some(parent);
        self.subset_offset = offset;
        self
    }

    /// Initial value written at layout and on reset. The byte count must
    /// match the segment size; this is checked at registration.
    pub fn initial(mut self, bytes: Vec<u8>) -> SegmentSpec {
        self.initial = Some(bytes);
        self
    }
}

/// A registered segment, placed once layout completes.
#[derive(Debug, Clone)]
pub struct Segment {
    pub(crate) spec: SegmentSpec,
    pub(crate) offset: Option<Offset>,
}

impl Segment {
    pub fn id(&self) -> SegmentId {
        self.spec.id
    }

    pub fn size(&self) -> Offset {
        self.spec.size
    }

    pub fn subset_of(&self) -> Option<SegmentId> {
        self.spec.subset_of
    }

    pub fn subset_offset(&self) -> Offset {
        self.spec.subset_offset
    }

    /// Absolute offset within the archdata. `None` until layout runs.
    pub fn offset(&self) -> Option<Offset> {
        self.offset
    }

    pub fn is_placed(&self) -> bool {
        self.offset.is_some()
    }
}
