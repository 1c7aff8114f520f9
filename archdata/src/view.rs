use crate::error::{AccessError, LayoutError};
use crate::scalar::Scalar;
use crate::segment::SegmentId;
use crate::{ArchData, Line, Offset};
use byteorder::ByteOrder;

/// Typed accessor over one placed segment.
///
/// A view borrows the archdata for its lifetime, resolves the segment's
/// line once, and bounds-checks every access against the segment (which is
/// stricter than the line bound). Writes dirty the underlying line.
pub struct DataView<'a> {
    line: &'a mut Line,
    base: Offset,
    size: Offset,
}

impl ArchData {
    /// Builds a [`DataView`] over the segment `id`. Fails before layout or
    /// for unknown segments.
    pub fn view(&mut self, id: SegmentId) -> Result<DataView<'_>, LayoutError> {
        if !self.is_laid_out() {
            return Err(LayoutError::NotLaidOut);
        }
        let (offset, size) = {
            let seg = self.segment(id).ok_or(LayoutError::UnknownSegment(id))?;
            (seg.offset().ok_or(LayoutError::NotLaidOut)?, seg.size())
        };
        let line = self
            .line_at(offset)
            .expect("placed segments are in range");
        let base = offset - line.offset();
        Ok(DataView { line, base, size })
    }
}

impl<'a> DataView<'a> {
    /// Segment size in bytes.
    pub fn size(&self) -> Offset {
        self.size
    }

    fn check(&self, loc: Offset, len: usize) -> Result<(), AccessError> {
        if loc + len as Offset > self.size {
            return Err(AccessError::OutOfBounds {
                offset: loc,
                len,
                line_size: self.size as u32,
            });
        }
        Ok(())
    }

    /// Reads element `idx` of an array of `T` starting at the segment base.
    pub fn read<T: Scalar, B: ByteOrder>(&self, idx: u32) -> Result<T, AccessError> {
        let loc = (idx as Offset) * (T::SIZE as Offset);
        self.check(loc, T::SIZE)?;
        self.line.read::<T, B>(self.base + loc, 0)
    }

    /// Writes element `idx`; dirties the line.
    pub fn write<T: Scalar, B: ByteOrder>(&mut self, value: T, idx: u32) -> Result<(), AccessError> {
        let loc = (idx as Offset) * (T::SIZE as Offset);
        self.check(loc, T::SIZE)?;
        self.line.write::<T, B>(self.base + loc, value, 0)
    }

    /// Copies the whole segment content into `out`.
    pub fn read_bytes(&self, offset: Offset, out: &mut [u8]) -> Result<(), AccessError> {
        self.check(offset, out.len())?;
        self.line.read_bytes(self.base + offset, out)
    }

    /// Overwrites segment content; dirties the line.
    pub fn write_bytes(&mut self, offset: Offset, data: &[u8]) -> Result<(), AccessError> {
        self.check(offset, data.len())?;
        self.line.write_bytes(self.base + offset, data)
    }
}
