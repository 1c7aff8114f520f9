use crate::error::{AccessError, LayoutError, StorageError};
use crate::scalar::Scalar;
use crate::segment::{Segment, SegmentId, SegmentSpec};
use crate::storage::{LineSink, LineSource};
use crate::{LineIndex, Offset};
use byteorder::ByteOrder;
use std::collections::{BTreeMap, HashMap};

/// Default line size in bytes.
pub const DEFAULT_LINE_SIZE: Offset = 512;

/// Line size ceiling. A line size of 0 means a single unbounded line and is
/// not subject to this limit.
pub const MAX_LINE_SIZE: Offset = 0x8000_0000;

/// Default fill for freshly allocated memory.
pub const DEFAULT_INITIAL_FILL: u64 = 0xcc;

/// Default fill pattern width in bytes.
pub const DEFAULT_INITIAL_FILL_SIZE: u16 = 1;

/// Host word size; root segments are laid out on this alignment.
pub const HOST_WORD_SIZE: Offset = 8;

/// Writes the repeating fill pattern into `buf`. `phase` is the offset of
/// `buf` within the pattern alignment (`absolute_offset % fill_size`); the
/// pattern bytes are the little-endian rendering of `fill`.
fn fill_value(buf: &mut [u8], fill: u64, fill_size: u16, phase: usize) {
    if fill_size == 1 {
        buf.fill(fill as u8);
        return;
    }
    let pattern = fill.to_le_bytes();
    let width = fill_size as usize;
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = pattern[(i + phase) % width];
    }
}

/// One fixed-size page of an [`ArchData`]: the unit of dirty tracking and
/// checkpoint granularity. A freshly allocated line is dirty and holds the
/// initial-fill pattern.
#[derive(Debug)]
pub struct Line {
    idx: LineIndex,
    offset: Offset,
    size: u32,
    dirty: bool,
    data: Box<[u8]>,
}

impl Line {
    fn new(idx: LineIndex, offset: Offset, size: u32, fill: u64, fill_size: u16) -> Line {
        let mut data = vec![0u8; size as usize].into_boxed_slice();
        fill_value(&mut data, fill, fill_size, (offset % fill_size as u64) as usize);
        Line {
            idx,
            offset,
            size,
            dirty: true,
            data,
        }
    }

    pub fn idx(&self) -> LineIndex {
        self.idx
    }

    /// Absolute offset of this line within its archdata.
    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Modified since the last save or restore. True right after allocation.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Explicitly marks the line dirty; only save and restore clear it.
    pub fn flag_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn check_span(&self, offset: Offset, len: usize) -> Result<usize, AccessError> {
        let end = offset
            .checked_add(len as Offset)
            .ok_or(AccessError::OutOfBounds {
                offset,
                len,
                line_size: self.size,
            })?;
        if end > Offset::from(self.size) {
            return Err(AccessError::OutOfBounds {
                offset,
                len,
                line_size: self.size,
            });
        }
        Ok(offset as usize)
    }

    /// Typed read at `offset + idx * size_of::<T>()` within this line.
    pub fn read<T: Scalar, B: ByteOrder>(&self, offset: Offset, idx: u32) -> Result<T, AccessError> {
        let loc = offset + (idx as Offset) * (T::SIZE as Offset);
        let at = self.check_span(loc, T::SIZE)?;
        Ok(T::read_from::<B>(&self.data[at..at + T::SIZE]))
    }

    /// Typed write; sets the dirty bit.
    pub fn write<T: Scalar, B: ByteOrder>(
        &mut self,
        offset: Offset,
        value: T,
        idx: u32,
    ) -> Result<(), AccessError> {
        let loc = offset + (idx as Offset) * (T::SIZE as Offset);
        let at = self.check_span(loc, T::SIZE)?;
        value.write_to::<B>(&mut self.data[at..at + T::SIZE]);
        self.dirty = true;
        Ok(())
    }

    /// Copies `out.len()` bytes starting at `offset` within this line.
    pub fn read_bytes(&self, offset: Offset, out: &mut [u8]) -> Result<(), AccessError> {
        let at = self.check_span(offset, out.len())?;
        out.copy_from_slice(&self.data[at..at + out.len()]);
        Ok(())
    }

    /// Overwrites bytes starting at `offset`; sets the dirty bit.
    pub fn write_bytes(&mut self, offset: Offset, data: &[u8]) -> Result<(), AccessError> {
        let at = self.check_span(offset, data.len())?;
        self.data[at..at + data.len()].copy_from_slice(data);
        self.dirty = true;
        Ok(())
    }

    fn fill_with_initial(&mut self, fill: u64, fill_size: u16) {
        fill_value(
            &mut self.data,
            fill,
            fill_size,
            (self.offset % fill_size as u64) as usize,
        );
    }

    fn copy_from(&mut self, other: &Line) {
        debug_assert_eq!(self.size, other.size);
        self.data.copy_from_slice(&other.data);
        self.dirty = true;
    }
}

/// A contiguous region of simulator state, paginated into sparse [`Line`]s.
///
/// Segments are registered up front and assigned offsets by a one-shot
/// [`layout`](ArchData::layout); after layout the region can be accessed,
/// saved and restored. Lines are allocated on first touch and filled with
/// the configured pattern.
#[derive(Debug)]
pub struct ArchData {
    line_size: Offset,
    line_shift: u32,
    line_mask: Offset,
    initial: u64,
    initial_size: u16,
    can_free_lines: bool,
    lines: BTreeMap<LineIndex, Line>,
    segments: Vec<Segment>,
    size: Offset,
    laid_out: bool,
    lines_laid_out: u64,
    padding_waste: u64,
    line_waste: u64,
}

impl ArchData {
    /// `line_size` must be a power of two no larger than [`MAX_LINE_SIZE`],
    /// or 0 for a single unbounded line. `initial_size` selects how many
    /// bytes of `initial` repeat as the fill pattern; bits of `initial`
    /// above that width must be zero.
    pub fn new(
        line_size: Offset,
        initial: u64,
        initial_size: u16,
        can_free_lines: bool,
    ) -> Result<ArchData, LayoutError> {
        if !matches!(initial_size, 1 | 2 | 4 | 8) {
            return Err(LayoutError::BadFillSize(initial_size));
        }
        if initial_size < 8 && (initial >> (8 * initial_size as u64)) != 0 {
            return Err(LayoutError::FillOverflow {
                fill: initial,
                size: initial_size,
            });
        }
        let (line_shift, line_mask) = if line_size == 0 {
            (0, 0)
        } else {
            if !line_size.is_power_of_two() {
                return Err(LayoutError::LineSizeNotPowerOfTwo(line_size));
            }
            if line_size > MAX_LINE_SIZE {
                return Err(LayoutError::LineSizeTooLarge {
                    got: line_size,
                    max: MAX_LINE_SIZE,
                });
            }
            let shift = line_size.trailing_zeros();
            (shift, !(line_size - 1))
        };
        Ok(ArchData {
            line_size,
            line_shift,
            line_mask,
            initial,
            initial_size,
            can_free_lines,
            lines: BTreeMap::new(),
            segments: Vec::new(),
            size: 0,
            laid_out: false,
            lines_laid_out: 0,
            padding_waste: 0,
            line_waste: 0,
        })
    }

    pub fn line_size(&self) -> Offset {
        self.line_size
    }

    pub fn initial(&self) -> u64 {
        self.initial
    }

    pub fn initial_size(&self) -> u16 {
        self.initial_size
    }

    /// Whether `clean` may drop lines instead of refilling them. Regions
    /// with cached external pointers keep this false.
    pub fn can_free_lines(&self) -> bool {
        self.can_free_lines
    }

    pub fn is_laid_out(&self) -> bool {
        self.laid_out
    }

    /// Total laid-out size in bytes. Zero before layout.
    pub fn size(&self) -> Offset {
        self.size
    }

    pub fn num_allocated_lines(&self) -> usize {
        self.lines.len()
    }

    /// Bytes lost to host-word alignment padding during layout.
    pub fn padding_waste(&self) -> u64 {
        self.padding_waste
    }

    /// Bytes lost to line-boundary padding during layout.
    pub fn line_waste(&self) -> u64 {
        self.line_waste
    }

    pub fn total_waste(&self) -> u64 {
        self.padding_waste + self.line_waste
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.iter().find(|seg| seg.id() == id)
    }

    /// Index of the line containing `offset`. Purely numeric; the line need
    /// not be allocated.
    pub fn line_index(&self, offset: Offset) -> LineIndex {
        if self.line_size == 0 {
            0
        } else {
            offset >> self.line_shift
        }
    }

    /// Starting offset of line `idx`.
    pub fn line_offset(&self, idx: LineIndex) -> Offset {
        self.line_size * idx
    }

    pub fn contains_address(&self, offset: Offset) -> bool {
        offset < self.size
    }

    /// Registers a segment for the upcoming layout. All conflicts are
    /// detected eagerly so layout itself only resolves subset placement.
    pub fn register_segment(&mut self, spec: SegmentSpec) -> Result<(), LayoutError> {
        if self.laid_out {
            return Err(LayoutError::AlreadyLaidOut);
        }
        if spec.size == 0 {
            return Err(LayoutError::ZeroSizeSegment(spec.id));
        }
        if !spec.size.is_power_of_two() {
            return Err(LayoutError::SegmentSizeNotPowerOfTwo {
                id: spec.id,
                size: spec.size,
            });
        }
        if self.line_size != 0 && spec.size > self.line_size {
            return Err(LayoutError::SegmentExceedsLine {
                id: spec.id,
                size: spec.size,
                line_size: self.line_size,
            });
        }
        if self.segments.iter().any(|seg| seg.id() == spec.id) {
            return Err(LayoutError::DuplicateSegment(spec.id));
        }
        if let Some(initial) = &spec.initial {
            if initial.len() as Offset != spec.size {
                return Err(LayoutError::InitialSizeMismatch {
                    id: spec.id,
                    expected: spec.size,
                    got: initial.len(),
                });
            }
        }
        self.segments.push(Segment { spec, offset: None });
        Ok(())
    }

    /// Assigns every registered segment an absolute offset. Root segments
    /// are word-aligned and never straddle a line; subsets land inside
    /// their parents. One-shot: the layout must stay constant between
    /// saves and restores.
    pub fn layout(&mut self) -> Result<(), LayoutError> {
        if self.laid_out {
            return Err(LayoutError::AlreadyLaidOut);
        }
        let index: HashMap<SegmentId, usize> = self
            .segments
            .iter()
            .enumerate()
            .map(|(i, seg)| (seg.id(), i))
            .collect();
        for i in 0..self.segments.len() {
            self.place_segment(i, &index)?;
        }
        self.laid_out = true;
        self.write_segment_initials();
        rewind_logger::debug!(
            "laid out {} segments in {} B ({} B padding waste, {} B line waste)",
            self.segments.len(),
            self.size,
            self.padding_waste,
            self.line_waste
        );
        Ok(())
    }

    /// Lays out a segment-free region of `size` bytes (sparse memory use).
    pub fn layout_range(&mut self, size: Offset) -> Result<(), LayoutError> {
        if self.laid_out {
            return Err(LayoutError::AlreadyLaidOut);
        }
        if !self.segments.is_empty() {
            return Err(LayoutError::RangeWithSegments(self.segments.len()));
        }
        if self.line_size == 0 && size > Offset::from(u32::MAX) {
            return Err(LayoutError::LineSizeTooLarge {
                got: size,
                max: Offset::from(u32::MAX),
            });
        }
        self.size = size;
        self.laid_out = true;
        Ok(())
    }

    fn place_segment(
        &mut self,
        i: usize,
        index: &HashMap<SegmentId, usize>,
    ) -> Result<(), LayoutError> {
        if self.segments[i].offset.is_some() {
            return Ok(());
        }
        let id = self.segments[i].id();
        let seg_size = self.segments[i].size();
        let placement = match self.segments[i].subset_of() {
            Some(parent_id) => {
                let parent_pos = *index
                    .get(&parent_id)
                    .ok_or(LayoutError::UnknownParent { id, parent: parent_id })?;
                self.place_segment(parent_pos, index)?;
                let parent = &self.segments[parent_pos];
                let subset_offset = self.segments[i].subset_offset();
                if seg_size + subset_offset > parent.size() {
                    return Err(LayoutError::SubsetOverflow {
                        id,
                        parent: parent_id,
                        subset_offset,
                        size: seg_size,
                        parent_size: parent.size(),
                    });
                }
                parent.offset().expect("parent placed above") + subset_offset
            }
            None => {
                // Word alignment applies to root placements only.
                if self.size % HOST_WORD_SIZE != 0 {
                    let delta = HOST_WORD_SIZE - (self.size % HOST_WORD_SIZE);
                    self.padding_waste += delta;
                    self.size += delta;
                }
                let start_line = self.size & self.line_mask;
                let end_line = (self.size + seg_size - 1) & self.line_mask;
                if start_line != end_line {
                    // Would straddle a line: push to the next one.
                    let next = start_line + self.line_size;
                    self.line_waste += next - self.size;
                    self.size = next;
                    self.lines_laid_out += 1;
                } else if self.line_size != 0 && start_line >= self.lines_laid_out * self.line_size
                {
                    self.lines_laid_out += 1;
                }
                let placement = self.size;
                self.size += seg_size;
                placement
            }
        };
        self.segments[i].offset = Some(placement);
        Ok(())
    }

    fn write_segment_initials(&mut self) {
        for i in 0..self.segments.len() {
            let (offset, initial) = {
                let seg = &self.segments[i];
                match (&seg.offset, &seg.spec.initial) {
                    (Some(offset), Some(initial)) => (*offset, initial.clone()),
                    _ => continue,
                }
            };
            let line = self
                .line_at(offset)
                .expect("segment placement keeps initial values in range");
            let in_line = offset - line.offset();
            line.write_bytes(in_line, &initial)
                .expect("segments never straddle a line");
        }
    }

    fn allocate_line(&mut self, idx: LineIndex) -> Result<(), AccessError> {
        if self.line_size == 0 {
            if idx != 0 {
                return Err(AccessError::LineBeyondEnd {
                    idx,
                    size: self.size,
                });
            }
            let line = Line::new(0, 0, self.size as u32, self.initial, self.initial_size);
            self.lines.insert(0, line);
            return Ok(());
        }
        let line_offset = idx
            .checked_mul(self.line_size)
            .ok_or(AccessError::LineBeyondEnd {
                idx,
                size: self.size,
            })?;
        if line_offset > self.size {
            return Err(AccessError::LineBeyondEnd {
                idx,
                size: self.size,
            });
        }
        let line = Line::new(
            idx,
            line_offset,
            self.line_size as u32,
            self.initial,
            self.initial_size,
        );
        self.lines.insert(idx, line);
        Ok(())
    }

    /// Returns the line containing `offset`, allocating it on first touch.
    pub fn line_at(&mut self, offset: Offset) -> Result<&mut Line, AccessError> {
        if !self.contains_address(offset) {
            return Err(AccessError::OutOfRange {
                offset,
                size: self.size,
            });
        }
        let idx = self.line_index(offset);
        if !self.lines.contains_key(&idx) {
            self.allocate_line(idx)?;
        }
        Ok(self
            .lines
            .get_mut(&idx)
            .expect("line inserted or already present"))
    }

    /// Returns the line containing `offset` only if it is already
    /// allocated. Never allocates; sparse callers use this to detect
    /// unrealized lines.
    pub fn try_line_at(&self, offset: Offset) -> Result<Option<&Line>, AccessError> {
        if !self.contains_address(offset) {
            return Err(AccessError::OutOfRange {
                offset,
                size: self.size,
            });
        }
        Ok(self.lines.get(&self.line_index(offset)))
    }

    /// Typed read at an absolute offset (must not straddle lines).
    pub fn read_at<T: Scalar, B: ByteOrder>(&mut self, offset: Offset) -> Result<T, AccessError> {
        let line = self.line_at(offset)?;
        let in_line = offset - line.offset();
        line.read::<T, B>(in_line, 0)
    }

    /// Typed write at an absolute offset (must not straddle lines).
    pub fn write_at<T: Scalar, B: ByteOrder>(
        &mut self,
        offset: Offset,
        value: T,
    ) -> Result<(), AccessError> {
        let line = self.line_at(offset)?;
        let in_line = offset - line.offset();
        line.write::<T, B>(in_line, value, 0)
    }

    /// Reads bytes at an absolute offset; the span must sit in one line.
    pub fn read_bytes_at(&mut self, offset: Offset, out: &mut [u8]) -> Result<(), AccessError> {
        let line = self.line_at(offset)?;
        let in_line = offset - line.offset();
        line.read_bytes(in_line, out)
    }

    /// Writes bytes at an absolute offset; the span must sit in one line.
    pub fn write_bytes_at(&mut self, offset: Offset, data: &[u8]) -> Result<(), AccessError> {
        let line = self.line_at(offset)?;
        let in_line = offset - line.offset();
        line.write_bytes(in_line, data)
    }

    /// Emits every dirty line in ascending index order, then the
    /// end-of-archdata marker. Clears dirty bits.
    pub fn save<S: LineSink>(&mut self, out: &mut S) -> Result<(), StorageError> {
        for line in self.lines.values_mut() {
            if line.dirty {
                out.begin_line(line.idx)?;
                out.write_line_bytes(&line.data)?;
                line.dirty = false;
            }
        }
        out.end_archdata()
    }

    /// Emits every allocated line regardless of dirtiness. Clears dirty
    /// bits.
    pub fn save_all<S: LineSink>(&mut self, out: &mut S) -> Result<(), StorageError> {
        for line in self.lines.values_mut() {
            out.begin_line(line.idx)?;
            out.write_line_bytes(&line.data)?;
            line.dirty = false;
        }
        out.end_archdata()
    }

    /// Replays stored lines onto this region (delta restore: lines not in
    /// the data keep their current content). Restored lines are clean.
    pub fn restore<S: LineSource>(&mut self, input: &mut S) -> Result<(), StorageError> {
        while let Some(idx) = input.next_restore_line()? {
            if !self.lines.contains_key(&idx) {
                self.allocate_line(idx)
                    .map_err(|_| StorageError::LineOutOfRegion {
                        idx,
                        size: self.size,
                    })?;
            }
            let line = self.lines.get_mut(&idx).expect("allocated above");
            input.copy_line_bytes(&mut line.data)?;
            line.dirty = false;
        }
        Ok(())
    }

    /// Snapshot restore: clears the region first, so lines absent from the
    /// data end up back at the initial fill (or deallocated).
    pub fn restore_all<S: LineSource>(&mut self, input: &mut S) -> Result<(), StorageError> {
        self.clean()
            .expect("restore_all requires a laid out archdata");
        self.restore(input)
    }

    /// Returns all memory to the initial fill. Frees lines when permitted,
    /// otherwise overwrites them in place. Does not touch the layout.
    pub fn clean(&mut self) -> Result<(), LayoutError> {
        if !self.laid_out {
            return Err(LayoutError::NotLaidOut);
        }
        if self.can_free_lines {
            self.lines.clear();
        } else {
            let (initial, initial_size) = (self.initial, self.initial_size);
            for line in self.lines.values_mut() {
                line.fill_with_initial(initial, initial_size);
            }
        }
        Ok(())
    }

    /// `clean` plus replay of every segment initializer.
    pub fn reset(&mut self) -> Result<(), LayoutError> {
        self.clean()?;
        self.write_segment_initials();
        Ok(())
    }

    /// Copies every allocated line of `other` over this region, allocating
    /// lines as needed. Copied lines are dirty.
    pub fn update_from(&mut self, other: &ArchData) -> Result<(), AccessError> {
        for (idx, other_line) in &other.lines {
            if !self.lines.contains_key(idx) {
                self.allocate_line(*idx)?;
            }
            self.lines
                .get_mut(idx)
                .expect("allocated above")
                .copy_from(other_line);
        }
        Ok(())
    }

    /// Per-line state summary for diagnostics: `d` dirty, `c` clean.
    pub fn line_states(&self) -> Vec<String> {
        self.lines
            .values()
            .map(|line| {
                format!(
                    "{:5x}:{}",
                    line.idx,
                    if line.dirty { 'd' } else { 'c' }
                )
            })
            .collect()
    }
}

impl Default for ArchData {
    fn default() -> ArchData {
        ArchData::new(
            DEFAULT_LINE_SIZE,
            DEFAULT_INITIAL_FILL,
            DEFAULT_INITIAL_FILL_SIZE,
            true,
        )
        .expect("default archdata parameters are valid")
    }
}
