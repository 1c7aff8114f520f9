//! Checkpoint serialization sinks and sources.
//!
//! A storage object records, per archdata, a sequence of
//! `(line index, line bytes)` entries terminated by an end-of-archdata
//! marker. A given object is driven either as a sink by one save or as a
//! source by one restore at a time; `prepare_for_load` rewinds the read
//! cursor between restores.

use crate::error::StorageError;
use crate::LineIndex;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Where a save writes line data.
pub trait LineSink {
    /// Opens the entry for one line. Two consecutive calls with the same
    /// index are rejected.
    fn begin_line(&mut self, idx: LineIndex) -> Result<(), StorageError>;

    /// Appends the full byte content of the line opened by `begin_line`.
    fn write_line_bytes(&mut self, bytes: &[u8]) -> Result<(), StorageError>;

    /// Marks the end of one archdata's entries.
    fn end_archdata(&mut self) -> Result<(), StorageError>;
}

/// Where a restore reads line data from, in the order it was written.
pub trait LineSource {
    /// Rewinds the read cursor to the start of the stored data.
    fn prepare_for_load(&mut self);

    /// Yields the next stored line index, or `None` at end-of-archdata.
    /// Asking again after the final end marker is corruption.
    fn next_restore_line(&mut self) -> Result<Option<LineIndex>, StorageError>;

    /// Copies the bytes of the last yielded line. `buf` must be exactly the
    /// stored size.
    fn copy_line_bytes(&mut self, buf: &mut [u8]) -> Result<(), StorageError>;
}

/// Sentinel index marking end-of-archdata in [`VectorStorage`] entries.
const END_MARK: LineIndex = LineIndex::MAX;

/// In-memory storage holding `(index, bytes)` pairs, ended per archdata by
/// a sentinel empty pair. This is the checkpointer's working representation;
/// it serializes for the database overlay.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VectorStorage {
    entries: Vec<(LineIndex, Vec<u8>)>,
    #[serde(skip)]
    pending: Option<LineIndex>,
    #[serde(skip)]
    cursor: usize,
}

impl VectorStorage {
    pub fn new() -> VectorStorage {
        VectorStorage::default()
    }

    /// Bytes held for line content, excluding bookkeeping.
    pub fn content_bytes(&self) -> u64 {
        self.entries.iter().map(|(_, bytes)| bytes.len() as u64).sum()
    }

    /// Number of stored entries including end markers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LineSink for VectorStorage {
    fn begin_line(&mut self, idx: LineIndex) -> Result<(), StorageError> {
        if let Some((last_idx, _)) = self.entries.last() {
            if *last_idx == idx {
                return Err(StorageError::DuplicateLine(idx));
            }
        }
        self.pending = Some(idx);
        Ok(())
    }

    fn write_line_bytes(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let idx = self.pending.take().ok_or(StorageError::NoOpenLine)?;
        self.entries.push((idx, bytes.to_vec()));
        Ok(())
    }

    fn end_archdata(&mut self) -> Result<(), StorageError> {
        self.entries.push((END_MARK, Vec::new()));
        Ok(())
    }
}

impl LineSource for VectorStorage {
    fn prepare_for_load(&mut self) {
        self.cursor = 0;
    }

    fn next_restore_line(&mut self) -> Result<Option<LineIndex>, StorageError> {
        if self.cursor > self.entries.len() {
            return Err(StorageError::PastEnd);
        }
        if self.cursor == self.entries.len() {
            // Reaching the exact end without a marker still terminates the
            // archdata, but one more call is an error.
            self.cursor += 1;
            return Ok(None);
        }
        let (idx, _) = self.entries[self.cursor];
        self.cursor += 1;
        if idx == END_MARK {
            Ok(None)
        } else {
            Ok(Some(idx))
        }
    }

    fn copy_line_bytes(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        if self.cursor == 0 || self.cursor > self.entries.len() {
            return Err(StorageError::PastEnd);
        }
        let (_, bytes) = &self.entries[self.cursor - 1];
        if bytes.len() != buf.len() {
            return Err(StorageError::SizeMismatch {
                stored: bytes.len(),
                expected: buf.len(),
            });
        }
        buf.copy_from_slice(bytes);
        Ok(())
    }
}

const TAG_LINE: u8 = b'L';
const TAG_END: u8 = b'E';

/// Contiguous byte-stream storage: tag `L`, little-endian u64 line index,
/// then the line bytes; tag `E` ends one archdata. The stream does not
/// record line sizes, so the reader supplies them through `copy_line_bytes`
/// buffer lengths.
#[derive(Clone, Debug, Default)]
pub struct StreamStorage {
    buf: Vec<u8>,
    last_idx: Option<LineIndex>,
    read_pos: usize,
}

impl StreamStorage {
    pub fn new() -> StreamStorage {
        StreamStorage::default()
    }

    pub fn content_bytes(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl LineSink for StreamStorage {
    fn begin_line(&mut self, idx: LineIndex) -> Result<(), StorageError> {
        if self.last_idx == Some(idx) {
            return Err(StorageError::DuplicateLine(idx));
        }
        self.last_idx = Some(idx);
        self.buf.push(TAG_LINE);
        let mut raw = [0u8; 8];
        LittleEndian::write_u64(&mut raw, idx);
        self.buf.extend_from_slice(&raw);
        Ok(())
    }

    fn write_line_bytes(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        if self.last_idx.is_none() {
            return Err(StorageError::NoOpenLine);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn end_archdata(&mut self) -> Result<(), StorageError> {
        self.buf.push(TAG_END);
        self.last_idx = None;
        Ok(())
    }
}

impl LineSource for StreamStorage {
    fn prepare_for_load(&mut self) {
        self.read_pos = 0;
    }

    fn next_restore_line(&mut self) -> Result<Option<LineIndex>, StorageError> {
        let tag = *self
            .buf
            .get(self.read_pos)
            .ok_or(StorageError::UnexpectedEnd)?;
        self.read_pos += 1;
        match tag {
            TAG_END => Ok(None),
            TAG_LINE => {
                let end = self.read_pos + 8;
                let raw = self
                    .buf
                    .get(self.read_pos..end)
                    .ok_or(StorageError::UnexpectedEnd)?;
                let idx = LittleEndian::read_u64(raw);
                self.read_pos = end;
                Ok(Some(idx))
            }
            other => Err(StorageError::UnknownTag(other)),
        }
    }

    fn copy_line_bytes(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        let end = self.read_pos + buf.len();
        let raw = self
            .buf
            .get(self.read_pos..end)
            .ok_or(StorageError::UnexpectedEnd)?;
        buf.copy_from_slice(raw);
        self.read_pos = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_round_trip() {
        let mut storage = VectorStorage::new();
        storage.begin_line(3).unwrap();
        storage.write_line_bytes(&[1, 2, 3, 4]).unwrap();
        storage.begin_line(7).unwrap();
        storage.write_line_bytes(&[5, 6, 7, 8]).unwrap();
        storage.end_archdata().unwrap();

        storage.prepare_for_load();
        assert_eq!(storage.next_restore_line().unwrap(), Some(3));
        let mut buf = [0u8; 4];
        storage.copy_line_bytes(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(storage.next_restore_line().unwrap(), Some(7));
        storage.copy_line_bytes(&mut buf).unwrap();
        assert_eq!(buf, [5, 6, 7, 8]);
        assert_eq!(storage.next_restore_line().unwrap(), None);
    }

    #[test]
    fn vector_rejects_repeated_line() {
        let mut storage = VectorStorage::new();
        storage.begin_line(3).unwrap();
        storage.write_line_bytes(&[0u8; 2]).unwrap();
        assert_eq!(storage.begin_line(3), Err(StorageError::DuplicateLine(3)));
    }

    #[test]
    fn vector_read_past_end_is_corruption() {
        let mut storage = VectorStorage::new();
        storage.end_archdata().unwrap();
        storage.prepare_for_load();
        assert_eq!(storage.next_restore_line().unwrap(), None);
        assert!(storage.next_restore_line().is_ok());
        assert_eq!(storage.next_restore_line(), Err(StorageError::PastEnd));
    }

    #[test]
    fn vector_size_mismatch() {
        let mut storage = VectorStorage::new();
        storage.begin_line(0).unwrap();
        storage.write_line_bytes(&[1, 2]).unwrap();
        storage.end_archdata().unwrap();
        storage.prepare_for_load();
        storage.next_restore_line().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            storage.copy_line_bytes(&mut buf),
            Err(StorageError::SizeMismatch {
                stored: 2,
                expected: 4
            })
        );
    }

    #[test]
    fn stream_round_trip() {
        let mut storage = StreamStorage::new();
        storage.begin_line(1).unwrap();
        storage.write_line_bytes(&[0xaa; 8]).unwrap();
        storage.end_archdata().unwrap();

        storage.prepare_for_load();
        assert_eq!(storage.next_restore_line().unwrap(), Some(1));
        let mut buf = [0u8; 8];
        storage.copy_line_bytes(&mut buf).unwrap();
        assert_eq!(buf, [0xaa; 8]);
        assert_eq!(storage.next_restore_line().unwrap(), None);
    }

    #[test]
    fn stream_layout_is_tagged() {
        let mut storage = StreamStorage::new();
        storage.begin_line(2).unwrap();
        storage.write_line_bytes(&[9]).unwrap();
        storage.end_archdata().unwrap();
        let bytes = storage.as_bytes();
        assert_eq!(bytes[0], b'L');
        assert_eq!(&bytes[1..9], &2u64.to_le_bytes());
        assert_eq!(bytes[9], 9);
        assert_eq!(bytes[10], b'E');
    }

    #[test]
    fn stream_rejects_unknown_tag() {
        let mut storage = StreamStorage::new();
        storage.buf.push(b'X');
        storage.prepare_for_load();
        assert_eq!(
            storage.next_restore_line(),
            Err(StorageError::UnknownTag(b'X'))
        );
    }

    #[test]
    fn stream_truncated_stream() {
        let mut storage = StreamStorage::new();
        storage.buf.push(TAG_LINE);
        storage.buf.extend_from_slice(&[0u8; 4]);
        storage.prepare_for_load();
        assert_eq!(
            storage.next_restore_line(),
            Err(StorageError::UnexpectedEnd)
        );
    }
}
