use crate::Tick;

/// Bits of [`TransactionInterval::flags`] selecting the record variant.
pub const RECORD_TYPE_MASK: u16 = 0x7;

/// Annotation payloads are capped at this many bytes by the producer;
/// over-length records are truncated with a diagnostic before they reach
/// this crate.
pub const MAX_ANNOTATION_BYTES: usize = 16_384;

/// Transaction record variant, encoded in the low flag bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Annotation = 1,
    Instruction = 2,
    MemoryOperation = 3,
    Pair = 4,
}

/// The common header of one transaction record, viewed as a half-open
/// interval `[start, end)` of ticks.
///
/// Variant-specific tails (annotation text, instruction operands, pair
/// vectors) stay with the record reader; the window only needs the header
/// to index and report the transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionInterval {
    pub start: Tick,
    pub end: Tick,
    pub transaction_id: u64,
    pub parent_id: u64,
    pub display_id: u64,
    pub location_id: u16,
    pub flags: u16,
}

impl TransactionInterval {
    pub fn kind(&self) -> Option<RecordKind> {
        match self.flags & RECORD_TYPE_MASK {
            1 => Some(RecordKind::Annotation),
            2 => Some(RecordKind::Instruction),
            3 => Some(RecordKind::MemoryOperation),
            4 => Some(RecordKind::Pair),
            _ => None,
        }
    }

    /// Whether the transaction is in flight at `tick`.
    pub fn contains(&self, tick: Tick) -> bool {
        tick >= self.start && tick < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(flags: u16) -> TransactionInterval {
        TransactionInterval {
            start: 10,
            end: 20,
            transaction_id: 1,
            parent_id: 0,
            display_id: 0,
            location_id: 3,
            flags,
        }
    }

    #[test]
    fn kind_is_decoded_from_flags() {
        assert_eq!(record(0x1).kind(), Some(RecordKind::Annotation));
        assert_eq!(record(0x2).kind(), Some(RecordKind::Instruction));
        assert_eq!(record(0x3).kind(), Some(RecordKind::MemoryOperation));
        assert_eq!(record(0x4).kind(), Some(RecordKind::Pair));
        assert_eq!(record(0x0).kind(), None);
        // High flag bits do not disturb the variant.
        assert_eq!(record(0x8 | 0x2).kind(), Some(RecordKind::Instruction));
    }

    #[test]
    fn containment_is_half_open() {
        let r = record(0x2);
        assert!(!r.contains(9));
        assert!(r.contains(10));
        assert!(r.contains(19));
        assert!(!r.contains(20));
    }
}
