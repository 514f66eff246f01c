//! Record identifiers and slot snapshots

use std::fmt;

/// Identifier of a record in a record table (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(u32);

impl RecordId {
    /// Wrap a raw id; `0` is never a valid record
    pub fn new(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Raw numeric id
    pub fn get(self) -> u32 {
        self.0
    }

    /// Zero-based position of this record's slot
    pub(crate) fn index(self) -> u64 {
        u64::from(self.0 - 1)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record({})", self.0)
    }
}

/// Size value marking a free slot
pub const FREE_SIZE: i32 = -1;

/// Decoded contents of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSlot {
    /// Offset of the payload in the data region
    pub address: u64,
    /// Payload length, `-1` when the slot is free
    pub size: i32,
    /// Bytes reserved at `address`
    pub capacity: i32,
    /// Live owners; always zero for layouts without reference counts
    pub ref_count: u32,
}

impl RecordSlot {
    /// Whether this slot is on the free list
    pub fn is_free(&self) -> bool {
        self.size == FREE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_rejects_zero() {
        assert!(RecordId::new(0).is_none());
        let id = RecordId::new(5).unwrap();
        assert_eq!(id.get(), 5);
        assert_eq!(id.index(), 4);
        assert_eq!(id.to_string(), "Record(5)");
    }

    #[test]
    fn test_free_slot() {
        let slot = RecordSlot {
            address: 0,
            size: FREE_SIZE,
            capacity: 64,
            ref_count: 0,
        };
        assert!(slot.is_free());
    }
}
