//! Compile-time slot layouts
//!
//! A record table is generic over its slot layout. Every layout starts with
//! the common `address`/`size`/`capacity` fields; extensions append fields
//! after them and get hooks to initialise and release those fields.
//!
//! ```text
//! PlainSlots       [address u64][size i32][capacity i32]                  16 bytes
//! RefCountedSlots  [address u64][size i32][capacity i32][ref_count u32]   20 bytes
//! ```

use crate::error::Result;
use crate::storage::paged_file::PagedFile;

pub const ADDRESS_OFFSET: u64 = 0;
pub const SIZE_OFFSET: u64 = 8;
pub const CAPACITY_OFFSET: u64 = 12;
pub const REF_COUNT_OFFSET: u64 = 16;

/// Size of the fields shared by every layout
pub const BASE_SLOT_SIZE: u64 = 16;

/// Per-slot layout of a record table
pub trait SlotLayout: Send + 'static {
    /// Bytes per slot
    const SLOT_SIZE: u64;
    /// Folded into the safe-close magic, so tables of different layouts never
    /// open each other's files
    const FORMAT_VERSION: u32;

    /// Reset extension fields of a slot handed out by allocation
    fn on_create(_file: &mut PagedFile, _slot_offset: u64) -> Result<()> {
        Ok(())
    }

    /// Release whatever the slot's extension fields reserve
    fn on_delete(_file: &mut PagedFile, _slot_offset: u64) -> Result<()> {
        Ok(())
    }

    /// Read the reference count stored in a slot, if the layout has one
    fn read_ref_count(_file: &mut PagedFile, _slot_offset: u64) -> Result<u32> {
        Ok(0)
    }
}

/// Address, size and capacity only
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSlots;

impl SlotLayout for PlainSlots {
    const SLOT_SIZE: u64 = BASE_SLOT_SIZE;
    const FORMAT_VERSION: u32 = 1;
}

/// Plain slots plus a reference count
#[derive(Debug, Clone, Copy, Default)]
pub struct RefCountedSlots;

impl SlotLayout for RefCountedSlots {
    const SLOT_SIZE: u64 = BASE_SLOT_SIZE + 4;
    const FORMAT_VERSION: u32 = 2;

    fn on_create(file: &mut PagedFile, slot_offset: u64) -> Result<()> {
        file.put_u32(slot_offset + REF_COUNT_OFFSET, 0)
    }

    fn on_delete(file: &mut PagedFile, slot_offset: u64) -> Result<()> {
        file.put_u32(slot_offset + REF_COUNT_OFFSET, 0)
    }

    fn read_ref_count(file: &mut PagedFile, slot_offset: u64) -> Result<u32> {
        file.get_u32(slot_offset + REF_COUNT_OFFSET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(PlainSlots::SLOT_SIZE, 16);
        assert_eq!(RefCountedSlots::SLOT_SIZE, 20);
        assert_ne!(PlainSlots::FORMAT_VERSION, RefCountedSlots::FORMAT_VERSION);
        assert!(REF_COUNT_OFFSET + 4 <= RefCountedSlots::SLOT_SIZE);
    }
}
