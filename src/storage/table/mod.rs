//! Fixed-slot record table
//!
//! Maps a 1-based record id to `(address, size, capacity)` plus whatever the
//! slot layout adds. The file is a fixed header followed by a dense slot
//! array:
//!
//! ```text
//! [header 16B][slot 1][slot 2]...[slot n]
//!
//! offset(record, field) = HEADER_SIZE + (record - 1) * SLOT_SIZE + field
//! ```
//!
//! Opening refuses any file that was not closed with the safe-close magic of
//! the same layout; such a table has to be deleted and rebuilt by the caller.
//! Mutating methods take `&mut self`: the table has no locking of its own.

pub mod free_list;
pub mod header;
pub mod layout;
pub mod slot;

use crate::error::{Error, Result};
use crate::storage::paged_file::{PagedFile, DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE};
use free_list::FreeList;
use header::{
    safely_closed_magic, MagicState, CONNECTED_MAGIC, FLAGS_OFFSET, HEADER_SIZE, MAGIC_OFFSET,
    VERSION_OFFSET,
};
use layout::{SlotLayout, ADDRESS_OFFSET, CAPACITY_OFFSET, REF_COUNT_OFFSET, SIZE_OFFSET};
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::path::Path;
use tracing::{debug, info, trace};

pub use layout::{PlainSlots, RefCountedSlots};
pub use slot::{RecordId, RecordSlot, FREE_SIZE};

/// Record table over a paged file, parameterised by slot layout
pub struct RecordTable<L: SlotLayout> {
    file: PagedFile,
    free_list: FreeList,
    /// Set once `CONNECTED_MAGIC` is on disk, cleared by `force`
    dirty: bool,
    _layout: PhantomData<L>,
}

impl<L: SlotLayout> RecordTable<L> {
    /// Open a table, creating it if the file is empty
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize, cache_pages: usize) -> Result<Self> {
        let file = PagedFile::open(path, page_size, cache_pages)?;
        let mut table = Self {
            file,
            free_list: FreeList::new(),
            dirty: false,
            _layout: PhantomData,
        };

        if table.file.is_empty() {
            table.file.put(0, &[0u8; HEADER_SIZE as usize])?;
            table.mark_dirty()?;
            info!(path = ?table.file.path(), "Created record table");
            return Ok(table);
        }

        if table.file.len() < HEADER_SIZE {
            return Err(table.corrupted(format!(
                "file is {} bytes, shorter than the {} byte header",
                table.file.len(),
                HEADER_SIZE
            )));
        }

        let magic = table.file.get_u32(MAGIC_OFFSET)?;
        match MagicState::classify(magic, L::FORMAT_VERSION) {
            MagicState::SafelyClosed => {}
            MagicState::Connected => {
                return Err(table.corrupted("table was not closed cleanly"));
            }
            MagicState::Unknown(found) => {
                return Err(table.corrupted(format!(
                    "unexpected magic 0x{:08x}, expected 0x{:08x}",
                    found,
                    safely_closed_magic(L::FORMAT_VERSION)
                )));
            }
        }

        let records = table.records_count()?;
        info!(path = ?table.file.path(), records, "Opened record table");
        Ok(table)
    }

    /// Open with the default page size and cache
    pub fn with_defaults<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path, DEFAULT_PAGE_SIZE, DEFAULT_CACHE_PAGES)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Number of slots, live or free
    pub fn records_count(&self) -> Result<u32> {
        let body = self
            .file
            .len()
            .checked_sub(HEADER_SIZE)
            .ok_or_else(|| self.corrupted("file shorter than header"))?;
        if body % L::SLOT_SIZE != 0 {
            return Err(self.corrupted(format!(
                "{} bytes of slots is not a multiple of the {} byte slot size",
                body,
                L::SLOT_SIZE
            )));
        }
        u32::try_from(body / L::SLOT_SIZE)
            .map_err(|_| self.corrupted("slot count exceeds u32 range"))
    }

    /// Allocate a record, reusing a free slot when one exists
    pub fn create_new_record(&mut self) -> Result<RecordId> {
        self.mark_dirty()?;
        self.ensure_free_list()?;

        if let Some(id) = self.free_list.pop() {
            let offset = self.slot_offset(id)?;
            // Keep address and capacity so the old region can be rewritten in place
            self.file.put_i32(offset + SIZE_OFFSET, 0)?;
            L::on_create(&mut self.file, offset)?;
            trace!(%id, "Reused free slot");
            return Ok(id);
        }

        let count = self.records_count()?;
        let id = count
            .checked_add(1)
            .and_then(RecordId::new)
            .ok_or_else(|| Error::InvalidOperation("record table is full".to_string()))?;
        let offset = HEADER_SIZE + u64::from(count) * L::SLOT_SIZE;
        self.file.put(offset, &vec![0u8; L::SLOT_SIZE as usize])?;
        trace!(%id, "Appended slot");
        Ok(id)
    }

    /// Free a record and return its id to the free list
    pub fn delete_record(&mut self, id: RecordId) -> Result<()> {
        let offset = self.slot_offset(id)?;
        if self.file.get_i32(offset + SIZE_OFFSET)? == FREE_SIZE {
            return Err(Error::InvalidOperation(format!("{} is already deleted", id)));
        }

        self.mark_dirty()?;
        // Scan before flagging the slot, or the scan would list it twice
        self.ensure_free_list()?;
        self.file.put_i32(offset + SIZE_OFFSET, FREE_SIZE)?;
        L::on_delete(&mut self.file, offset)?;
        self.free_list.push(id);
        trace!(%id, "Deleted record");
        Ok(())
    }

    pub fn address(&mut self, id: RecordId) -> Result<u64> {
        let offset = self.slot_offset(id)?;
        self.file.get_u64(offset + ADDRESS_OFFSET)
    }

    pub fn set_address(&mut self, id: RecordId, address: u64) -> Result<()> {
        let offset = self.slot_offset(id)?;
        self.mark_dirty()?;
        self.file.put_u64(offset + ADDRESS_OFFSET, address)
    }

    pub fn size(&mut self, id: RecordId) -> Result<i32> {
        let offset = self.slot_offset(id)?;
        self.file.get_i32(offset + SIZE_OFFSET)
    }

    pub fn set_size(&mut self, id: RecordId, size: i32) -> Result<()> {
        let offset = self.slot_offset(id)?;
        self.mark_dirty()?;
        self.file.put_i32(offset + SIZE_OFFSET, size)
    }

    pub fn capacity(&mut self, id: RecordId) -> Result<i32> {
        let offset = self.slot_offset(id)?;
        self.file.get_i32(offset + CAPACITY_OFFSET)
    }

    pub fn set_capacity(&mut self, id: RecordId, capacity: i32) -> Result<()> {
        let offset = self.slot_offset(id)?;
        self.mark_dirty()?;
        self.file.put_i32(offset + CAPACITY_OFFSET, capacity)
    }

    /// Decode every field of a slot
    pub fn slot(&mut self, id: RecordId) -> Result<RecordSlot> {
        let offset = self.slot_offset(id)?;
        Ok(RecordSlot {
            address: self.file.get_u64(offset + ADDRESS_OFFSET)?,
            size: self.file.get_i32(offset + SIZE_OFFSET)?,
            capacity: self.file.get_i32(offset + CAPACITY_OFFSET)?,
            ref_count: L::read_ref_count(&mut self.file, offset)?,
        })
    }

    /// True if `id` names an allocated, non-deleted slot
    pub fn is_live(&mut self, id: RecordId) -> Result<bool> {
        if id.get() > self.records_count()? {
            return Ok(false);
        }
        Ok(self.size(id)? != FREE_SIZE)
    }

    /// Ids currently on the free list, building it if needed
    pub fn free_records(&mut self) -> Result<Vec<RecordId>> {
        self.ensure_free_list()?;
        Ok(self.free_list.ids().to_vec())
    }

    /// Caller-owned version word stored in the header
    pub fn version(&mut self) -> Result<u32> {
        self.file.get_u32(VERSION_OFFSET)
    }

    pub fn set_version(&mut self, version: u32) -> Result<()> {
        self.mark_dirty()?;
        self.file.put_u32(VERSION_OFFSET, version)
    }

    /// Header word reserved for the layer that owns the table
    pub fn flags(&mut self) -> Result<u32> {
        self.file.get_u32(FLAGS_OFFSET)
    }

    pub fn set_flags(&mut self, flags: u32) -> Result<()> {
        self.mark_dirty()?;
        self.file.put_u32(FLAGS_OFFSET, flags)
    }

    /// Stamp the connected magic on the first change since open or force
    pub fn mark_dirty(&mut self) -> Result<()> {
        if !self.dirty {
            self.file
                .write_through(MAGIC_OFFSET, &CONNECTED_MAGIC.to_le_bytes())?;
            self.dirty = true;
            debug!(path = ?self.file.path(), "Record table marked dirty");
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || self.file.is_dirty()
    }

    /// Write everything out and stamp the safe-close magic
    pub fn force(&mut self) -> Result<()> {
        // Slots reach disk before the header vouches for them
        self.file.flush()?;
        if self.dirty {
            self.file
                .put_u32(MAGIC_OFFSET, safely_closed_magic(L::FORMAT_VERSION))?;
            self.file.flush()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Flush up to `max_pages`; stamps the safe-close magic once nothing is left
    pub fn flush_some(&mut self, max_pages: usize) -> Result<bool> {
        if self.file.flush_some(max_pages)? {
            self.force()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Force and release the file
    pub fn dispose(&mut self) -> Result<()> {
        if self.file.is_disposed() {
            return Ok(());
        }
        self.force()?;
        self.file.dispose()?;
        info!(path = ?self.file.path(), "Closed record table");
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.file.is_disposed()
    }

    /// Verify slot fields and the free list
    ///
    /// `data_len`, when given, bounds every live slot's reserved region.
    pub fn check_sanity(&mut self, data_len: Option<u64>) -> Result<()> {
        let count = self.records_count()?;
        let mut free = BTreeSet::new();

        for raw in 1..=count {
            let id = RecordId::new(raw)
                .ok_or_else(|| Error::InvalidOperation("record id 0".to_string()))?;
            let slot = self.slot(id)?;
            if slot.capacity < 0 {
                return Err(self.corrupted(format!("{} has capacity {}", id, slot.capacity)));
            }
            if slot.is_free() {
                free.insert(id);
                continue;
            }
            if slot.size < 0 || slot.size > slot.capacity {
                return Err(self.corrupted(format!(
                    "{} has size {} with capacity {}",
                    id, slot.size, slot.capacity
                )));
            }
            if let Some(limit) = data_len {
                let end = slot.address.checked_add(slot.capacity as u64);
                if end.map_or(true, |end| end > limit) {
                    return Err(self.corrupted(format!(
                        "{} reserves {} bytes at {}, past data end {}",
                        id, slot.capacity, slot.address, limit
                    )));
                }
            }
        }

        if self.free_list.is_built() {
            let listed: BTreeSet<RecordId> = self.free_list.ids().iter().copied().collect();
            if listed.len() != self.free_list.len() || listed != free {
                return Err(self.corrupted(format!(
                    "free list holds {} ids, table has {} free slots",
                    self.free_list.len(),
                    free.len()
                )));
            }
        }
        Ok(())
    }

    fn slot_offset(&self, id: RecordId) -> Result<u64> {
        let count = self.records_count()?;
        if id.get() > count {
            return Err(Error::InvalidOperation(format!(
                "{} was never allocated ({} records)",
                id, count
            )));
        }
        Ok(HEADER_SIZE + id.index() * L::SLOT_SIZE)
    }

    fn ensure_free_list(&mut self) -> Result<()> {
        if self.free_list.is_built() {
            return Ok(());
        }
        let count = self.records_count()?;
        let mut ids = Vec::new();
        for raw in 1..=count {
            let offset = HEADER_SIZE + u64::from(raw - 1) * L::SLOT_SIZE;
            if self.file.get_i32(offset + SIZE_OFFSET)? == FREE_SIZE {
                if let Some(id) = RecordId::new(raw) {
                    ids.push(id);
                }
            }
        }
        debug!(path = ?self.file.path(), free = ids.len(), scanned = count, "Built free list");
        self.free_list.build(ids);
        Ok(())
    }

    fn corrupted(&self, reason: impl Into<String>) -> Error {
        Error::Corrupted {
            path: self.file.path().to_path_buf(),
            reason: reason.into(),
        }
    }
}

impl RecordTable<RefCountedSlots> {
    pub fn ref_count(&mut self, id: RecordId) -> Result<u32> {
        let offset = self.slot_offset(id)?;
        self.file.get_u32(offset + REF_COUNT_OFFSET)
    }

    pub fn set_ref_count(&mut self, id: RecordId, count: u32) -> Result<()> {
        let offset = self.slot_offset(id)?;
        self.mark_dirty()?;
        self.file.put_u32(offset + REF_COUNT_OFFSET, count)
    }
}
