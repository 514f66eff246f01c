//! Raw payload placement in the data region
//!
//! A record owns the byte range `[address, address + capacity)` of the data
//! region and uses its first `size` bytes. A rewrite that fits the capacity
//! goes in place; anything larger is relocated to the end of the region and
//! the old range becomes dead space. The region is never compacted.

use crate::error::{Error, Result};
use crate::storage::paged_file::PagedFile;
use crate::storage::table::{RecordId, RecordTable, RefCountedSlots};
use tracing::debug;

/// Smallest range reserved for a growable record
pub const MIN_CAPACITY: usize = 32;

/// Bytes to reserve for a payload of `len` bytes
///
/// Fixed-size records get exactly what they need; others get a quarter more
/// so that small growth can be rewritten in place.
pub fn capacity_for(len: usize, fixed_size: bool) -> usize {
    if fixed_size {
        len
    } else {
        len.saturating_add(len / 4).max(MIN_CAPACITY)
    }
}

/// Store `bytes` as the full content of `id`
pub fn write_raw(
    table: &mut RecordTable<RefCountedSlots>,
    data: &mut PagedFile,
    id: RecordId,
    bytes: &[u8],
    fixed_size: bool,
) -> Result<()> {
    let len = i32::try_from(bytes.len()).map_err(|_| {
        Error::InvalidOperation(format!("{} bytes is too large for {}", bytes.len(), id))
    })?;
    let slot = table.slot(id)?;
    if slot.is_free() {
        return Err(Error::InvalidOperation(format!("{} is not allocated", id)));
    }
    // The connected magic must be on disk before any data byte changes
    table.mark_dirty()?;

    if len <= slot.capacity {
        data.put(slot.address, bytes)?;
        table.set_size(id, len)?;
        return Ok(());
    }

    let capacity = capacity_for(bytes.len(), fixed_size).min(i32::MAX as usize);
    let address = data.len();
    data.put(address, bytes)?;
    data.reserve((capacity - bytes.len()) as u64)?;

    table.set_address(id, address)?;
    table.set_capacity(id, capacity as i32)?;
    table.set_size(id, len)?;
    debug!(%id, address, capacity, old_address = slot.address, old_capacity = slot.capacity, "Relocated record");
    Ok(())
}

/// Read the stored bytes of `id`
pub fn read_raw(
    table: &mut RecordTable<RefCountedSlots>,
    data: &mut PagedFile,
    id: RecordId,
) -> Result<Vec<u8>> {
    let slot = table.slot(id)?;
    if slot.is_free() {
        return Err(Error::InvalidOperation(format!("{} is not allocated", id)));
    }
    if slot.size < 0 || slot.size > slot.capacity {
        return Err(Error::Corrupted {
            path: table.path().to_path_buf(),
            reason: format!(
                "{} has size {} with capacity {}",
                id, slot.size, slot.capacity
            ),
        });
    }
    let mut buf = vec![0u8; slot.size as usize];
    data.get(slot.address, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::table::header::CONNECTED_MAGIC;

    fn open(dir: &tempfile::TempDir) -> Result<(RecordTable<RefCountedSlots>, PagedFile)> {
        let table = RecordTable::with_defaults(dir.path().join("r.rt"))?;
        let data = PagedFile::open(dir.path().join("r.dat"), 256, 8)?;
        Ok((table, data))
    }

    #[test]
    fn test_capacity_policy() {
        assert_eq!(capacity_for(100, true), 100);
        assert_eq!(capacity_for(100, false), 125);
        assert_eq!(capacity_for(4, false), MIN_CAPACITY);
        assert_eq!(capacity_for(0, true), 0);
    }

    #[test]
    fn test_rewrite_in_place_when_it_fits() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (mut table, mut data) = open(&dir)?;
        let id = table.create_new_record()?;

        write_raw(&mut table, &mut data, id, &[1u8; 100], false)?;
        let first = table.slot(id)?;
        assert_eq!(first.capacity, 125);

        write_raw(&mut table, &mut data, id, &[2u8; 120], false)?;
        let second = table.slot(id)?;
        assert_eq!(second.address, first.address);
        assert_eq!(second.size, 120);
        assert_eq!(read_raw(&mut table, &mut data, id)?, vec![2u8; 120]);
        Ok(())
    }

    #[test]
    fn test_growth_relocates_to_end() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (mut table, mut data) = open(&dir)?;
        let a = table.create_new_record()?;
        let b = table.create_new_record()?;

        write_raw(&mut table, &mut data, a, &[1u8; 40], true)?;
        write_raw(&mut table, &mut data, b, &[2u8; 40], true)?;
        write_raw(&mut table, &mut data, a, &[3u8; 41], true)?;

        let slot = table.slot(a)?;
        assert_eq!(slot.address, 80);
        assert_eq!(slot.capacity, 41);
        assert_eq!(data.len(), 121);
        assert_eq!(read_raw(&mut table, &mut data, b)?, vec![2u8; 40]);
        assert_eq!(read_raw(&mut table, &mut data, a)?, vec![3u8; 41]);
        Ok(())
    }

    #[test]
    fn test_empty_payload() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (mut table, mut data) = open(&dir)?;
        let id = table.create_new_record()?;

        write_raw(&mut table, &mut data, id, &[], false)?;
        assert!(read_raw(&mut table, &mut data, id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_write_leaves_table_marked_connected() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (mut table, mut data) = open(&dir)?;
        let id = table.create_new_record()?;
        write_raw(&mut table, &mut data, id, &[1u8; 64], false)?;
        data.flush()?;
        table.force()?;
        assert!(!table.is_dirty());

        // The in-place rewrite cannot reach the data file
        data.dispose()?;
        assert!(write_raw(&mut table, &mut data, id, &[2u8; 64], false).is_err());

        assert!(table.is_dirty());
        let on_disk = std::fs::read(dir.path().join("r.rt")).unwrap();
        assert_eq!(on_disk[..4], CONNECTED_MAGIC.to_le_bytes());
        Ok(())
    }

    #[test]
    fn test_out_of_range_size_is_corruption() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (mut table, mut data) = open(&dir)?;
        let id = table.create_new_record()?;
        write_raw(&mut table, &mut data, id, &[1u8; 10], true)?;

        table.set_size(id, -7)?;
        assert!(matches!(
            read_raw(&mut table, &mut data, id),
            Err(Error::Corrupted { .. })
        ));

        table.set_size(id, 11)?;
        assert!(matches!(
            read_raw(&mut table, &mut data, id),
            Err(Error::Corrupted { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_free_record_rejected() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (mut table, mut data) = open(&dir)?;
        let id = table.create_new_record()?;
        table.delete_record(id)?;

        assert!(matches!(
            write_raw(&mut table, &mut data, id, b"x", false),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            read_raw(&mut table, &mut data, id),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }
}
