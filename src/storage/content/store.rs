//! Reference-counted, compressed content store
//!
//! Combines a ref-counted record table, a data region, compression and a
//! write-behind queue into the API the build cache talks to.
//!
//! ```text
//! write_bytes ──┬─ pending bytes <= limit ──→ queue ──→ writer: compress, lock, commit
//!               └─ pending bytes >  limit ──→ compress + commit on the caller
//!
//! read/acquire/release/ref_count/write ──→ wait for the record's queued write first
//! ```
//!
//! Every mutation of the table and the data region happens under one
//! store-wide lock. A record has at most one queued write, which gives
//! read-after-write and write-after-write ordering per record; commits of
//! different records are serialised by the single writer but their order is
//! not part of the contract.

use super::compression::{compress, decompress, CompressionAlgorithm, CompressionStats};
use super::pending::{PendingWrite, WriteTicket};
use super::region;
use super::worker::{spawn_writer, WriteJob};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::storage::paged_file::PagedFile;
use crate::storage::table::{RecordId, RecordTable, RefCountedSlots};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Path of the record table belonging to a store
pub fn table_path(base: &Path) -> PathBuf {
    with_suffix(base, ".rt")
}

/// Path of the data region belonging to a store
pub fn data_path(base: &Path) -> PathBuf {
    with_suffix(base, ".dat")
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Remove both files of a store, ignoring ones that do not exist
pub fn delete_files(base: &Path) -> Result<()> {
    for path in [table_path(base), data_path(base)] {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = ?path, "Deleted store file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&path, e)),
        }
    }
    Ok(())
}

/// Compression the store's payloads are encoded with
///
/// A fresh table is stamped with the configured algorithm. A stamped table
/// keeps its own algorithm whatever the config asks for, so existing payloads
/// always decode.
fn stamped_compression(
    table: &mut RecordTable<RefCountedSlots>,
    config: &StoreConfig,
) -> Result<CompressionAlgorithm> {
    let requested = config.effective_compression();
    match CompressionAlgorithm::from_stamp(table.flags()?) {
        Ok(Some(stamped)) => {
            if stamped != requested {
                warn!(path = ?table.path(), stamped = ?stamped, requested = ?requested, "Store keeps the compression it was written with");
            }
            Ok(stamped)
        }
        Ok(None) => {
            table.set_flags(requested.stamp())?;
            Ok(requested)
        }
        Err(found) => Err(Error::Corrupted {
            path: table.path().to_path_buf(),
            reason: format!("unknown compression stamp {}", found),
        }),
    }
}

struct StoreState {
    table: RecordTable<RefCountedSlots>,
    data: PagedFile,
    pending: HashMap<RecordId, PendingWrite>,
    /// Background commit failures not yet reported to a caller
    failures: BTreeMap<RecordId, Error>,
    pending_bytes: usize,
    writer: Option<Sender<WriteJob>>,
    closed: bool,
}

impl StoreState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidOperation("content store is closed".to_string()));
        }
        Ok(())
    }

    fn ensure_live(&mut self, id: RecordId) -> Result<()> {
        if !self.table.is_live(id)? {
            return Err(Error::InvalidOperation(format!("{} is not allocated", id)));
        }
        Ok(())
    }

    fn write_raw(&mut self, id: RecordId, bytes: &[u8], fixed_size: bool) -> Result<()> {
        region::write_raw(&mut self.table, &mut self.data, id, bytes, fixed_size)
    }

    fn read_raw(&mut self, id: RecordId) -> Result<Vec<u8>> {
        region::read_raw(&mut self.table, &mut self.data, id)
    }

    fn take_failure(&mut self, id: RecordId) -> Result<()> {
        match self.failures.remove(&id) {
            Some(source) => Err(Error::BackgroundWrite {
                record: id.get(),
                source: Box::new(source),
            }),
            None => Ok(()),
        }
    }
}

/// State shared between the store handle and its background writer
pub(crate) struct Shared {
    state: Mutex<StoreState>,
    pending_write_limit: usize,
    compression: CompressionAlgorithm,
    compression_level: i32,
    original_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
}

impl Shared {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let packed = compress(bytes, self.compression, self.compression_level)?;
        self.original_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.compressed_bytes
            .fetch_add(packed.len() as u64, Ordering::Relaxed);
        Ok(packed)
    }

    /// Body of one background job
    pub(crate) fn compress_and_commit(&self, job: WriteJob) {
        let packed = self.compress(&job.bytes);

        let mut state = self.state.lock();
        let outcome = packed.and_then(|packed| state.write_raw(job.record, &packed, job.fixed_size));
        let queued = state
            .pending
            .remove(&job.record)
            .map_or(job.bytes.len(), |pending| pending.bytes_queued);
        state.pending_bytes = state.pending_bytes.saturating_sub(queued);
        if let Err(e) = outcome {
            error!(record = %job.record, error = %e, "Background write failed");
            state.failures.insert(job.record, e);
        }
        drop(state);

        job.ticket.complete();
    }
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Slots in the record table, live or free
    pub records: u32,
    pub free_records: usize,
    pub pending_writes: usize,
    pub pending_bytes: usize,
    /// Length of the data region, dead space included
    pub data_bytes: u64,
    pub compression: CompressionStats,
}

/// Reference-counted content store over a record table and a data region
pub struct ContentStore {
    base: PathBuf,
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
    synchronous_raw: bool,
}

impl ContentStore {
    /// Open or create the store at `base` (`<base>.rt` and `<base>.dat`)
    ///
    /// Fails with `Error::Corrupted` if the table was not closed cleanly; the
    /// caller is expected to delete the files and start over.
    pub fn open<P: AsRef<Path>>(base: P, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let base = base.as_ref().to_path_buf();
        if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let mut table: RecordTable<RefCountedSlots> = RecordTable::open(
            table_path(&base),
            config.page_size,
            config.page_cache_pages,
        )?;
        let compression = stamped_compression(&mut table, config)?;
        let data = PagedFile::open(data_path(&base), config.page_size, config.page_cache_pages)?;
        let records = table.records_count()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(StoreState {
                table,
                data,
                pending: HashMap::new(),
                failures: BTreeMap::new(),
                pending_bytes: 0,
                writer: None,
                closed: false,
            }),
            pending_write_limit: config.pending_write_limit,
            compression,
            compression_level: config.compression_level,
            original_bytes: AtomicU64::new(0),
            compressed_bytes: AtomicU64::new(0),
        });

        let mut writer = None;
        if !config.synchronous_raw {
            let (sender, handle) = spawn_writer(Arc::clone(&shared))?;
            shared.state.lock().writer = Some(sender);
            writer = Some(handle);
        }

        info!(
            path = ?base,
            records,
            compression = ?shared.compression,
            synchronous_raw = config.synchronous_raw,
            "Opened content store"
        );

        Ok(Self {
            base,
            shared,
            writer: Mutex::new(writer),
            synchronous_raw: config.synchronous_raw,
        })
    }

    /// Open with default settings
    pub fn with_defaults<P: AsRef<Path>>(base: P) -> Result<Self> {
        Self::open(base, &StoreConfig::default())
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Allocate a record owned by the caller (ref count 1)
    pub fn acquire_new_record(&self) -> Result<RecordId> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        let id = state.table.create_new_record()?;
        debug_assert!(!state.pending.contains_key(&id));
        state.table.set_ref_count(id, 1)?;
        debug!(%id, "Acquired new record");
        Ok(id)
    }

    /// Add an owner to an existing record
    pub fn acquire_record(&self, id: RecordId) -> Result<()> {
        let mut state = self.wait_for_pending(id)?;
        state.ensure_live(id)?;
        let count = state.table.ref_count(id)?;
        let count = count
            .checked_add(1)
            .ok_or_else(|| Error::InvalidOperation(format!("{} ref count overflow", id)))?;
        state.table.set_ref_count(id, count)
    }

    /// Drop an owner; the last release deletes the record
    pub fn release_record(&self, id: RecordId) -> Result<()> {
        let mut state = self.wait_for_pending(id)?;
        state.ensure_live(id)?;
        let count = state.table.ref_count(id)?.saturating_sub(1);
        if count == 0 {
            state.table.delete_record(id)?;
            debug!(%id, "Released last reference, record deleted");
        } else {
            state.table.set_ref_count(id, count)?;
        }
        Ok(())
    }

    pub fn ref_count(&self, id: RecordId) -> Result<u32> {
        let mut state = self.wait_for_pending(id)?;
        state.ensure_live(id)?;
        state.table.ref_count(id)
    }

    /// True if `id` is allocated and not deleted
    pub fn is_live(&self, id: RecordId) -> Result<bool> {
        let mut state = self.wait_for_pending(id)?;
        state.table.is_live(id)
    }

    /// Replace the content of a record
    ///
    /// The write is normally queued and committed by the background writer.
    /// Once more than the configured limit of bytes is queued, it is
    /// compressed and committed on the calling thread instead. `fixed_size`
    /// records reserve exactly their length, others leave room to grow.
    pub fn write_bytes(&self, id: RecordId, bytes: &[u8], fixed_size: bool) -> Result<()> {
        let mut guard = self.wait_for_pending(id)?;
        let state = &mut *guard;
        state.ensure_live(id)?;

        if self.synchronous_raw {
            let packed = self.shared.compress(bytes)?;
            return state.write_raw(id, &packed, fixed_size);
        }

        state.pending_bytes += bytes.len();
        if state.pending_bytes > self.shared.pending_write_limit {
            debug!(%id, bytes = bytes.len(), pending_bytes = state.pending_bytes, "Pending write limit exceeded, writing synchronously");
            let outcome = self
                .shared
                .compress(bytes)
                .and_then(|packed| state.write_raw(id, &packed, fixed_size));
            state.pending_bytes -= bytes.len();
            return outcome;
        }

        let ticket = WriteTicket::new();
        let job = WriteJob {
            record: id,
            bytes: bytes.to_vec(),
            fixed_size,
            ticket: Arc::clone(&ticket),
        };
        let sent = match state.writer.as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            state.pending_bytes -= bytes.len();
            return Err(Error::InvalidOperation(
                "background writer is not running".to_string(),
            ));
        }
        state.pending.insert(
            id,
            PendingWrite {
                ticket,
                bytes_queued: bytes.len(),
            },
        );
        Ok(())
    }

    /// Appending to a record is not supported by this store
    pub fn append_bytes(&self, id: RecordId, _bytes: &[u8]) -> Result<()> {
        Err(Error::InvalidOperation(format!(
            "append to {} is not supported by a ref-counted content store",
            id
        )))
    }

    /// Current content of a record, after any queued write to it
    pub fn read_bytes(&self, id: RecordId) -> Result<Vec<u8>> {
        let mut state = self.wait_for_pending(id)?;
        state.ensure_live(id)?;
        let raw = state.read_raw(id)?;
        drop(state);
        // Never written
        if raw.is_empty() {
            return Ok(raw);
        }
        decompress(&raw, self.shared.compression)
    }

    /// Queued writes not yet committed
    pub fn pending_writes(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Bytes queued on the background writer
    pub fn pending_bytes(&self) -> usize {
        self.shared.state.lock().pending_bytes
    }

    pub fn records_count(&self) -> Result<u32> {
        let state = self.shared.state.lock();
        state.ensure_open()?;
        state.table.records_count()
    }

    /// Caller-owned version word in the record table header
    pub fn version(&self) -> Result<u32> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        state.table.version()
    }

    pub fn set_version(&self, version: u32) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        state.table.set_version(version)
    }

    /// True while writes are queued or either file has unsaved changes
    pub fn is_dirty(&self) -> bool {
        let state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        !state.pending.is_empty() || state.table.is_dirty() || state.data.is_dirty()
    }

    /// Commit every queued write and make both files durable
    pub fn flush(&self) -> Result<()> {
        let mut state = self.drain()?;
        state.data.flush()?;
        state.table.force()
    }

    /// Write out at most `max_pages` pages per file
    ///
    /// Returns true once both files are clean, at which point the table
    /// carries the safe-close stamp.
    pub fn flush_some(&self, max_pages: usize) -> Result<bool> {
        let mut state = self.drain()?;
        if !state.data.flush_some(max_pages)? {
            return Ok(false);
        }
        state.table.flush_some(max_pages)
    }

    /// Validate the record table against the data region
    pub fn check_sanity(&self) -> Result<()> {
        let mut state = self.drain()?;
        let data_len = state.data.len();
        state.table.check_sanity(Some(data_len))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        Ok(StoreStats {
            records: state.table.records_count()?,
            free_records: state.table.free_records()?.len(),
            pending_writes: state.pending.len(),
            pending_bytes: state.pending_bytes,
            data_bytes: state.data.len(),
            compression: CompressionStats {
                original_bytes: self.shared.original_bytes.load(Ordering::Relaxed),
                compressed_bytes: self.shared.compressed_bytes.load(Ordering::Relaxed),
            },
        })
    }

    /// Drain queued writes, stop the writer and close both files
    ///
    /// Safe to call more than once. Every step runs even if an earlier one
    /// failed; the first error is returned.
    pub fn close(&self) -> Result<()> {
        if self.shared.state.lock().closed {
            return Ok(());
        }

        let (mut state, mut first_error) = match self.drain() {
            Ok(state) => (state, None),
            Err(e) => (self.shared.state.lock(), Some(e)),
        };
        if state.closed {
            // Closed by another thread while we were draining
            return Ok(());
        }
        state.closed = true;
        state.writer = None;

        if let Err(e) = state.data.dispose() {
            first_error.get_or_insert(e);
        }
        if let Err(e) = state.table.dispose() {
            first_error.get_or_insert(e);
        }
        drop(state);

        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                warn!(path = ?self.base, "Background writer panicked");
            }
        }

        info!(path = ?self.base, "Closed content store");
        first_error.map_or(Ok(()), Err)
    }

    /// Lock the store once `id` has no queued write
    ///
    /// A failure of the record's last background commit is reported here,
    /// once.
    fn wait_for_pending(&self, id: RecordId) -> Result<MutexGuard<'_, StoreState>> {
        loop {
            let mut state = self.shared.state.lock();
            state.ensure_open()?;
            let ticket = state.pending.get(&id).map(|p| Arc::clone(&p.ticket));
            match ticket {
                Some(ticket) => {
                    drop(state);
                    ticket.wait();
                }
                None => {
                    state.take_failure(id)?;
                    return Ok(state);
                }
            }
        }
    }

    /// Lock the store once no writes are queued at all
    fn drain(&self) -> Result<MutexGuard<'_, StoreState>> {
        loop {
            let mut state = self.shared.state.lock();
            state.ensure_open()?;
            if state.pending.is_empty() {
                if let Some((id, source)) = state.failures.pop_first() {
                    return Err(Error::BackgroundWrite {
                        record: id.get(),
                        source: Box::new(source),
                    });
                }
                return Ok(state);
            }
            let tickets: Vec<_> = state
                .pending
                .values()
                .map(|p| Arc::clone(&p.ticket))
                .collect();
            drop(state);
            for ticket in tickets {
                ticket.wait();
            }
        }
    }
}

impl Drop for ContentStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = ?self.base, error = %e, "Failed to close content store on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> Result<ContentStore> {
        ContentStore::with_defaults(dir.path().join("store"))
    }

    #[test]
    fn test_store_paths() {
        let base = Path::new("/tmp/cache/mappings.v2");
        assert_eq!(table_path(base), Path::new("/tmp/cache/mappings.v2.rt"));
        assert_eq!(data_path(base), Path::new("/tmp/cache/mappings.v2.dat"));
    }

    #[test]
    fn test_write_then_read() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir)?;

        let id = store.acquire_new_record()?;
        store.write_bytes(id, b"src/lib.rs -> target/lib.o", false)?;
        assert_eq!(store.read_bytes(id)?, b"src/lib.rs -> target/lib.o");
        Ok(())
    }

    #[test]
    fn test_ref_count_lifecycle() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir)?;

        let id = store.acquire_new_record()?;
        assert_eq!(store.ref_count(id)?, 1);
        store.acquire_record(id)?;
        assert_eq!(store.ref_count(id)?, 2);

        store.release_record(id)?;
        assert!(store.is_live(id)?);
        store.release_record(id)?;
        assert!(!store.is_live(id)?);
        assert!(matches!(store.ref_count(id), Err(Error::InvalidOperation(_))));
        Ok(())
    }

    #[test]
    fn test_append_is_unsupported() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir)?;
        let id = store.acquire_new_record()?;
        assert!(matches!(
            store.append_bytes(id, b"more"),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_operations_after_close_fail() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir)?;
        let id = store.acquire_new_record()?;
        store.close()?;
        store.close()?;

        assert!(!store.is_dirty());
        assert!(matches!(store.read_bytes(id), Err(Error::InvalidOperation(_))));
        assert!(matches!(store.acquire_new_record(), Err(Error::InvalidOperation(_))));
        Ok(())
    }

    #[test]
    fn test_version_round_trip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir)?;
            store.set_version(7)?;
            store.close()?;
        }
        let store = open(&dir)?;
        assert_eq!(store.version()?, 7);
        Ok(())
    }

    #[test]
    fn test_fresh_record_reads_empty() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir)?;
        let id = store.acquire_new_record()?;
        assert!(store.read_bytes(id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_background_failure_reported_once() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir)?;
        let id = store.acquire_new_record()?;
        store
            .shared
            .state
            .lock()
            .failures
            .insert(id, Error::Compression("injected".into()));

        match store.read_bytes(id) {
            Err(Error::BackgroundWrite { record, .. }) => assert_eq!(record, id.get()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.read_bytes(id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_commit_clears_pending_and_reports() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir)?;
        let id = store.acquire_new_record()?;

        // Commits can no longer reach the data region
        store.shared.state.lock().data.dispose()?;
        store.write_bytes(id, &b"lost".repeat(100), false)?;

        match store.read_bytes(id) {
            Err(Error::BackgroundWrite { record, source }) => {
                assert_eq!(record, id.get());
                assert!(matches!(*source, Error::InvalidOperation(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.pending_writes(), 0);
        assert_eq!(store.pending_bytes(), 0);
        assert!(store.shared.state.lock().failures.is_empty());
        Ok(())
    }

    #[test]
    fn test_flush_reports_unclaimed_failure() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir)?;
        let id = store.acquire_new_record()?;
        store
            .shared
            .state
            .lock()
            .failures
            .insert(id, Error::Compression("injected".into()));

        assert!(matches!(store.flush(), Err(Error::BackgroundWrite { .. })));
        store.flush()?;
        Ok(())
    }

    #[test]
    fn test_stats_track_compression() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir)?;
        let id = store.acquire_new_record()?;
        store.write_bytes(id, &b"abcd".repeat(1000), false)?;
        store.flush()?;

        let stats = store.stats()?;
        assert_eq!(stats.records, 1);
        assert_eq!(stats.pending_writes, 0);
        assert_eq!(stats.compression.original_bytes, 4000);
        assert!(stats.compression.compressed_bytes < 4000);
        assert_eq!(stats.data_bytes, region::capacity_for(stats.compression.compressed_bytes as usize, false) as u64);
        Ok(())
    }
}
