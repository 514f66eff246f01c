//! Paged random-access file with an LRU page cache
//!
//! The record table and the data region of a content store both sit on top of
//! this. Reads and writes go through fixed-size pages held in an LRU cache;
//! dirty pages are written back on eviction, on `flush`, or a bounded number
//! at a time via `flush_some`.
//!
//! ```text
//! PagedFile
//!   ├─→ LruCache<page index, Page>   (page_cache_pages entries)
//!   ├─→ logical length               (may run ahead of the OS file)
//!   └─→ File                         (written up to the logical length only)
//! ```

use crate::error::{Error, Result};
use lru::LruCache;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Default page size in bytes
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default number of cached pages
pub const DEFAULT_CACHE_PAGES: usize = 256;

struct Page {
    data: Vec<u8>,
    dirty: bool,
}

/// Random-access file addressed by byte offset
pub struct PagedFile {
    path: PathBuf,
    file: Option<File>,
    page_size: usize,
    pages: LruCache<u64, Page>,
    /// Indexes of pages currently dirty in the cache
    dirty_pages: BTreeSet<u64>,
    length: u64,
}

impl PagedFile {
    /// Open or create a paged file
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize, cache_pages: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if page_size == 0 {
            return Err(Error::Config("page size must be > 0".to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        let length = file.metadata().map_err(|e| Error::io(&path, e))?.len();

        let capacity = NonZeroUsize::new(cache_pages).unwrap_or(NonZeroUsize::MIN);
        debug!(path = ?path, length, page_size, cache_pages, "Opened paged file");

        Ok(Self {
            path,
            file: Some(file),
            page_size,
            pages: LruCache::new(capacity),
            dirty_pages: BTreeSet::new(),
            length,
        })
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical length in bytes
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Check if the file holds no bytes
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// True while any cached page has not been written back
    pub fn is_dirty(&self) -> bool {
        !self.dirty_pages.is_empty()
    }

    /// Check whether `dispose` has been called
    pub fn is_disposed(&self) -> bool {
        self.file.is_none()
    }

    /// Read `buf.len()` bytes starting at `offset`
    pub fn get(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.length {
            return Err(Error::InvalidOperation(format!(
                "read of {} bytes at offset {} past end of {} ({} bytes)",
                buf.len(),
                offset,
                self.path.display(),
                self.length
            )));
        }

        let page_size = self.page_size as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let index = pos / page_size;
            let within = (pos % page_size) as usize;
            let chunk = (self.page_size - within).min(buf.len() - done);

            let page = self.page(index)?;
            buf[done..done + chunk].copy_from_slice(&page.data[within..within + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Write `bytes` at `offset`, extending the logical length if needed
    pub fn put(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        // Extend first: pages evicted mid-put are written up to the length
        let end = offset + bytes.len() as u64;
        if end > self.length {
            self.length = end;
        }

        let page_size = self.page_size as u64;
        let mut done = 0usize;
        while done < bytes.len() {
            let pos = offset + done as u64;
            let index = pos / page_size;
            let within = (pos % page_size) as usize;
            let chunk = (self.page_size - within).min(bytes.len() - done);

            let page = self.page(index)?;
            page.data[within..within + chunk].copy_from_slice(&bytes[done..done + chunk]);
            page.dirty = true;
            self.dirty_pages.insert(index);
            done += chunk;
        }
        Ok(())
    }

    /// Put `bytes` and immediately write the touched pages to the OS file
    pub fn write_through(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.put(offset, bytes)?;
        let page_size = self.page_size as u64;
        let first = offset / page_size;
        let last = (offset + bytes.len().max(1) as u64 - 1) / page_size;
        for index in first..=last {
            self.write_back(index)?;
        }
        Ok(())
    }

    /// Extend the logical length by `len` zero bytes, returning the old end
    pub fn reserve(&mut self, len: u64) -> Result<u64> {
        let start = self.length;
        if len > 0 {
            let zeros = vec![0u8; len as usize];
            self.put(start, &zeros)?;
        }
        Ok(start)
    }

    pub fn get_u32(&mut self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.get(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn put_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.put(offset, &value.to_le_bytes())
    }

    pub fn get_i32(&mut self, offset: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.get(offset, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn put_i32(&mut self, offset: u64, value: i32) -> Result<()> {
        self.put(offset, &value.to_le_bytes())
    }

    pub fn get_u64(&mut self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.get(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn put_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        self.put(offset, &value.to_le_bytes())
    }

    /// Write every dirty page and sync the file
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        let dirty: Vec<u64> = self.dirty_pages.iter().copied().collect();
        for index in dirty {
            self.write_back(index)?;
        }
        self.sync()
    }

    /// Write at most `max_pages` dirty pages
    ///
    /// Returns true if no dirty pages remain afterwards.
    pub fn flush_some(&mut self, max_pages: usize) -> Result<bool> {
        self.ensure_open()?;
        let batch: Vec<u64> = self.dirty_pages.iter().take(max_pages).copied().collect();
        for index in &batch {
            self.write_back(*index)?;
        }
        if !batch.is_empty() {
            self.sync()?;
        }
        trace!(path = ?self.path, written = batch.len(), remaining = self.dirty_pages.len(), "Partial flush");
        Ok(self.dirty_pages.is_empty())
    }

    /// Flush and release the file; further calls fail
    pub fn dispose(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.flush()?;
        self.pages.clear();
        self.file = None;
        debug!(path = ?self.path, length = self.length, "Disposed paged file");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::InvalidOperation(format!(
                "{} is already disposed",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Fetch a page into the cache, writing back whatever it evicts
    fn page(&mut self, index: u64) -> Result<&mut Page> {
        if !self.pages.contains(&index) {
            if self.pages.len() == self.pages.cap().get() {
                if let Some((evicted, old)) = self.pages.pop_lru() {
                    if old.dirty {
                        if let Err(e) = self.write_page(evicted, &old.data) {
                            self.pages.put(evicted, old);
                            return Err(e);
                        }
                        self.dirty_pages.remove(&evicted);
                    }
                }
            }
            let page = self.load(index)?;
            self.pages.put(index, page);
        }
        self.pages
            .get_mut(&index)
            .ok_or_else(|| Error::InvalidOperation(format!("page {} missing from cache", index)))
    }

    fn load(&mut self, index: u64) -> Result<Page> {
        let page_size = self.page_size;
        let path = self.path.clone();
        let file = self.file.as_mut().ok_or_else(|| {
            Error::InvalidOperation(format!("{} is already disposed", path.display()))
        })?;

        let mut data = vec![0u8; page_size];
        let start = index * page_size as u64;
        let on_disk = file.metadata().map_err(|e| Error::io(&path, e))?.len();
        if start < on_disk {
            let available = ((on_disk - start) as usize).min(page_size);
            file.seek(SeekFrom::Start(start))
                .map_err(|e| Error::io(&path, e))?;
            file.read_exact(&mut data[..available])
                .map_err(|e| Error::io(&path, e))?;
        }
        Ok(Page { data, dirty: false })
    }

    fn write_back(&mut self, index: u64) -> Result<()> {
        let data = match self.pages.peek_mut(&index) {
            Some(page) if page.dirty => {
                page.dirty = false;
                page.data.clone()
            }
            _ => {
                self.dirty_pages.remove(&index);
                return Ok(());
            }
        };
        self.write_page(index, &data)?;
        self.dirty_pages.remove(&index);
        Ok(())
    }

    /// Write a page, truncated at the logical length
    fn write_page(&mut self, index: u64, data: &[u8]) -> Result<()> {
        let start = index * self.page_size as u64;
        if start >= self.length {
            return Ok(());
        }
        let len = ((self.length - start) as usize).min(self.page_size);
        let path = self.path.clone();
        let file = self.file.as_mut().ok_or_else(|| {
            Error::InvalidOperation(format!("{} is already disposed", path.display()))
        })?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| Error::io(&path, e))?;
        file.write_all(&data[..len])
            .map_err(|e| Error::io(&path, e))?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        let path = self.path.clone();
        if let Some(file) = self.file.as_mut() {
            file.sync_all().map_err(|e| Error::io(&path, e))?;
        }
        Ok(())
    }
}
