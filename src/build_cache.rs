//! Build cache: the set of content stores behind one incremental build
//!
//! Each dataset (output mappings, source-to-output index, artifact metadata,
//! ...) lives in its own content store under the cache directory. The cache
//! owns those stores and is the only thing that decides to throw data away:
//!
//! - a missing or different `format.version` stamp wipes the whole directory;
//! - a dataset whose store fails to open as corrupted is deleted and reopened
//!   empty, so the next build recomputes it.
//!
//! `flush`, `clean` and `close` reach every open store even when some fail,
//! and report the first failure.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::storage::content::{delete_files, ContentStore};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Version of the cache layout as a whole; bump to force a full rebuild
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Name of the stamp file in the cache directory
pub const STAMP_FILE: &str = "format.version";

/// Handle to an open build cache directory
pub struct BuildCache {
    root: PathBuf,
    config: StoreConfig,
    stores: Mutex<BTreeMap<String, Arc<ContentStore>>>,
    rebuilt: Mutex<BTreeSet<String>>,
    wiped_on_open: bool,
}

impl BuildCache {
    /// Open the cache at `root`, wiping it if its format stamp does not match
    pub fn open<P: AsRef<Path>>(root: P, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;

        let expected = CACHE_FORMAT_VERSION.to_string();
        let wiped_on_open = match read_stamp(&root)? {
            Some(found) if found == expected => false,
            Some(found) => {
                warn!(path = ?root, found = %found, expected = %expected, "Build cache format changed, rebuilding");
                wipe_dir(&root)?;
                true
            }
            None if dir_has_entries(&root)? => {
                warn!(path = ?root, "Build cache has no format stamp, rebuilding");
                wipe_dir(&root)?;
                true
            }
            None => false,
        };
        write_stamp(&root)?;

        info!(path = ?root, wiped = wiped_on_open, "Opened build cache");
        Ok(Self {
            root,
            config,
            stores: Mutex::new(BTreeMap::new()),
            rebuilt: Mutex::new(BTreeSet::new()),
            wiped_on_open,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `open` discarded an incompatible cache
    pub fn wiped_on_open(&self) -> bool {
        self.wiped_on_open
    }

    /// Store for a dataset, opened on first use
    ///
    /// A dataset whose files are corrupted is deleted and recreated empty.
    pub fn store(&self, name: &str) -> Result<Arc<ContentStore>> {
        validate_dataset_name(name)?;
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(name) {
            return Ok(Arc::clone(store));
        }

        let base = self.root.join(name);
        let store = match ContentStore::open(&base, &self.config) {
            Ok(store) => store,
            Err(Error::Corrupted { path, reason }) => {
                warn!(dataset = name, path = ?path, reason = %reason, "Dataset corrupted, rebuilding");
                delete_files(&base)?;
                self.rebuilt.lock().insert(name.to_string());
                ContentStore::open(&base, &self.config)?
            }
            Err(e) => return Err(e),
        };

        let store = Arc::new(store);
        stores.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Names of open datasets
    pub fn datasets(&self) -> Vec<String> {
        self.stores.lock().keys().cloned().collect()
    }

    /// Datasets recreated empty because their files were corrupted
    pub fn rebuilt_datasets(&self) -> Vec<String> {
        self.rebuilt.lock().iter().cloned().collect()
    }

    /// Flush every open store
    pub fn flush(&self) -> Result<()> {
        let stores = self.open_stores();
        first_error(stores.par_iter().map(|store| store.flush()).collect())
    }

    /// Close every open store and forget them
    pub fn close(&self) -> Result<()> {
        let stores: Vec<_> = std::mem::take(&mut *self.stores.lock())
            .into_values()
            .collect();
        let outcome = first_error(stores.par_iter().map(|store| store.close()).collect());
        info!(path = ?self.root, stores = stores.len(), "Closed build cache");
        outcome
    }

    /// Drop all cached data: close every store and wipe the directory
    pub fn clean(&self) -> Result<()> {
        let closed = self.close();
        wipe_dir(&self.root)?;
        write_stamp(&self.root)?;
        self.rebuilt.lock().clear();
        info!(path = ?self.root, "Cleaned build cache");
        closed
    }

    fn open_stores(&self) -> Vec<Arc<ContentStore>> {
        self.stores.lock().values().cloned().collect()
    }
}

impl Drop for BuildCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = ?self.root, error = %e, "Failed to close build cache on drop");
        }
    }
}

fn validate_dataset_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != STAMP_FILE
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidOperation(format!(
            "invalid dataset name '{}'",
            name
        )))
    }
}

fn first_error(outcomes: Vec<Result<()>>) -> Result<()> {
    outcomes.into_iter().find(Result::is_err).unwrap_or(Ok(()))
}

fn read_stamp(root: &Path) -> Result<Option<String>> {
    let path = root.join(STAMP_FILE);
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(Some(text.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(&path, e)),
    }
}

fn write_stamp(root: &Path) -> Result<()> {
    let path = root.join(STAMP_FILE);
    std::fs::write(&path, format!("{}\n", CACHE_FORMAT_VERSION)).map_err(|e| Error::io(&path, e))
}

fn dir_has_entries(root: &Path) -> Result<bool> {
    let mut entries = std::fs::read_dir(root).map_err(|e| Error::io(root, e))?;
    Ok(entries.next().is_some())
}

fn wipe_dir(root: &Path) -> Result<()> {
    for entry in std::fs::read_dir(root).map_err(|e| Error::io(root, e))? {
        let path = entry.map_err(|e| Error::io(root, e))?.path();
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.map_err(|e| Error::io(&path, e))?;
    }
    Ok(())
}
