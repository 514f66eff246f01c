//! Content store configuration
//!
//! Defaults match what the build cache uses in production. A config can also
//! be read from a TOML file; missing keys fall back to the defaults.
//!
//! ```toml
//! pending_write_limit = 20971520
//! compression = "zstd"
//! compression_level = 3
//! page_size = 4096
//! page_cache_pages = 256
//! synchronous_raw = false
//! ```

use crate::error::{Error, Result};
use crate::storage::content::compression::CompressionAlgorithm;
use crate::storage::paged_file::{DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bytes of queued writes above which writes are committed synchronously
pub const DEFAULT_PENDING_WRITE_LIMIT: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Cap on bytes waiting for the background writer
    pub pending_write_limit: usize,
    /// Transform applied to payloads before they are stored
    pub compression: CompressionAlgorithm,
    /// zstd level, ignored without compression
    pub compression_level: i32,
    /// Page size of both backing files
    pub page_size: usize,
    /// Pages cached per backing file
    pub page_cache_pages: usize,
    /// Debug mode: no compression and no write-behind
    pub synchronous_raw: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pending_write_limit: DEFAULT_PENDING_WRITE_LIMIT,
            compression: CompressionAlgorithm::Zstd,
            compression_level: 3,
            page_size: DEFAULT_PAGE_SIZE,
            page_cache_pages: DEFAULT_CACHE_PAGES,
            synchronous_raw: false,
        }
    }
}

impl StoreConfig {
    /// Raw, synchronous configuration for inspecting stored content
    pub fn debug() -> Self {
        Self {
            compression: CompressionAlgorithm::None,
            synchronous_raw: true,
            ..Self::default()
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Compression actually applied to payloads
    pub fn effective_compression(&self) -> CompressionAlgorithm {
        if self.synchronous_raw {
            CompressionAlgorithm::None
        } else {
            self.compression
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pending_write_limit == 0 {
            return Err(Error::Config("pending_write_limit must be > 0".into()));
        }
        if self.page_size < 64 || !self.page_size.is_power_of_two() {
            return Err(Error::Config(
                "page_size must be a power of two >= 64".into(),
            ));
        }
        if self.page_cache_pages == 0 {
            return Err(Error::Config("page_cache_pages must be > 0".into()));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(Error::Config("compression_level must be in [1, 22]".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pending_write_limit, 20 * 1024 * 1024);
        assert_eq!(config.effective_compression(), CompressionAlgorithm::Zstd);
    }

    #[test]
    fn test_debug_disables_compression() {
        let config = StoreConfig::debug();
        assert!(config.synchronous_raw);
        assert_eq!(config.effective_compression(), CompressionAlgorithm::None);
    }

    #[test]
    fn test_partial_toml_uses_defaults() -> Result<()> {
        let config = StoreConfig::from_toml_str("pending_write_limit = 1024\ncompression = \"none\"")?;
        assert_eq!(config.pending_write_limit, 1024);
        assert_eq!(config.compression, CompressionAlgorithm::None);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        Ok(())
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            StoreConfig::from_toml_str("page_size = 100"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("pending_write_limit = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("compression = \"lz4\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        std::fs::write(&path, "synchronous_raw = true\n").unwrap();

        let config = StoreConfig::load(&path)?;
        assert!(config.synchronous_raw);
        Ok(())
    }
}
