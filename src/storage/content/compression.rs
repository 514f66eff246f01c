//! Compression of stored payloads

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Transform applied to payloads before they reach the data region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Zstd,
}

impl CompressionAlgorithm {
    /// Value recorded in the record table header; `0` means unstamped
    pub fn stamp(self) -> u32 {
        match self {
            CompressionAlgorithm::None => 1,
            CompressionAlgorithm::Zstd => 2,
        }
    }

    /// Decode a header stamp; `Ok(None)` for a store that was never stamped
    pub fn from_stamp(stamp: u32) -> std::result::Result<Option<Self>, u32> {
        match stamp {
            0 => Ok(None),
            1 => Ok(Some(CompressionAlgorithm::None)),
            2 => Ok(Some(CompressionAlgorithm::Zstd)),
            other => Err(other),
        }
    }
}

/// Encode a payload; `level` only matters for zstd
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm, level: i32) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => zstd::stream::encode_all(data, level)
            .map_err(|e| Error::Compression(format!("zstd encode of {} bytes: {}", data.len(), e))),
    }
}

/// Inverse of `compress` for the same algorithm
pub fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => zstd::stream::decode_all(data)
            .map_err(|e| Error::Compression(format!("zstd decode of {} bytes: {}", data.len(), e))),
    }
}

/// Running totals of bytes handed to and produced by the compressor
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompressionStats {
    pub original_bytes: u64,
    pub compressed_bytes: u64,
}

impl CompressionStats {
    /// Compressed size over original size, 1.0 when nothing was written
    pub fn ratio(&self) -> f64 {
        if self.original_bytes > 0 {
            self.compressed_bytes as f64 / self.original_bytes as f64
        } else {
            1.0
        }
    }

    /// Share of input bytes the compressor removed, in percent
    pub fn space_saved_percent(&self) -> f64 {
        (1.0 - self.ratio()) * 100.0
    }
}
