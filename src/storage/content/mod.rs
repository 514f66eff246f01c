//! Reference-counted content store
//!
//! # Architecture
//!
//! ```text
//! ContentStore
//!   ├─→ RecordTable<RefCountedSlots>   (<base>.rt: id → address, size, capacity, ref count)
//!   ├─→ PagedFile                      (<base>.dat: compressed payloads)
//!   └─→ background writer              (compress + commit, one job at a time)
//! ```

pub mod compression;
pub mod pending;
pub mod region;
pub mod store;
mod worker;

pub use compression::{compress, decompress, CompressionAlgorithm, CompressionStats};
pub use store::{data_path, delete_files, table_path, ContentStore, StoreStats};
