//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! ContentStore (ref counts, compression, write-behind)
//!   ├─→ RecordTable<RefCountedSlots>  fixed header + fixed slots, safe-close magic
//!   │     └─→ PagedFile
//!   └─→ data region
//!         └─→ PagedFile
//! ```
//!
//! ## Record tables
//!
//! A record table maps a 1-based id to `(address, size, capacity)` and keeps
//! freed ids for reuse. The slot layout is a type parameter, so the
//! ref-counted variant costs nothing on the plain one's path.
//!
//! ## Crash detection
//!
//! The header magic is rewritten to a "connected" value on the first change
//! after open and back to a "safely closed" value by `force`/`dispose`. A
//! table found in any other state on open is reported as corrupted.

pub mod content;
pub mod paged_file;
pub mod table;

pub use content::{CompressionAlgorithm, ContentStore, StoreStats};
pub use paged_file::PagedFile;
pub use table::{PlainSlots, RecordId, RecordSlot, RecordTable, RefCountedSlots};
