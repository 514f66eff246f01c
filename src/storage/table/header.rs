//! Record table header and the safe-close magic protocol
//!
//! ```text
//!   [0..4]   magic:    u32
//!   [4..8]   version:  u32   (owned by the caller)
//!   [8..12]  flags:    u32   (owned by the layer above; the content store
//!                             records its compression here)
//!   [12..16] reserved
//! ```
//!
//! The magic word is `CONNECTED_MAGIC` while the table is open with unsaved
//! changes and `safely_closed_magic(format)` once it has been forced or
//! disposed. Any other value means the file cannot be trusted.

/// Header size in bytes; slots start right after it
pub const HEADER_SIZE: u64 = 16;

pub const MAGIC_OFFSET: u64 = 0;
pub const VERSION_OFFSET: u64 = 4;
pub const FLAGS_OFFSET: u64 = 8;

/// Written on the first mutation after open or force
pub const CONNECTED_MAGIC: u32 = 0x12AD_34E4;

const SAFELY_CLOSED_BASE: u32 = 0x1F2F_3F4F;

/// Magic written after a clean shutdown of a table with the given format
pub const fn safely_closed_magic(format_version: u32) -> u32 {
    SAFELY_CLOSED_BASE.wrapping_add(format_version)
}

/// Meaning of a magic word found on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicState {
    /// Left behind by a process that never closed the table
    Connected,
    /// Closed cleanly by the current format
    SafelyClosed,
    /// Anything else, including a safe-close stamp from another format
    Unknown(u32),
}

impl MagicState {
    pub fn classify(magic: u32, format_version: u32) -> Self {
        if magic == CONNECTED_MAGIC {
            MagicState::Connected
        } else if magic == safely_closed_magic(format_version) {
            MagicState::SafelyClosed
        } else {
            MagicState::Unknown(magic)
        }
    }
}
