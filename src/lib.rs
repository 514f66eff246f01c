// buildstore - persistent storage for incremental build metadata
// Crash-aware record tables under a ref-counted, compressed blob store

#![warn(rust_2018_idioms)]

pub mod build_cache;
pub mod config;
pub mod storage;

// Re-exports for convenience
pub use build_cache::BuildCache;
pub use config::StoreConfig;
pub use storage::{ContentStore, RecordId, RecordTable};

/// buildstore error types
pub mod error {
    use std::path::{Path, PathBuf};
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        /// The files cannot be trusted and must be deleted and rebuilt
        #[error("Corrupted storage {}: {reason}", .path.display())]
        Corrupted { path: PathBuf, reason: String },

        #[error("I/O error on {}: {source}", .path.display())]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },

        #[error("Invalid operation: {0}")]
        InvalidOperation(String),

        /// A queued write of `record` failed on the background writer
        #[error("Background write of record {record} failed: {source}")]
        BackgroundWrite {
            record: u32,
            #[source]
            source: Box<Error>,
        },

        #[error("Compression error: {0}")]
        Compression(String),

        #[error("Invalid configuration: {0}")]
        Config(String),
    }

    impl Error {
        pub(crate) fn io<P: AsRef<Path>>(path: P, source: std::io::Error) -> Self {
            Error::Io {
                path: path.as_ref().to_path_buf(),
                source,
            }
        }

        /// Whether the store has to be deleted and rebuilt
        pub fn is_corruption(&self) -> bool {
            match self {
                Error::Corrupted { .. } => true,
                Error::BackgroundWrite { source, .. } => source.is_corruption(),
                _ => false,
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
