//! Error types for chunk production and inbound buffering.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while producing chunks from a local file
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The source file could not be opened
    #[error("cannot open {}: {source}", path.display())]
    Open {
        /// File being sent
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Reading the source file failed mid-transfer
    #[error("read failed on {}: {source}", path.display())]
    Read {
        /// File being sent
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the inbound buffer tiers
///
/// `StorageWrite` and `Finalize` are the distinguishable failures the
/// receiver reacts to by abandoning the transfer.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Durable write target could not be opened
    #[error("cannot open durable buffer for {name}: {source}")]
    Begin {
        /// Inbound file name
        name: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Appending bytes failed (storage full or gone)
    #[error("storage write failed for {name}: {source}")]
    StorageWrite {
        /// Inbound file name
        name: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Closing the write target failed
    #[error("finalize failed for {name}: {source}")]
    Finalize {
        /// Inbound file name
        name: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// No write target is open under this name
    #[error("no open buffer for {0}")]
    NotOpen(String),
}

impl BufferError {
    /// Name of the inbound file the error belongs to
    #[must_use]
    pub fn file_name(&self) -> &str {
        match self {
            Self::Begin { name, .. }
            | Self::StorageWrite { name, .. }
            | Self::Finalize { name, .. } => name,
            Self::NotOpen(name) => name,
        }
    }

    /// Returns true if the storage medium rejected a write
    #[must_use]
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Begin { .. } | Self::StorageWrite { .. })
    }
}
