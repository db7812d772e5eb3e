//! # Flightline Files
//!
//! File side of the Flightline transfer engine.
//!
//! This crate provides:
//! - Chunk production off the session loop ([`chunker::ChunkSource`])
//! - Inbound buffering in memory or durable storage ([`buffer::BufferTier`])
//! - Durable storage capability detection
//! - Classification of executable-like file names
//! - Handles to completed inbound files

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod chunker;
pub mod classify;
pub mod detect;
pub mod error;
pub mod received;

pub use buffer::{BufferTier, BufferedFile, Tier, TierPolicy};
pub use chunker::{ChunkEvent, ChunkSource, ChunkStream, FileChunker};
pub use classify::is_hazardous;
pub use detect::durable_storage_available;
pub use error::{BufferError, ChunkError};
pub use received::{FileLocation, ReceivedFile};

/// Default chunk size (64 KiB)
///
/// Data channel implementations commonly reject messages above 256 KiB and
/// fragment anything above 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default size at which inbound files move to the durable tier (256 MiB)
pub const DEFAULT_DURABLE_THRESHOLD: u64 = 256 * 1024 * 1024;
