//! Outbound send queue.
//!
//! Strict FIFO with at most one active entry, always at position 0. Only
//! entries that have not started may be reordered.

use crate::error::{FlightError, Result};
use crate::identity::TransferId;
use crate::wire::{DEFAULT_MIME_TYPE, FileMetadata};
use std::path::{Path, PathBuf};

/// A local file offered to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFile {
    /// Source path
    pub path: PathBuf,
    /// Name announced to the peer
    pub name: String,
    /// MIME type announced to the peer
    pub mime_type: String,
    /// Size announced to the peer
    pub size: u64,
}

impl OutboundFile {
    /// Describe a file explicitly
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, mime_type: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            mime_type: mime_type.into(),
            size,
        }
    }

    /// Describe a file from its path, reading its size
    ///
    /// # Errors
    ///
    /// Returns `FlightError::Io` if the file cannot be inspected.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(FlightError::Io(format!("{} is not a file", path.display())));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime_type = guess_mime(&name).to_string();
        Ok(Self::new(path, name, mime_type, meta.len()))
    }

    /// Metadata message announcing this file
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            size: self.size,
        }
    }
}

/// Best-effort MIME type from a file extension
pub fn guess_mime(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt" | "log" | "md") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// One queued send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendQueueEntry {
    /// Local identifier
    pub id: TransferId,
    /// File to send
    pub file: OutboundFile,
}

impl SendQueueEntry {
    /// Queue entry with a fresh identifier
    pub fn new(file: OutboundFile) -> Self {
        Self {
            id: TransferId::generate(),
            file,
        }
    }
}

/// FIFO of outbound files
#[derive(Debug, Default)]
pub struct SendQueue {
    entries: Vec<SendQueueEntry>,
    active: bool,
}

impl SendQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn push(&mut self, entry: SendQueueEntry) {
        self.entries.push(entry);
    }

    /// Entry at position 0
    pub fn head(&self) -> Option<&SendQueueEntry> {
        self.entries.first()
    }

    /// The active entry, if any
    pub fn active(&self) -> Option<&SendQueueEntry> {
        if self.active { self.entries.first() } else { None }
    }

    /// Remove an entry that has not started
    ///
    /// The active entry is only removed through [`complete_active`](Self::complete_active).
    pub fn remove(&mut self, id: TransferId) -> Option<SendQueueEntry> {
        let pos = self.position(id)?;
        if self.active && pos == 0 {
            return None;
        }
        Some(self.entries.remove(pos))
    }

    /// Mark the head active and return it
    ///
    /// Returns `None` if an entry is already active or the queue is empty.
    pub fn activate_head(&mut self) -> Option<&SendQueueEntry> {
        if self.active || self.entries.is_empty() {
            return None;
        }
        self.active = true;
        self.entries.first()
    }

    /// Remove the active entry, promoting position 1
    pub fn complete_active(&mut self) -> Option<SendQueueEntry> {
        if !self.active {
            return None;
        }
        self.active = false;
        Some(self.entries.remove(0))
    }

    /// Move a not-yet-active entry to `new_index` (clamped to the queue)
    ///
    /// # Errors
    ///
    /// Returns `FlightError::InvalidState` if the entry is unknown or active.
    pub fn reorder(&mut self, id: TransferId, new_index: usize) -> Result<()> {
        let pos = self
            .position(id)
            .ok_or(FlightError::invalid_state("no such queued transfer"))?;
        if self.active && pos == 0 {
            return Err(FlightError::invalid_state("active transfer cannot be reordered"));
        }

        let min = usize::from(self.active);
        let target = new_index.clamp(min, self.entries.len() - 1);
        let entry = self.entries.remove(pos);
        self.entries.insert(target, entry);
        Ok(())
    }

    /// Position of an entry
    pub fn position(&self, id: TransferId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Identifiers in queue order
    pub fn ids(&self) -> Vec<TransferId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// Number of entries, including the active one
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the queue holds nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.active = false;
    }
}
