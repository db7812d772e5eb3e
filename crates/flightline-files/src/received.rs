//! Handles to completed inbound files.

use crate::buffer::{BufferedFile, storage_key};
use crate::classify::is_hazardous;
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Where a received file's bytes live
#[derive(Clone)]
pub enum FileLocation {
    /// Held in memory
    Memory(Bytes),
    /// Stored in the durable buffer directory
    Durable(PathBuf),
}

impl std::fmt::Debug for FileLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
            Self::Durable(path) => write!(f, "Durable({})", path.display()),
        }
    }
}

/// A completed inbound file
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    /// Name announced by the sender
    pub name: String,
    /// MIME type announced by the sender
    pub mime_type: String,
    /// Bytes actually received
    pub size: u64,
    /// Executable-like name; the UI must not auto-open or auto-save it
    pub hazardous: bool,
    /// Storage location
    pub location: FileLocation,
}

impl ReceivedFile {
    /// Wrap a finalized buffer, classifying its name
    pub fn from_buffer(name: impl Into<String>, mime_type: impl Into<String>, buffered: BufferedFile) -> Self {
        let name = name.into();
        let hazardous = is_hazardous(&name);
        Self {
            name,
            mime_type: mime_type.into(),
            size: buffered.size,
            hazardous,
            location: buffered.location,
        }
    }

    /// Returns true if the bytes live in the durable tier
    pub fn is_durable(&self) -> bool {
        matches!(self.location, FileLocation::Durable(_))
    }

    /// Read the whole file
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the durable artifact cannot be read.
    pub async fn read_all(&self) -> std::io::Result<Bytes> {
        match &self.location {
            FileLocation::Memory(bytes) => Ok(bytes.clone()),
            FileLocation::Durable(path) => tokio::fs::read(path).await.map(Bytes::from),
        }
    }

    /// Write the file into `dir` under a sanitised version of its name
    ///
    /// Returns the path written.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or file cannot be written.
    pub async fn persist_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let target = dir.join(storage_key(&self.name));
        match &self.location {
            FileLocation::Memory(bytes) => tokio::fs::write(&target, bytes).await?,
            FileLocation::Durable(path) => {
                tokio::fs::copy(path, &target).await?;
            }
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_buffer_classifies() {
        let buffered = BufferedFile {
            size: 3,
            location: FileLocation::Memory(Bytes::from_static(b"abc")),
        };
        let file = ReceivedFile::from_buffer("run.bat", "application/x-bat", buffered);
        assert!(file.hazardous);
        assert!(!file.is_durable());
        assert_eq!(file.size, 3);
    }

    #[test]
    fn test_debug_hides_contents() {
        let loc = FileLocation::Memory(Bytes::from(vec![0u8; 4096]));
        assert_eq!(format!("{loc:?}"), "Memory(4096 bytes)");
    }

    #[tokio::test]
    async fn test_persist_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let buffered = BufferedFile {
            size: 5,
            location: FileLocation::Memory(Bytes::from_static(b"hello")),
        };
        let file = ReceivedFile::from_buffer("greeting.txt", "text/plain", buffered);

        let written = file.persist_to(dir.path()).await.unwrap();
        assert_eq!(written, dir.path().join("greeting.txt"));
        assert_eq!(std::fs::read(&written).unwrap(), b"hello");
        assert_eq!(&file.read_all().await.unwrap()[..], b"hello");
    }
}
