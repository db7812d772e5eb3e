//! Inbound buffer tiers.
//!
//! Small files are assembled in memory. Large files go to a durable
//! directory when the policy allows it and the storage probe succeeded at
//! startup. Each durable target gets its own artifact named after a
//! per-session serial and a sanitised form of the inbound name, so a later
//! file never overwrites an earlier one. Every artifact created by this
//! session is removed on [`BufferTier::reset`].

use crate::DEFAULT_DURABLE_THRESHOLD;
use crate::error::BufferError;
use crate::received::FileLocation;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// Upper bound on the up-front reservation for in-memory buffers
const MAX_MEMORY_RESERVATION: u64 = 16 * 1024 * 1024;

/// Storage tier selected for an inbound file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Bytes accumulate in process memory
    Memory,
    /// Bytes are appended to a file in the durable directory
    Durable,
}

/// Tier selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    /// Durable buffering enabled by configuration
    pub durable_enabled: bool,
    /// Size at or above which durable buffering is preferred
    pub durable_threshold: u64,
    /// Result of the startup capability probe
    pub durable_available: bool,
}

impl TierPolicy {
    /// Policy that never leaves memory
    pub fn memory_only() -> Self {
        Self {
            durable_enabled: false,
            durable_threshold: DEFAULT_DURABLE_THRESHOLD,
            durable_available: false,
        }
    }

    /// Decide the tier for a file of `expected_size` bytes
    pub fn select(&self, expected_size: u64) -> Tier {
        if self.durable_enabled && self.durable_available && expected_size >= self.durable_threshold
        {
            Tier::Durable
        } else {
            Tier::Memory
        }
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::memory_only()
    }
}

/// A finalized inbound buffer
#[derive(Debug, Clone)]
pub struct BufferedFile {
    /// Bytes written
    pub size: u64,
    /// Where the bytes live
    pub location: FileLocation,
}

enum WriteTarget {
    Memory(Vec<u8>),
    Durable { file: File, path: PathBuf },
}

struct OpenBuffer {
    target: WriteTarget,
    written: u64,
}

/// Memory or durable buffering of inbound bytes
///
/// At most one write target exists per name; [`begin_buffer`](Self::begin_buffer)
/// replaces a stale target rather than interleaving with it.
pub struct BufferTier {
    policy: TierPolicy,
    dir: PathBuf,
    open: HashMap<String, OpenBuffer>,
    /// Durable files created this session, including finalized ones
    artifacts: HashSet<PathBuf>,
    next_serial: u64,
}

impl BufferTier {
    /// Create a buffer tier rooted at `dir`
    pub fn new(policy: TierPolicy, dir: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            dir: dir.into(),
            open: HashMap::new(),
            artifacts: HashSet::new(),
            next_serial: 0,
        }
    }

    /// Buffer tier that only ever uses memory
    pub fn in_memory() -> Self {
        Self::new(TierPolicy::memory_only(), std::env::temp_dir())
    }

    /// Selection policy in effect
    pub fn policy(&self) -> TierPolicy {
        self.policy
    }

    /// Durable directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns true if a file of `expected_size` bytes should be buffered durably
    pub fn should_use_durable_buffer(&self, expected_size: u64) -> bool {
        self.policy.select(expected_size) == Tier::Durable
    }

    /// Number of open write targets
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Number of durable artifacts owned by this session
    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }

    /// Bytes written so far under `name`
    pub fn written(&self, name: &str) -> Option<u64> {
        self.open.get(name).map(|b| b.written)
    }

    /// Open a write target for `name`, replacing any stale one
    ///
    /// # Errors
    ///
    /// Returns `BufferError::Begin` if the durable target cannot be created.
    pub async fn begin_buffer(&mut self, name: &str, expected_size: u64) -> Result<Tier, BufferError> {
        self.discard(name).await;

        let tier = self.policy.select(expected_size);
        let target = match tier {
            Tier::Memory => {
                let reserve = expected_size.min(MAX_MEMORY_RESERVATION) as usize;
                WriteTarget::Memory(Vec::with_capacity(reserve))
            }
            Tier::Durable => {
                let begin_err = |source| BufferError::Begin {
                    name: name.to_string(),
                    source,
                };
                fs::create_dir_all(&self.dir).await.map_err(begin_err)?;
                let (file, path) = self.create_artifact(name).await.map_err(begin_err)?;
                self.artifacts.insert(path.clone());
                WriteTarget::Durable { file, path }
            }
        };

        tracing::debug!(
            "Buffering {} in {:?} tier ({} bytes expected)",
            name,
            tier,
            expected_size
        );

        self.open.insert(
            name.to_string(),
            OpenBuffer { target, written: 0 },
        );
        Ok(tier)
    }

    /// Create a fresh artifact for `name`, skipping leftovers from earlier runs
    async fn create_artifact(&mut self, name: &str) -> std::io::Result<(File, PathBuf)> {
        let key = storage_key(name);
        loop {
            let path = self.dir.join(format!("{:04}-{}", self.next_serial, key));
            self.next_serial += 1;
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((file, path)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Append `bytes` to the target for `name`
    ///
    /// Returns the total number of bytes written so far.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::StorageWrite` if the durable write fails and
    /// `BufferError::NotOpen` if no target exists.
    pub async fn write_chunk(&mut self, name: &str, bytes: &[u8]) -> Result<u64, BufferError> {
        let buffer = self
            .open
            .get_mut(name)
            .ok_or_else(|| BufferError::NotOpen(name.to_string()))?;

        match &mut buffer.target {
            WriteTarget::Memory(data) => data.extend_from_slice(bytes),
            WriteTarget::Durable { file, .. } => {
                file.write_all(bytes)
                    .await
                    .map_err(|source| BufferError::StorageWrite {
                        name: name.to_string(),
                        source,
                    })?;
            }
        }

        buffer.written += bytes.len() as u64;
        Ok(buffer.written)
    }

    /// Close the target for `name` and hand back the assembled file
    ///
    /// # Errors
    ///
    /// Returns `BufferError::Finalize` if flushing the durable target fails
    /// and `BufferError::NotOpen` if no target exists.
    pub async fn finalize(&mut self, name: &str) -> Result<BufferedFile, BufferError> {
        let buffer = self
            .open
            .remove(name)
            .ok_or_else(|| BufferError::NotOpen(name.to_string()))?;

        let location = match buffer.target {
            WriteTarget::Memory(data) => FileLocation::Memory(Bytes::from(data)),
            WriteTarget::Durable { mut file, path } => {
                let finalize_err = |source| BufferError::Finalize {
                    name: name.to_string(),
                    source,
                };
                file.flush().await.map_err(finalize_err)?;
                file.sync_all().await.map_err(finalize_err)?;
                FileLocation::Durable(path)
            }
        };

        Ok(BufferedFile {
            size: buffer.written,
            location,
        })
    }

    /// Drop the target for `name`, deleting its durable artifact
    pub async fn discard(&mut self, name: &str) {
        let Some(buffer) = self.open.remove(name) else {
            return;
        };

        if let WriteTarget::Durable { file, path } = buffer.target {
            drop(file);
            self.artifacts.remove(&path);
            remove_artifact(&path).await;
        }

        tracing::debug!("Discarded buffer for {} ({} bytes)", name, buffer.written);
    }

    /// Close every target and delete all durable artifacts of this session
    ///
    /// Safe to call repeatedly and with nothing open.
    pub async fn reset(&mut self) {
        let open = self.open.len();
        // Closing the handles before unlinking keeps Windows happy
        self.open.clear();

        let artifacts: Vec<PathBuf> = self.artifacts.drain().collect();
        for path in &artifacts {
            remove_artifact(path).await;
        }

        if open > 0 || !artifacts.is_empty() {
            tracing::debug!(
                "Buffer tier reset: closed {} targets, removed {} artifacts",
                open,
                artifacts.len()
            );
        }
    }
}

impl std::fmt::Debug for BufferTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferTier")
            .field("policy", &self.policy)
            .field("dir", &self.dir)
            .field("open", &self.open.len())
            .field("artifacts", &self.artifacts.len())
            .finish()
    }
}

async fn remove_artifact(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove buffer artifact {}: {}", path.display(), e),
    }
}

/// Map an inbound file name onto a safe single path component
pub fn storage_key(name: &str) -> String {
    let key: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = key.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn durable_policy(threshold: u64) -> TierPolicy {
        TierPolicy {
            durable_enabled: true,
            durable_threshold: threshold,
            durable_available: true,
        }
    }

    #[test]
    fn test_tier_selection() {
        let policy = durable_policy(1000);
        assert_eq!(policy.select(999), Tier::Memory);
        assert_eq!(policy.select(1000), Tier::Durable);
        assert_eq!(policy.select(5000), Tier::Durable);

        let unavailable = TierPolicy {
            durable_available: false,
            ..policy
        };
        assert_eq!(unavailable.select(u64::MAX), Tier::Memory);

        let disabled = TierPolicy {
            durable_enabled: false,
            ..policy
        };
        assert_eq!(disabled.select(u64::MAX), Tier::Memory);
    }

    #[test]
    fn test_storage_key() {
        assert_eq!(storage_key("report.pdf"), "report.pdf");
        assert_eq!(storage_key("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(storage_key(".."), "_");
        assert_eq!(storage_key(""), "_");
        assert_eq!(storage_key("a/b\\c:d"), "a_b_c_d");
    }

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let mut tier = BufferTier::in_memory();
        assert_eq!(tier.begin_buffer("a.txt", 10).await.unwrap(), Tier::Memory);
        tier.write_chunk("a.txt", b"hello ").await.unwrap();
        assert_eq!(tier.write_chunk("a.txt", b"world").await.unwrap(), 11);

        let file = tier.finalize("a.txt").await.unwrap();
        assert_eq!(file.size, 11);
        match file.location {
            FileLocation::Memory(bytes) => assert_eq!(&bytes[..], b"hello world"),
            FileLocation::Durable(_) => panic!("expected memory tier"),
        }
        assert_eq!(tier.open_count(), 0);
    }

    #[tokio::test]
    async fn test_durable_roundtrip_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = BufferTier::new(durable_policy(4), dir.path());

        assert_eq!(tier.begin_buffer("big.iso", 8).await.unwrap(), Tier::Durable);
        tier.write_chunk("big.iso", b"abcd").await.unwrap();
        tier.write_chunk("big.iso", b"efgh").await.unwrap();

        let file = tier.finalize("big.iso").await.unwrap();
        let path = match &file.location {
            FileLocation::Durable(path) => path.clone(),
            FileLocation::Memory(_) => panic!("expected durable tier"),
        };
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefgh");
        assert_eq!(tier.artifact_count(), 1);

        tier.reset().await;
        assert!(!path.exists());
        assert_eq!(tier.artifact_count(), 0);
    }

    #[tokio::test]
    async fn test_begin_replaces_stale_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = BufferTier::new(durable_policy(0), dir.path());

        tier.begin_buffer("dup.bin", 10).await.unwrap();
        tier.write_chunk("dup.bin", b"stale-data").await.unwrap();

        tier.begin_buffer("dup.bin", 10).await.unwrap();
        assert_eq!(tier.written("dup.bin"), Some(0));
        tier.write_chunk("dup.bin", b"fresh").await.unwrap();

        let file = tier.finalize("dup.bin").await.unwrap();
        assert_eq!(file.size, 5);
        if let FileLocation::Durable(path) = file.location {
            assert_eq!(std::fs::read(path).unwrap(), b"fresh");
        }
    }

    #[tokio::test]
    async fn test_write_without_begin() {
        let mut tier = BufferTier::in_memory();
        let err = tier.write_chunk("ghost", b"x").await.unwrap_err();
        assert!(matches!(err, BufferError::NotOpen(_)));

        let err = tier.finalize("ghost").await.unwrap_err();
        assert!(matches!(err, BufferError::NotOpen(_)));
    }

    #[tokio::test]
    async fn test_discard_removes_durable_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = BufferTier::new(durable_policy(0), dir.path());

        tier.begin_buffer("partial.bin", 100).await.unwrap();
        tier.write_chunk("partial.bin", b"half").await.unwrap();
        tier.discard("partial.bin").await;

        assert_eq!(tier.open_count(), 0);
        assert_eq!(tier.artifact_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    async fn durable_receive(tier: &mut BufferTier, name: &str, data: &[u8]) -> PathBuf {
        tier.begin_buffer(name, data.len() as u64).await.unwrap();
        tier.write_chunk(name, data).await.unwrap();
        match tier.finalize(name).await.unwrap().location {
            FileLocation::Durable(path) => path,
            FileLocation::Memory(_) => panic!("expected durable tier"),
        }
    }

    #[tokio::test]
    async fn test_same_name_keeps_finalized_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = BufferTier::new(durable_policy(0), dir.path());

        let first = durable_receive(&mut tier, "photo.jpg", b"FIRST-FILE").await;
        let second = durable_receive(&mut tier, "photo.jpg", b"2nd").await;

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"FIRST-FILE");
        assert_eq!(std::fs::read(&second).unwrap(), b"2nd");
        assert_eq!(tier.artifact_count(), 2);

        tier.reset().await;
        assert!(!first.exists());
        assert!(!second.exists());
    }

    #[tokio::test]
    async fn test_colliding_keys_stay_separate() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = BufferTier::new(durable_policy(0), dir.path());
        assert_eq!(storage_key("a:b"), storage_key("a?b"));

        let colon = durable_receive(&mut tier, "a:b", b"COLON").await;
        let question = durable_receive(&mut tier, "a?b", b"QM").await;

        assert_eq!(std::fs::read(&colon).unwrap(), b"COLON");
        assert_eq!(std::fs::read(&question).unwrap(), b"QM");
    }

    #[tokio::test]
    async fn test_leftover_artifact_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let leftover = dir.path().join("0000-old.bin");
        std::fs::write(&leftover, b"from an earlier run").unwrap();

        let mut tier = BufferTier::new(durable_policy(0), dir.path());
        let path = durable_receive(&mut tier, "old.bin", b"new").await;

        assert_ne!(path, leftover);
        assert_eq!(std::fs::read(&leftover).unwrap(), b"from an earlier run");
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let mut tier = BufferTier::in_memory();
        tier.reset().await;
        tier.reset().await;
        assert_eq!(tier.open_count(), 0);

        tier.begin_buffer("x", 1).await.unwrap();
        tier.reset().await;
        tier.reset().await;
        assert_eq!(tier.open_count(), 0);
    }

    #[tokio::test]
    async fn test_begin_fails_when_dir_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a dir").unwrap();

        let mut tier = BufferTier::new(durable_policy(0), &blocker);
        let err = tier.begin_buffer("a.bin", 10).await.unwrap_err();
        assert!(matches!(err, BufferError::Begin { .. }));
        assert!(err.is_storage_failure());
    }
}
