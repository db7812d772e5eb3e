//! File chunking.
//!
//! A [`ChunkSource`] reads a file on its own tokio task and hands ordered
//! chunks back over a bounded channel, so large reads never stall the session
//! loop. The channel bound is the producer half of backpressure: once the
//! consumer stops pulling, the reader parks on `send`.

use crate::DEFAULT_CHUNK_SIZE;
use crate::error::ChunkError;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default number of chunks buffered between reader task and consumer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// Chunk a file into fixed-size pieces
#[derive(Debug, Clone, Copy)]
pub struct FileChunker {
    chunk_size: usize,
}

impl FileChunker {
    /// Create a new chunker with default chunk size
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Create a new chunker with custom chunk size (zero selects the default)
    pub fn with_chunk_size(size: usize) -> Self {
        let chunk_size = if size == 0 { DEFAULT_CHUNK_SIZE } else { size };
        Self { chunk_size }
    }

    /// Get chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Calculate number of chunks for a file
    pub fn chunk_count(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.chunk_size as u64)
    }
}

impl Default for FileChunker {
    fn default() -> Self {
        Self::new()
    }
}

/// Output of a running [`ChunkSource`]
#[derive(Debug)]
pub enum ChunkEvent {
    /// Next chunk, in file order
    Chunk(Bytes),
    /// File fully read; no more chunks follow
    Done,
    /// Reading failed; no more chunks follow
    Failed(ChunkError),
}

/// Spawns chunk producers for files
#[derive(Debug, Clone, Copy)]
pub struct ChunkSource {
    chunker: FileChunker,
    capacity: usize,
}

impl ChunkSource {
    /// Create a chunk source
    ///
    /// # Arguments
    ///
    /// * `chunk_size` - Bytes per chunk (the final chunk may be shorter)
    /// * `capacity` - Chunks buffered between reader and consumer
    pub fn new(chunk_size: usize, capacity: usize) -> Self {
        Self {
            chunker: FileChunker::with_chunk_size(chunk_size),
            capacity: capacity.max(1),
        }
    }

    /// Chunker in use
    pub fn chunker(&self) -> FileChunker {
        self.chunker
    }

    /// Start producing chunks for `path` on a separate task
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, path: impl Into<PathBuf>) -> ChunkStream {
        let path = path.into();
        let (tx, rx) = mpsc::channel(self.capacity);
        let chunk_size = self.chunker.chunk_size();

        tracing::debug!(
            "Starting chunk producer for {} (chunk_size={})",
            path.display(),
            chunk_size
        );

        let task = tokio::spawn(produce(path.clone(), chunk_size, tx));

        ChunkStream {
            path,
            rx: Some(rx),
            task,
        }
    }
}

impl Default for ChunkSource {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHANNEL_CAPACITY)
    }
}

/// Reader loop: fills each chunk completely before handing it over.
async fn produce(path: PathBuf, chunk_size: usize, tx: mpsc::Sender<ChunkEvent>) {
    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(source) => {
            let _ = tx.send(ChunkEvent::Failed(ChunkError::Open { path, source })).await;
            return;
        }
    };

    loop {
        let mut buf = vec![0u8; chunk_size];
        let mut filled = 0;

        while filled < chunk_size {
            match file.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    let _ = tx.send(ChunkEvent::Failed(ChunkError::Read { path, source })).await;
                    return;
                }
            }
        }

        if filled == 0 {
            let _ = tx.send(ChunkEvent::Done).await;
            return;
        }

        buf.truncate(filled);
        if tx.send(ChunkEvent::Chunk(Bytes::from(buf))).await.is_err() {
            // Consumer cancelled
            return;
        }

        if filled < chunk_size {
            let _ = tx.send(ChunkEvent::Done).await;
            return;
        }
    }
}

/// Handle to a running chunk producer
pub struct ChunkStream {
    path: PathBuf,
    rx: Option<mpsc::Receiver<ChunkEvent>>,
    task: JoinHandle<()>,
}

impl ChunkStream {
    /// File being read
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Receive the next event
    ///
    /// Returns `None` once cancelled or after the producer has gone away.
    pub async fn recv(&mut self) -> Option<ChunkEvent> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Stop production immediately
    ///
    /// Aborts the reader task and drops every chunk still queued in the
    /// channel; nothing further is observed through [`recv`](Self::recv).
    pub fn cancel(&mut self) {
        self.task.abort();
        if self.rx.take().is_some() {
            tracing::debug!("Chunk producer for {} cancelled", self.path.display());
        }
    }

    /// Returns true once [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.rx.is_none()
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("path", &self.path)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    async fn collect(stream: &mut ChunkStream) -> (Vec<Bytes>, bool) {
        let mut chunks = Vec::new();
        while let Some(event) = stream.recv().await {
            match event {
                ChunkEvent::Chunk(bytes) => chunks.push(bytes),
                ChunkEvent::Done => return (chunks, true),
                ChunkEvent::Failed(e) => panic!("unexpected failure: {e}"),
            }
        }
        (chunks, false)
    }

    #[test]
    fn test_chunk_count() {
        let chunker = FileChunker::with_chunk_size(30);
        assert_eq!(chunker.chunk_count(100), 4);
        assert_eq!(chunker.chunk_count(90), 3);
        assert_eq!(chunker.chunk_count(1), 1);
        assert_eq!(chunker.chunk_count(0), 0);
    }

    #[test]
    fn test_zero_chunk_size_uses_default() {
        let chunker = FileChunker::with_chunk_size(0);
        assert_eq!(chunker.chunk_size(), DEFAULT_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_chunks_in_order_with_short_tail() {
        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let file = temp_file(&data);

        let source = ChunkSource::new(30, 2);
        let mut stream = source.spawn(file.path());
        let (chunks, done) = collect(&mut stream).await;

        assert!(done);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].len(), 10);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_chunk() {
        let file = temp_file(&[7u8; 90]);
        let mut stream = ChunkSource::new(30, 4).spawn(file.path());
        let (chunks, done) = collect(&mut stream).await;

        assert!(done);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 30));
    }

    #[tokio::test]
    async fn test_empty_file_is_done_immediately() {
        let file = temp_file(&[]);
        let mut stream = ChunkSource::new(30, 4).spawn(file.path());
        let (chunks, done) = collect(&mut stream).await;

        assert!(done);
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = ChunkSource::default().spawn(dir.path().join("missing.bin"));

        match stream.recv().await {
            Some(ChunkEvent::Failed(ChunkError::Open { .. })) => {}
            other => panic!("expected open failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let file = temp_file(&vec![1u8; 1000]);
        let mut stream = ChunkSource::new(10, 1).spawn(file.path());

        assert!(matches!(stream.recv().await, Some(ChunkEvent::Chunk(_))));
        stream.cancel();

        assert!(stream.is_cancelled());
        assert!(stream.recv().await.is_none());
    }
}
