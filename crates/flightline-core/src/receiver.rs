//! Inbound transfers
//!
//! One inbound file at a time: `Idle → AwaitingChunks → Complete`. A new
//! metadata message always starts over, discarding whatever partial file was
//! in flight.

use crate::channel::ChannelMessage;
use crate::config::{SpeedConfig, TransferConfig};
use crate::error::FlightError;
use crate::event::SessionEvent;
use crate::identity::TransferId;
use crate::progress::{Direction, ProgressThrottle, TransferProgress};
use crate::speed::SpeedEstimator;
use crate::wire::{FileMetadata, PeerMessage};
use bytes::Bytes;
use flightline_files::{BufferTier, ReceivedFile};
use std::time::Instant;

/// Receiver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// No inbound file
    Idle,
    /// Metadata seen, collecting chunks
    AwaitingChunks,
    /// Last inbound file finished
    Complete,
}

#[derive(Debug)]
struct Inbound {
    id: TransferId,
    meta: FileMetadata,
    received: u64,
}

/// Inbound half of the transfer protocol
#[derive(Debug)]
pub struct Receiver {
    state: ReceiveState,
    current: Option<Inbound>,
    buffer: BufferTier,
    speed: SpeedEstimator,
    throttle: ProgressThrottle,
    files: Vec<ReceivedFile>,
    batch_count: usize,
}

impl Receiver {
    /// Create an idle receiver writing into `buffer`
    pub fn new(buffer: BufferTier, transfer: &TransferConfig, speed: &SpeedConfig) -> Self {
        Self {
            state: ReceiveState::Idle,
            current: None,
            buffer,
            speed: SpeedEstimator::new(speed.sample_interval, speed.window),
            throttle: ProgressThrottle::new(transfer.progress_interval),
            files: Vec::new(),
            batch_count: 0,
        }
    }

    /// Handle one channel message
    pub async fn on_message(&mut self, message: ChannelMessage, now: Instant) -> Vec<SessionEvent> {
        match PeerMessage::decode(message) {
            PeerMessage::Metadata(meta) => self.on_metadata(meta, now).await,
            PeerMessage::Chunk(bytes) => self.on_chunk(bytes, now).await,
            PeerMessage::Eof => self.on_eof(now).await,
            PeerMessage::Chat(chat) => vec![SessionEvent::ChatReceived(chat)],
            PeerMessage::StreamEnded => vec![SessionEvent::StreamEnded],
            PeerMessage::Malformed(reason) => {
                tracing::warn!("Protocol violation from peer: {}", reason);
                vec![SessionEvent::ProtocolViolation(FlightError::Protocol(reason.into()))]
            }
        }
    }

    async fn on_metadata(&mut self, meta: FileMetadata, now: Instant) -> Vec<SessionEvent> {
        let mut events = self.discard_partial().await;

        let id = TransferId::generate();
        match self.buffer.begin_buffer(&meta.name, meta.size).await {
            Ok(tier) => {
                tracing::info!(
                    "Receiving {} ({} bytes, {:?} tier)",
                    meta.name,
                    meta.size,
                    tier
                );
                self.speed.reset();
                self.speed.update_at(0, now);
                self.throttle.reset();
                self.state = ReceiveState::AwaitingChunks;
                events.push(SessionEvent::TransferStarted {
                    id,
                    name: meta.name.clone(),
                    size: meta.size,
                    direction: Direction::Receive,
                });
                self.current = Some(Inbound {
                    id,
                    meta,
                    received: 0,
                });
            }
            Err(e) => {
                tracing::warn!("Cannot buffer {}: {}", meta.name, e);
                self.state = ReceiveState::Idle;
                events.push(SessionEvent::TransferFailed {
                    id,
                    name: meta.name,
                    direction: Direction::Receive,
                    error: e.into(),
                });
            }
        }
        events
    }

    async fn on_chunk(&mut self, bytes: Bytes, now: Instant) -> Vec<SessionEvent> {
        let Some(current) = self.current.as_mut().filter(|_| self.state == ReceiveState::AwaitingChunks) else {
            tracing::warn!("Dropping {} byte chunk with no inbound transfer", bytes.len());
            return Vec::new();
        };

        match self.buffer.write_chunk(&current.meta.name, &bytes).await {
            Ok(total) => {
                current.received = total;
                self.speed.update_at(total, now);
                if self.throttle.ready_at(now) {
                    vec![SessionEvent::TransferProgress(TransferProgress::snapshot(
                        current.id,
                        &current.meta.name,
                        Direction::Receive,
                        total,
                        current.meta.size,
                        &self.speed,
                    ))]
                } else {
                    Vec::new()
                }
            }
            Err(e) => self.abandon(e.into()).await,
        }
    }

    async fn on_eof(&mut self, now: Instant) -> Vec<SessionEvent> {
        if self.state != ReceiveState::AwaitingChunks {
            tracing::debug!("Ignoring EOF with no inbound transfer");
            return Vec::new();
        }
        let Some(current) = self.current.take() else {
            self.state = ReceiveState::Idle;
            return Vec::new();
        };

        let buffered = match self.buffer.finalize(&current.meta.name).await {
            Ok(buffered) => buffered,
            Err(e) => {
                self.current = Some(current);
                return self.abandon(e.into()).await;
            }
        };

        if buffered.size != current.meta.size {
            tracing::warn!(
                "{} announced {} bytes but {} arrived",
                current.meta.name,
                current.meta.size,
                buffered.size
            );
        }

        self.speed.update_at(buffered.size, now);
        let progress = TransferProgress::snapshot(
            current.id,
            &current.meta.name,
            Direction::Receive,
            buffered.size,
            current.meta.size,
            &self.speed,
        );

        let file = ReceivedFile::from_buffer(current.meta.name.clone(), current.meta.mime_type, buffered);
        let hazardous = file.hazardous;
        if hazardous {
            tracing::warn!("Received executable-like file {}", file.name);
        }
        tracing::info!("Received {} ({} bytes)", file.name, file.size);

        self.files.push(file.clone());
        self.batch_count += 1;
        self.state = ReceiveState::Complete;

        vec![
            SessionEvent::TransferProgress(progress),
            SessionEvent::TransferCompleted {
                id: current.id,
                name: current.meta.name,
                direction: Direction::Receive,
            },
            SessionEvent::FileReceived { file, hazardous },
        ]
    }

    /// Drop the current transfer after a storage failure; the session goes on
    async fn abandon(&mut self, error: FlightError) -> Vec<SessionEvent> {
        self.state = ReceiveState::Idle;
        let Some(current) = self.current.take() else {
            return Vec::new();
        };
        self.buffer.discard(&current.meta.name).await;
        tracing::warn!("Receive of {} failed: {}", current.meta.name, error);
        vec![SessionEvent::TransferFailed {
            id: current.id,
            name: current.meta.name,
            direction: Direction::Receive,
            error,
        }]
    }

    /// Discard an unterminated inbound transfer, if any
    pub async fn discard_partial(&mut self) -> Vec<SessionEvent> {
        if self.state != ReceiveState::AwaitingChunks {
            return Vec::new();
        }
        self.state = ReceiveState::Idle;
        let Some(previous) = self.current.take() else {
            return Vec::new();
        };

        self.buffer.discard(&previous.meta.name).await;
        tracing::warn!(
            "Discarding unterminated transfer {} after {} of {} bytes",
            previous.meta.name,
            previous.received,
            previous.meta.size
        );
        vec![SessionEvent::TransferDiscarded {
            id: previous.id,
            name: previous.meta.name,
            bytes_received: previous.received,
        }]
    }

    /// Number of files completed since the last call, resetting the count
    pub fn take_batch(&mut self) -> usize {
        std::mem::take(&mut self.batch_count)
    }

    /// Return to the initial state, deleting buffered data and received files
    pub async fn reset(&mut self) {
        self.state = ReceiveState::Idle;
        self.current = None;
        self.speed.reset();
        self.throttle.reset();
        self.buffer.reset().await;
        self.files.clear();
        self.batch_count = 0;
    }

    /// Current state
    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Bytes received for the in-flight transfer
    pub fn bytes_received(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.received)
    }

    /// Files received this session
    pub fn received_files(&self) -> &[ReceivedFile] {
        &self.files
    }

    /// Files completed in the current batch
    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// Buffer tier in use
    pub fn buffer(&self) -> &BufferTier {
        &self.buffer
    }
}
