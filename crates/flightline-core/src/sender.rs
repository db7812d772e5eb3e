//! Flow-controlled outbound transfers
//!
//! The sender owns the [`SendQueue`] and the chunks produced for the active
//! entry but not yet written. It never touches the file system or timers:
//! the coordinator feeds it produced chunks and channel events and carries
//! out the [`SenderOutput`]s it queues.
//!
//! # Flow control
//!
//! Chunks are written only while the channel's buffered amount is below the
//! high-water mark. Once the mark is reached the sender stops and waits for
//! [`on_low_water`](Sender::on_low_water), which the coordinator calls when
//! the channel reports its buffered amount fell to half the mark. Pending
//! chunks are bounded by `max_pending_chunks` through
//! [`wants_chunks`](Sender::wants_chunks), which gates how fast the
//! coordinator pulls from the chunk reader.

use crate::channel::PeerChannel;
use crate::config::{SpeedConfig, TransferConfig};
use crate::error::{FlightError, Result};
use crate::event::SessionEvent;
use crate::identity::TransferId;
use crate::progress::{Direction, ProgressThrottle, TransferProgress};
use crate::queue::{OutboundFile, SendQueue, SendQueueEntry};
use crate::speed::SpeedEstimator;
use crate::wire::EOF_MARKER;
use bytes::Bytes;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

/// Work the coordinator carries out on behalf of the sender
#[derive(Debug, Clone)]
pub enum SenderOutput {
    /// Forward to the presentation layer
    Event(SessionEvent),
    /// Start reading `path` for transfer `id`
    StartProduction {
        /// Transfer the chunks belong to
        id: TransferId,
        /// File to read
        path: PathBuf,
    },
    /// Stop the reader for transfer `id` and drop anything it queued
    StopProduction {
        /// Transfer whose reader to stop
        id: TransferId,
    },
}

#[derive(Debug)]
struct ActiveSend {
    id: TransferId,
    name: String,
    size: u64,
    bytes_sent: u64,
    production_done: bool,
}

/// Outbound half of the transfer protocol
#[derive(Debug)]
pub struct Sender {
    queue: SendQueue,
    active: Option<ActiveSend>,
    pending: VecDeque<Bytes>,
    paused: bool,
    awaiting_low_water: bool,
    high_water: usize,
    max_pending: usize,
    speed: SpeedEstimator,
    throttle: ProgressThrottle,
    outbox: Vec<SenderOutput>,
}

impl Sender {
    /// Create an idle sender
    pub fn new(transfer: &TransferConfig, speed: &SpeedConfig) -> Self {
        Self {
            queue: SendQueue::new(),
            active: None,
            pending: VecDeque::new(),
            paused: false,
            awaiting_low_water: false,
            high_water: transfer.high_water_mark,
            max_pending: transfer.max_pending_chunks.max(1),
            speed: SpeedEstimator::new(speed.sample_interval, speed.window),
            throttle: ProgressThrottle::new(transfer.progress_interval),
            outbox: Vec::new(),
        }
    }

    /// Queue files and start the head if idle
    ///
    /// Returns the identifiers assigned, in queue order.
    pub fn enqueue(
        &mut self,
        files: Vec<OutboundFile>,
        channel: Option<&dyn PeerChannel>,
        now: Instant,
    ) -> Vec<TransferId> {
        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let entry = SendQueueEntry::new(file);
            tracing::debug!(
                "Queued {} ({} bytes) as {}",
                entry.file.name,
                entry.file.size,
                entry.id.short()
            );
            ids.push(entry.id);
            self.queue.push(entry);
        }
        self.try_activate(channel, now);
        ids
    }

    /// Activate the head entry if idle, unpaused and the channel is open
    pub fn try_activate(&mut self, channel: Option<&dyn PeerChannel>, now: Instant) {
        loop {
            if self.active.is_some() || self.paused {
                return;
            }
            let Some(ch) = channel.filter(|c| c.is_open()) else {
                return;
            };
            let Some(entry) = self.queue.activate_head().cloned() else {
                return;
            };
            self.activate(entry, ch, now);
            if self.active.is_some() {
                return;
            }
        }
    }

    /// Announce `entry` and request its chunks
    fn activate(&mut self, entry: SendQueueEntry, channel: &dyn PeerChannel, now: Instant) {
        if let Err(e) = channel.send_text(&entry.file.metadata().to_text()) {
            tracing::warn!("Failed to announce {}: {}", entry.file.name, e);
            self.queue.complete_active();
            self.outbox.push(SenderOutput::Event(SessionEvent::TransferFailed {
                id: entry.id,
                name: entry.file.name,
                direction: Direction::Send,
                error: e,
            }));
            return;
        }

        tracing::info!(
            "Sending {} ({} bytes, transfer {})",
            entry.file.name,
            entry.file.size,
            entry.id.short()
        );

        self.speed.reset();
        self.speed.update_at(0, now);
        self.throttle.reset();
        self.pending.clear();
        self.awaiting_low_water = false;
        self.active = Some(ActiveSend {
            id: entry.id,
            name: entry.file.name.clone(),
            size: entry.file.size,
            bytes_sent: 0,
            production_done: false,
        });

        self.outbox.push(SenderOutput::Event(SessionEvent::TransferStarted {
            id: entry.id,
            name: entry.file.name,
            size: entry.file.size,
            direction: Direction::Send,
        }));
        self.outbox.push(SenderOutput::StartProduction {
            id: entry.id,
            path: entry.file.path,
        });
    }

    /// Accept a chunk from the reader and write what flow control allows
    pub fn on_chunk_produced(
        &mut self,
        id: TransferId,
        chunk: Bytes,
        channel: Option<&dyn PeerChannel>,
        now: Instant,
    ) {
        if self.active_id() != Some(id) {
            tracing::debug!("Dropping stale chunk for {}", id.short());
            return;
        }
        self.pending.push_back(chunk);
        self.drain(channel, now);
    }

    /// Write pending chunks while the channel is below the high-water mark
    pub fn drain(&mut self, channel: Option<&dyn PeerChannel>, now: Instant) {
        if self.paused || self.active.is_none() {
            return;
        }
        let Some(ch) = channel else {
            return;
        };

        while !self.pending.is_empty() {
            let buffered = ch.buffered_amount();
            if buffered >= self.high_water {
                if !self.awaiting_low_water {
                    tracing::debug!(
                        "Channel at high-water mark ({} >= {} bytes), {} chunks pending",
                        buffered,
                        self.high_water,
                        self.pending.len()
                    );
                }
                self.awaiting_low_water = true;
                return;
            }

            let Some(chunk) = self.pending.pop_front() else {
                break;
            };
            let len = chunk.len() as u64;
            if let Err(e) = ch.send_binary(chunk) {
                self.fail_active(e);
                return;
            }
            if let Some(active) = self.active.as_mut() {
                active.bytes_sent += len;
            }
            self.report_progress(now, false);
        }

        self.awaiting_low_water = false;
        if self.active.as_ref().is_some_and(|a| a.production_done) {
            self.finish(ch, now);
        }
    }

    /// The channel drained to the low-water threshold
    pub fn on_low_water(&mut self, channel: Option<&dyn PeerChannel>, now: Instant) {
        if self.awaiting_low_water {
            tracing::debug!("Low-water signal, resuming with {} chunks pending", self.pending.len());
        }
        self.awaiting_low_water = false;
        self.drain(channel, now);
    }

    /// The reader finished the file
    pub fn on_production_done(&mut self, id: TransferId, channel: Option<&dyn PeerChannel>, now: Instant) {
        let Some(active) = self.active.as_mut().filter(|a| a.id == id) else {
            return;
        };
        active.production_done = true;
        self.drain(channel, now);
    }

    /// The reader failed; abandon the transfer and move on
    pub fn on_production_failed(
        &mut self,
        id: TransferId,
        error: FlightError,
        channel: Option<&dyn PeerChannel>,
        now: Instant,
    ) {
        if self.active_id() != Some(id) {
            return;
        }
        self.fail_active(error);
        self.try_activate(channel, now);
    }

    fn finish(&mut self, channel: &dyn PeerChannel, now: Instant) {
        if let Err(e) = channel.send_text(EOF_MARKER) {
            self.fail_active(e);
            return;
        }

        self.report_progress(now, true);
        let Some(active) = self.active.take() else {
            return;
        };
        self.queue.complete_active();

        if active.bytes_sent != active.size {
            tracing::warn!(
                "{} changed size while sending ({} announced, {} sent)",
                active.name,
                active.size,
                active.bytes_sent
            );
        }
        tracing::info!("Sent {} ({} bytes)", active.name, active.bytes_sent);

        self.outbox.push(SenderOutput::Event(SessionEvent::TransferCompleted {
            id: active.id,
            name: active.name,
            direction: Direction::Send,
        }));

        self.try_activate(Some(channel), now);
    }

    /// Abandon the active transfer, keeping queued entries
    pub fn fail_active(&mut self, error: FlightError) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.pending.clear();
        self.awaiting_low_water = false;
        self.queue.complete_active();

        tracing::warn!("Send of {} failed: {}", active.name, error);
        self.outbox.push(SenderOutput::StopProduction { id: active.id });
        self.outbox.push(SenderOutput::Event(SessionEvent::TransferFailed {
            id: active.id,
            name: active.name,
            direction: Direction::Send,
            error,
        }));
    }

    /// Cancel a transfer, active or queued
    ///
    /// Cancelling the active transfer stops its reader and drops its pending
    /// chunks without writing `EOF`. Returns false if `id` is unknown.
    pub fn cancel(&mut self, id: TransferId, channel: Option<&dyn PeerChannel>, now: Instant) -> bool {
        if self.active_id() == Some(id) {
            let Some(active) = self.active.take() else {
                return false;
            };
            self.pending.clear();
            self.awaiting_low_water = false;
            self.queue.complete_active();

            tracing::info!("Cancelled active send of {}", active.name);
            self.outbox.push(SenderOutput::StopProduction { id });
            self.outbox.push(SenderOutput::Event(SessionEvent::TransferCancelled {
                id,
                name: active.name,
            }));
            self.try_activate(channel, now);
            return true;
        }

        match self.queue.remove(id) {
            Some(entry) => {
                tracing::debug!("Removed {} from send queue", entry.file.name);
                self.outbox.push(SenderOutput::Event(SessionEvent::TransferCancelled {
                    id,
                    name: entry.file.name,
                }));
                true
            }
            None => false,
        }
    }

    /// Move a queued entry
    ///
    /// # Errors
    ///
    /// Returns `FlightError::InvalidState` if the entry is unknown or active.
    pub fn reorder(&mut self, id: TransferId, new_index: usize) -> Result<()> {
        self.queue.reorder(id, new_index)
    }

    /// Hold all writes and activations
    pub fn pause(&mut self) {
        if !self.paused {
            tracing::debug!("Sender paused with {} chunks pending", self.pending.len());
        }
        self.paused = true;
    }

    /// Lift a pause and continue where the transfer stopped
    pub fn resume(&mut self, channel: Option<&dyn PeerChannel>, now: Instant) {
        if self.paused {
            tracing::debug!("Sender resumed");
        }
        self.paused = false;
        self.drain(channel, now);
        self.try_activate(channel, now);
    }

    /// Drop every queued and active transfer
    pub fn reset(&mut self) {
        if let Some(active) = self.active.take() {
            self.outbox.push(SenderOutput::StopProduction { id: active.id });
        }
        self.queue.clear();
        self.pending.clear();
        self.paused = false;
        self.awaiting_low_water = false;
        self.speed.reset();
        self.throttle.reset();
    }

    fn report_progress(&mut self, now: Instant, force: bool) {
        let Some(active) = &self.active else {
            return;
        };
        self.speed.update_at(active.bytes_sent, now);
        if self.throttle.ready_at(now) || force {
            self.outbox.push(SenderOutput::Event(SessionEvent::TransferProgress(
                TransferProgress::snapshot(
                    active.id,
                    &active.name,
                    Direction::Send,
                    active.bytes_sent,
                    active.size,
                    &self.speed,
                ),
            )));
        }
    }

    /// Take the outputs queued since the last call
    pub fn take_outputs(&mut self) -> Vec<SenderOutput> {
        std::mem::take(&mut self.outbox)
    }

    /// Returns true while the reader may hand over another chunk
    pub fn wants_chunks(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.production_done) && self.pending.len() < self.max_pending
    }

    /// Active transfer
    pub fn active_id(&self) -> Option<TransferId> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Queue, including the active entry
    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    /// Chunks produced but not yet written
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Bytes written for the active transfer
    pub fn bytes_sent(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.bytes_sent)
    }

    /// Returns true while paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Returns true while stopped at the high-water mark
    pub fn is_awaiting_low_water(&self) -> bool {
        self.awaiting_low_water
    }
}
