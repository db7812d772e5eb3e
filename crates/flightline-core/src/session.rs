//! Session coordinator
//!
//! One task owns the sender, receiver, reconnect engine, buffer tier and the
//! active chunk reader, and serialises every input through a single
//! `tokio::select!` loop:
//!
//! - commands from [`SessionHandle`]s
//! - signaling link events
//! - peer channel events
//! - chunks from the reader, pulled only while the sender wants more
//! - the reconnect retry, peer grace and batch quiet timers
//!
//! Nothing inside the loop is shared, so no state needs locking.

use crate::channel::{ChannelEndpoint, ChannelEvent, PeerChannel};
use crate::config::FlightConfig;
use crate::error::{FlightError, Result};
use crate::event::SessionEvent;
use crate::identity::TransferId;
use crate::queue::OutboundFile;
use crate::receiver::{ReceiveState, Receiver};
use crate::reconnect::{ConnectionState, ReconnectAction, ReconnectEngine};
use crate::sender::{Sender, SenderOutput};
use crate::signaling::{SignalingEvent, SignalingLink};
use crate::wire::ChatMessage;
use flightline_files::chunker::DEFAULT_CHANNEL_CAPACITY;
use flightline_files::{BufferTier, ChunkEvent, ChunkSource, ChunkStream, ReceivedFile};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Commands buffered between handles and the coordinator
const COMMAND_CAPACITY: usize = 64;

/// Request to the coordinator
#[derive(Debug)]
pub enum Command {
    /// Open the signaling link and register
    Connect,
    /// Open a new flight
    CreateFlight(oneshot::Sender<Result<()>>),
    /// Join a flight by code
    JoinFlight(String, oneshot::Sender<Result<()>>),
    /// Use a newly negotiated peer channel
    AttachChannel(ChannelEndpoint),
    /// Drop the current peer channel
    DetachChannel,
    /// Queue files for sending
    Enqueue(Vec<OutboundFile>, oneshot::Sender<Vec<TransferId>>),
    /// Cancel an outbound transfer
    Cancel(TransferId, oneshot::Sender<bool>),
    /// Move a queued transfer
    Reorder(TransferId, usize, oneshot::Sender<Result<()>>),
    /// Send a chat message
    SendChat(String, oneshot::Sender<Result<()>>),
    /// Send a channel setup payload through the relay
    SendSignal(Value, oneshot::Sender<Result<()>>),
    /// Host became visible again
    VisibilityRestored,
    /// Leave the flight
    Leave,
    /// Clear transfer state and any terminal failure
    Reset,
    /// Stop the coordinator
    Shutdown,
    /// Report current state
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Connection state
    pub state: ConnectionState,
    /// Active flight
    pub flight_code: Option<String>,
    /// Outbound queue, active entry first
    pub queue: Vec<TransferId>,
    /// Active outbound transfer
    pub active: Option<TransferId>,
    /// Chunks produced but not yet written
    pub pending_chunks: usize,
    /// Sender stopped at the high-water mark
    pub awaiting_low_water: bool,
    /// Inbound transfer state
    pub receive_state: ReceiveState,
    /// Files received this session
    pub received: Vec<ReceivedFile>,
    /// A peer channel is attached
    pub channel_attached: bool,
}

/// Cloneable handle for talking to a running coordinator
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| FlightError::invalid_state("session coordinator stopped"))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await
            .map_err(|_| FlightError::invalid_state("session coordinator stopped"))
    }

    /// Open the signaling link and register
    pub async fn connect(&self) -> Result<()> {
        self.send(Command::Connect).await
    }

    /// Open a new flight
    pub async fn create_flight(&self) -> Result<()> {
        self.request(Command::CreateFlight).await?
    }

    /// Join a flight by code
    pub async fn join_flight(&self, flight_code: impl Into<String>) -> Result<()> {
        let code = flight_code.into();
        self.request(|tx| Command::JoinFlight(code, tx)).await?
    }

    /// Use a newly negotiated peer channel
    pub async fn attach_channel(&self, endpoint: ChannelEndpoint) -> Result<()> {
        self.send(Command::AttachChannel(endpoint)).await
    }

    /// Drop the current peer channel
    pub async fn detach_channel(&self) -> Result<()> {
        self.send(Command::DetachChannel).await
    }

    /// Queue files; returns their transfer ids
    pub async fn enqueue(&self, files: Vec<OutboundFile>) -> Result<Vec<TransferId>> {
        self.request(|tx| Command::Enqueue(files, tx)).await
    }

    /// Cancel an outbound transfer; returns false if it was unknown
    pub async fn cancel(&self, id: TransferId) -> Result<bool> {
        self.request(|tx| Command::Cancel(id, tx)).await
    }

    /// Move a queued transfer
    pub async fn reorder(&self, id: TransferId, new_index: usize) -> Result<()> {
        self.request(|tx| Command::Reorder(id, new_index, tx)).await?
    }

    /// Send a chat message
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|tx| Command::SendChat(text, tx)).await?
    }

    /// Send a channel setup payload through the relay
    pub async fn send_signal(&self, data: Value) -> Result<()> {
        self.request(|tx| Command::SendSignal(data, tx)).await?
    }

    /// Host became visible again
    pub async fn visibility_restored(&self) -> Result<()> {
        self.send(Command::VisibilityRestored).await
    }

    /// Leave the flight
    pub async fn leave(&self) -> Result<()> {
        self.send(Command::Leave).await
    }

    /// Clear transfer state and any terminal failure
    pub async fn reset(&self) -> Result<()> {
        self.send(Command::Reset).await
    }

    /// Stop the coordinator
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    /// Report current state
    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(Command::Snapshot).await
    }
}

struct Production {
    id: TransferId,
    stream: ChunkStream,
}

/// Single-task owner of all session state
pub struct SessionCoordinator {
    config: FlightConfig,
    link: Box<dyn SignalingLink>,
    link_events: mpsc::UnboundedReceiver<SignalingEvent>,
    channel: Option<ChannelEndpoint>,
    sender: Sender,
    receiver: Receiver,
    engine: ReconnectEngine,
    chunk_source: ChunkSource,
    production: Option<Production>,
    retry_at: Option<Instant>,
    grace_at: Option<Instant>,
    batch_at: Option<Instant>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionCoordinator {
    /// Create a coordinator
    ///
    /// Returns the coordinator (drive it with [`run`](Self::run)), a handle,
    /// and the event stream.
    ///
    /// # Errors
    ///
    /// Returns `FlightError::InvalidConfig` if `config` does not validate.
    pub fn new(
        config: FlightConfig,
        display_name: impl Into<String>,
        link: Box<dyn SignalingLink>,
        link_events: mpsc::UnboundedReceiver<SignalingEvent>,
        buffer: BufferTier,
    ) -> Result<(Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            sender: Sender::new(&config.transfer, &config.speed),
            receiver: Receiver::new(buffer, &config.transfer, &config.speed),
            engine: ReconnectEngine::new(config.reconnect.clone(), display_name),
            chunk_source: ChunkSource::new(config.transfer.chunk_size, DEFAULT_CHANNEL_CAPACITY),
            config,
            link,
            link_events,
            channel: None,
            production: None,
            retry_at: None,
            grace_at: None,
            batch_at: None,
            commands: cmd_rx,
            events: event_tx,
        };

        Ok((coordinator, SessionHandle { tx: cmd_tx }, event_rx))
    }

    /// Run until shut down or every handle is dropped
    pub async fn run(mut self) {
        tracing::debug!("Session coordinator started");

        loop {
            let pull_chunks = self.production.is_some() && self.sender.wants_chunks();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.link_events.recv() => {
                    let actions = self.engine.on_link_event(event);
                    self.apply(actions).await;
                }
                event = next_channel_event(&mut self.channel) => {
                    self.handle_channel_event(event).await;
                }
                (id, event) = next_chunk(&mut self.production), if pull_chunks => {
                    self.handle_chunk_event(id, event);
                }
                () = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    let actions = self.engine.on_retry_timer();
                    self.apply(actions).await;
                }
                () = sleep_until(self.grace_at) => {
                    self.grace_at = None;
                    let actions = self.engine.on_grace_expired();
                    self.apply(actions).await;
                }
                () = sleep_until(self.batch_at) => {
                    self.batch_at = None;
                    let count = self.receiver.take_batch();
                    if count > 0 {
                        tracing::info!("Batch complete: {} files", count);
                        self.emit(SessionEvent::BatchComplete { count });
                    }
                }
            }
        }

        self.shutdown().await;
        tracing::debug!("Session coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        let now = clock();
        match command {
            Command::Connect => {
                let actions = self.engine.connect();
                self.apply(actions).await;
            }
            Command::CreateFlight(reply) => {
                let result = match self.engine.create_flight() {
                    Ok(actions) => {
                        self.apply(actions).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::JoinFlight(code, reply) => {
                let result = match self.engine.join_flight(code) {
                    Ok(actions) => {
                        self.apply(actions).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::AttachChannel(endpoint) => self.attach_channel(endpoint).await,
            Command::DetachChannel => {
                self.on_channel_lost(FlightError::channel("peer channel detached"))
                    .await;
            }
            Command::Enqueue(files, reply) => {
                let ids = self.sender.enqueue(files, peer(&self.channel), now);
                self.flush_sender();
                let _ = reply.send(ids);
            }
            Command::Cancel(id, reply) => {
                let found = self.sender.cancel(id, peer(&self.channel), now);
                self.flush_sender();
                let _ = reply.send(found);
            }
            Command::Reorder(id, index, reply) => {
                let _ = reply.send(self.sender.reorder(id, index));
            }
            Command::SendChat(text, reply) => {
                let result = match peer(&self.channel).filter(|c| c.is_open()) {
                    Some(ch) => ch.send_text(&ChatMessage::now(text).to_text()),
                    None => Err(FlightError::channel("no open peer channel")),
                };
                let _ = reply.send(result);
            }
            Command::SendSignal(data, reply) => {
                let result = match self.engine.send_signal(data) {
                    Ok(actions) => {
                        self.apply(actions).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::VisibilityRestored => {
                let actions = self.engine.on_foreground();
                self.apply(actions).await;
            }
            Command::Leave => {
                let actions = self.engine.leave();
                self.apply(actions).await;
            }
            Command::Reset => {
                self.engine.clear_failure();
                self.reset_session().await;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    async fn attach_channel(&mut self, endpoint: ChannelEndpoint) {
        if self.channel.is_some() {
            self.on_channel_lost(FlightError::channel("peer channel replaced"))
                .await;
        }

        endpoint
            .channel
            .set_buffered_amount_low_threshold(self.config.transfer.low_water_mark());
        tracing::debug!("Peer channel attached (open: {})", endpoint.channel.is_open());
        self.channel = Some(endpoint);

        self.sender.try_activate(peer(&self.channel), clock());
        self.flush_sender();
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        let now = clock();
        match event {
            ChannelEvent::Open => {
                tracing::debug!("Peer channel open");
                self.sender.try_activate(peer(&self.channel), now);
                self.flush_sender();
            }
            ChannelEvent::BufferedAmountLow => {
                self.sender.on_low_water(peer(&self.channel), now);
                self.flush_sender();
            }
            ChannelEvent::Message(message) => {
                let events = self.receiver.on_message(message, now).await;
                if self.receiver.state() == ReceiveState::AwaitingChunks {
                    self.batch_at = None;
                } else if events
                    .iter()
                    .any(|e| matches!(e, SessionEvent::FileReceived { .. }))
                {
                    self.batch_at = Some(Instant::now() + self.config.receive.batch_quiet_period);
                }
                self.emit_all(events);
            }
            ChannelEvent::Closed => {
                self.on_channel_lost(FlightError::channel("peer channel closed"))
                    .await;
            }
        }
    }

    /// Drop the channel. Transfers interrupted by it fail, except while the
    /// peer is in its grace period, where the peer's return decides.
    async fn on_channel_lost(&mut self, reason: FlightError) {
        if let Some(endpoint) = self.channel.take() {
            endpoint.channel.close();
            tracing::debug!("Peer channel dropped: {}", reason);
        }

        if self.engine.state() == ConnectionState::PeerGracePeriod {
            return;
        }

        self.sender.fail_active(reason);
        let events = self.receiver.discard_partial().await;
        self.emit_all(events);
        self.flush_sender();
    }

    fn handle_chunk_event(&mut self, id: TransferId, event: Option<ChunkEvent>) {
        let now = clock();
        match event {
            Some(ChunkEvent::Chunk(bytes)) => {
                self.sender
                    .on_chunk_produced(id, bytes, peer(&self.channel), now);
            }
            Some(ChunkEvent::Done) => {
                self.production = None;
                self.sender.on_production_done(id, peer(&self.channel), now);
            }
            Some(ChunkEvent::Failed(e)) => {
                self.production = None;
                self.sender
                    .on_production_failed(id, e.into(), peer(&self.channel), now);
            }
            None => {
                self.production = None;
                self.sender.on_production_failed(
                    id,
                    FlightError::ChunkSource("reader stopped unexpectedly".into()),
                    peer(&self.channel),
                    now,
                );
            }
        }
        self.flush_sender();
    }

    /// Carry out what the sender asked for
    fn flush_sender(&mut self) {
        for output in self.sender.take_outputs() {
            match output {
                SenderOutput::Event(event) => self.emit(event),
                SenderOutput::StartProduction { id, path } => {
                    if let Some(mut old) = self.production.take() {
                        old.stream.cancel();
                    }
                    let stream = self.chunk_source.spawn(path);
                    self.production = Some(Production { id, stream });
                }
                SenderOutput::StopProduction { id } => {
                    if self.production.as_ref().is_some_and(|p| p.id == id) {
                        if let Some(mut production) = self.production.take() {
                            production.stream.cancel();
                        }
                    }
                }
            }
        }
    }

    async fn apply(&mut self, actions: Vec<ReconnectAction>) {
        for action in actions {
            match action {
                ReconnectAction::OpenLink => self.link.open(),
                ReconnectAction::CloseLink => self.link.close(),
                ReconnectAction::Send(message) => {
                    tracing::debug!("Signaling → {}", message.kind());
                    if let Err(e) = self.link.send(&message) {
                        tracing::warn!("Failed to send {}: {}", message.kind(), e);
                        self.emit(SessionEvent::SignalingError(e.to_string()));
                    }
                }
                ReconnectAction::ScheduleRetry { attempt, delay } => {
                    tracing::debug!("Retry {} armed for {:?}", attempt, delay);
                    self.retry_at = Some(Instant::now() + delay);
                }
                ReconnectAction::CancelRetry => self.retry_at = None,
                ReconnectAction::ArmGrace(grace) => self.grace_at = Some(Instant::now() + grace),
                ReconnectAction::CancelGrace => self.grace_at = None,
                ReconnectAction::PauseTransfers => self.sender.pause(),
                ReconnectAction::ResumeTransfers => {
                    self.sender.resume(peer(&self.channel), clock());
                    self.flush_sender();
                }
                ReconnectAction::PeerReturned => {
                    if let Some(endpoint) = self.channel.take() {
                        endpoint.channel.close();
                    }
                    self.sender.fail_active(FlightError::peer_lost(
                        "transfer interrupted by peer reconnect",
                    ));
                    let events = self.receiver.discard_partial().await;
                    self.emit_all(events);
                    self.flush_sender();
                }
                ReconnectAction::ResetSession => self.reset_session().await,
                ReconnectAction::Emit(event) => self.emit(event),
            }
        }
    }

    /// Clear sender, receiver, buffers and timers tied to transfers
    async fn reset_session(&mut self) {
        self.sender.reset();
        self.flush_sender();
        if let Some(mut production) = self.production.take() {
            production.stream.cancel();
        }
        if let Some(endpoint) = self.channel.take() {
            endpoint.channel.close();
        }
        self.receiver.reset().await;
        self.batch_at = None;
        tracing::debug!("Session state reset");
        self.emit(SessionEvent::SessionReset);
    }

    async fn shutdown(&mut self) {
        if let Some(mut production) = self.production.take() {
            production.stream.cancel();
        }
        if let Some(endpoint) = self.channel.take() {
            endpoint.channel.close();
        }
        if self.link.is_open() {
            self.link.close();
        }
        self.receiver.reset().await;
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.engine.state(),
            flight_code: self.engine.flight_code().map(str::to_string),
            queue: self.sender.queue().ids(),
            active: self.sender.active_id(),
            pending_chunks: self.sender.pending_len(),
            awaiting_low_water: self.sender.is_awaiting_low_water(),
            receive_state: self.receiver.state(),
            received: self.receiver.received_files().to_vec(),
            channel_attached: self.channel.is_some(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        tracing::trace!("Session event: {}", event.kind());
        // No listener is not an error
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: Vec<SessionEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("state", &self.engine.state())
            .field("active", &self.sender.active_id())
            .field("receive_state", &self.receiver.state())
            .field("channel", &self.channel.is_some())
            .finish()
    }
}

/// Current time on the tokio clock, so paused-clock tests stay deterministic
fn clock() -> std::time::Instant {
    Instant::now().into_std()
}

fn peer(channel: &Option<ChannelEndpoint>) -> Option<&dyn PeerChannel> {
    channel.as_ref().map(|c| c.channel.as_ref())
}

async fn next_channel_event(channel: &mut Option<ChannelEndpoint>) -> ChannelEvent {
    match channel {
        Some(endpoint) => endpoint.events.recv().await.unwrap_or(ChannelEvent::Closed),
        None => std::future::pending().await,
    }
}

async fn next_chunk(production: &mut Option<Production>) -> (TransferId, Option<ChunkEvent>) {
    match production {
        Some(p) => (p.id, p.stream.recv().await),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
