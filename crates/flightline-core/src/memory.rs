//! In-process loopback transports
//!
//! [`MemoryChannel`] connects two coordinators inside one process and models
//! a data channel's buffered amount. [`MemoryRelay`] is a small pairing hub
//! that speaks the signaling envelopes. Both back the CLI loopback command and
//! the end-to-end tests; neither is meant for production use.

use crate::channel::{ChannelEndpoint, ChannelEvent, ChannelMessage, PeerChannel};
use crate::error::{FlightError, Result};
use crate::signaling::{ClientMessage, PeerInfo, ServerMessage, SignalingEvent, SignalingLink};
use bytes::Bytes;
use rand::Rng;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Connection type the relay reports for loopback peers
pub const LOOPBACK_CONNECTION_TYPE: &str = "loopback";

/// Grace period the relay announces when a participant drops
pub const DEFAULT_RELAY_GRACE: Duration = Duration::from_secs(10);

const FLIGHT_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const FLIGHT_CODE_LEN: usize = 6;

#[derive(Debug, Default)]
struct Buffered {
    amount: AtomicUsize,
    threshold: AtomicUsize,
}

/// One end of an in-memory peer channel
///
/// Writes are counted into the buffered amount until the delivery task hands
/// them to the other end.
#[derive(Debug)]
pub struct MemoryChannel {
    outgoing: mpsc::UnboundedSender<ChannelMessage>,
    buffered: Arc<Buffered>,
    open: Arc<AtomicBool>,
    local: mpsc::UnboundedSender<ChannelEvent>,
    remote: mpsc::UnboundedSender<ChannelEvent>,
}

impl MemoryChannel {
    /// Two connected endpoints that deliver as soon as the runtime schedules
    /// them
    ///
    /// Must be called inside a tokio runtime.
    pub fn pair() -> (ChannelEndpoint, ChannelEndpoint) {
        Self::pair_with_latency(Duration::ZERO)
    }

    /// Two connected endpoints that hold each message for `latency` before
    /// delivering it
    ///
    /// Must be called inside a tokio runtime.
    pub fn pair_with_latency(latency: Duration) -> (ChannelEndpoint, ChannelEndpoint) {
        let open = Arc::new(AtomicBool::new(true));
        let (a_events_tx, a_events_rx) = mpsc::unbounded_channel();
        let (b_events_tx, b_events_rx) = mpsc::unbounded_channel();

        let a = Self::spawn_end(&open, &a_events_tx, &b_events_tx, latency);
        let b = Self::spawn_end(&open, &b_events_tx, &a_events_tx, latency);

        let _ = a_events_tx.send(ChannelEvent::Open);
        let _ = b_events_tx.send(ChannelEvent::Open);

        (
            ChannelEndpoint::new(Box::new(a), a_events_rx),
            ChannelEndpoint::new(Box::new(b), b_events_rx),
        )
    }

    fn spawn_end(
        open: &Arc<AtomicBool>,
        local: &mpsc::UnboundedSender<ChannelEvent>,
        remote: &mpsc::UnboundedSender<ChannelEvent>,
        latency: Duration,
    ) -> Self {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(Buffered::default());

        tokio::spawn(deliver(
            rx,
            Arc::clone(&buffered),
            Arc::clone(open),
            local.clone(),
            remote.clone(),
            latency,
        ));

        Self {
            outgoing,
            buffered,
            open: Arc::clone(open),
            local: local.clone(),
            remote: remote.clone(),
        }
    }

    fn queue(&self, message: ChannelMessage) -> Result<()> {
        if !self.is_open() {
            return Err(FlightError::channel("memory channel closed"));
        }
        let len = message.len();
        self.buffered.amount.fetch_add(len, Ordering::SeqCst);
        if self.outgoing.send(message).is_err() {
            self.buffered.amount.fetch_sub(len, Ordering::SeqCst);
            return Err(FlightError::channel("memory channel delivery stopped"));
        }
        Ok(())
    }
}

impl PeerChannel for MemoryChannel {
    fn send_text(&self, text: &str) -> Result<()> {
        self.queue(ChannelMessage::Text(text.to_string()))
    }

    fn send_binary(&self, data: Bytes) -> Result<()> {
        self.queue(ChannelMessage::Binary(data))
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.amount.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.buffered.threshold.store(threshold, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::debug!("Memory channel closed");
            let _ = self.local.send(ChannelEvent::Closed);
            let _ = self.remote.send(ChannelEvent::Closed);
        }
    }
}

async fn deliver(
    mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
    buffered: Arc<Buffered>,
    open: Arc<AtomicBool>,
    local: mpsc::UnboundedSender<ChannelEvent>,
    remote: mpsc::UnboundedSender<ChannelEvent>,
    latency: Duration,
) {
    while let Some(message) = rx.recv().await {
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }

        let len = message.len();
        if open.load(Ordering::SeqCst) {
            let _ = remote.send(ChannelEvent::Message(message));
        }

        let before = buffered.amount.fetch_sub(len, Ordering::SeqCst);
        let after = before.saturating_sub(len);
        let threshold = buffered.threshold.load(Ordering::SeqCst);
        if before > threshold && after <= threshold {
            let _ = local.send(ChannelEvent::BufferedAmountLow);
        }
    }
}

#[derive(Debug)]
struct LinkSlot {
    events: mpsc::UnboundedSender<SignalingEvent>,
    open: bool,
    participant: Option<String>,
}

#[derive(Debug)]
struct Participant {
    name: String,
    token: String,
    flight: Option<String>,
    link: Option<u64>,
}

#[derive(Debug)]
struct RelayState {
    links: HashMap<u64, LinkSlot>,
    participants: HashMap<String, Participant>,
    flights: HashMap<String, Vec<String>>,
    next_link: u64,
    available: bool,
    grace_period: Duration,
}

impl RelayState {
    fn new() -> Self {
        Self {
            links: HashMap::new(),
            participants: HashMap::new(),
            flights: HashMap::new(),
            next_link: 0,
            available: true,
            grace_period: DEFAULT_RELAY_GRACE,
        }
    }

    fn push(&self, link: u64, message: ServerMessage) {
        let Some(slot) = self.links.get(&link) else {
            return;
        };
        if !slot.open {
            return;
        }
        // Round-trip through JSON so loopback exercises the envelope codec
        let event = match message.to_json() {
            Ok(frame) => SignalingEvent::from_frame(&frame),
            Err(e) => SignalingEvent::Malformed(e.to_string()),
        };
        let _ = slot.events.send(event);
    }

    fn push_to(&self, participant: &str, message: ServerMessage) {
        if let Some(link) = self.participants.get(participant).and_then(|p| p.link) {
            self.push(link, message);
        }
    }

    fn info(&self, participant: &str) -> PeerInfo {
        PeerInfo {
            id: participant.to_string(),
            name: self
                .participants
                .get(participant)
                .map(|p| p.name.clone())
                .unwrap_or_default(),
        }
    }

    fn other_member(&self, flight: &str, participant: &str) -> Option<String> {
        self.flights
            .get(flight)?
            .iter()
            .find(|id| id.as_str() != participant)
            .cloned()
    }

    fn flight_of(&self, participant: &str) -> Option<String> {
        self.participants.get(participant)?.flight.clone()
    }

    fn handle(&mut self, link: u64, message: ClientMessage) {
        let bound = self.links.get(&link).and_then(|s| s.participant.clone());

        match (message, bound) {
            (ClientMessage::RegisterDetails { name }, _) => {
                let id = random_hex(4);
                let token = random_hex(16);
                self.participants.insert(
                    id.clone(),
                    Participant {
                        name,
                        token: token.clone(),
                        flight: None,
                        link: Some(link),
                    },
                );
                if let Some(slot) = self.links.get_mut(&link) {
                    slot.participant = Some(id.clone());
                }
                tracing::debug!("Relay registered participant {}", id);
                self.push(
                    link,
                    ServerMessage::Registered {
                        id,
                        session_token: token,
                    },
                );
            }
            (ClientMessage::RejoinFlight { session_token, flight_code }, _) => {
                self.rejoin(link, &session_token, &flight_code);
            }
            (_, None) => self.push(
                link,
                ServerMessage::Error {
                    message: "not registered".to_string(),
                },
            ),
            (ClientMessage::CreateFlight, Some(id)) => {
                if self.flight_of(&id).is_some() {
                    self.push(
                        link,
                        ServerMessage::Error {
                            message: "already in a flight".to_string(),
                        },
                    );
                    return;
                }
                let code = self.unused_flight_code();
                self.flights.insert(code.clone(), vec![id.clone()]);
                if let Some(p) = self.participants.get_mut(&id) {
                    p.flight = Some(code.clone());
                }
                tracing::debug!("Relay opened flight {} for {}", code, id);
                self.push(link, ServerMessage::FlightCreated { flight_code: code });
            }
            (ClientMessage::JoinFlight { flight_code }, Some(id)) => {
                self.join(link, &id, &flight_code);
            }
            (ClientMessage::LeaveFlight, Some(id)) => self.leave_flight(&id),
            (ClientMessage::Signal { data }, Some(id)) => {
                let other = self
                    .flight_of(&id)
                    .and_then(|flight| self.other_member(&flight, &id));
                match other {
                    Some(other) => self.push_to(&other, ServerMessage::Signal { data }),
                    None => self.push(
                        link,
                        ServerMessage::Error {
                            message: "no peer to signal".to_string(),
                        },
                    ),
                }
            }
        }
    }

    fn join(&mut self, link: u64, id: &str, flight_code: &str) {
        let error = match self.flights.get(flight_code) {
            None => Some("flight not found"),
            Some(members) if members.len() >= 2 => Some("flight is full"),
            Some(_) if self.flight_of(id).is_some() => Some("already in a flight"),
            Some(_) => None,
        };
        if let Some(message) = error {
            self.push(
                link,
                ServerMessage::Error {
                    message: message.to_string(),
                },
            );
            return;
        }

        let Some(host) = self.other_member(flight_code, id) else {
            return;
        };
        if let Some(members) = self.flights.get_mut(flight_code) {
            members.push(id.to_string());
        }
        if let Some(p) = self.participants.get_mut(id) {
            p.flight = Some(flight_code.to_string());
        }
        tracing::debug!("Relay paired {} with {} in {}", id, host, flight_code);

        self.push(
            link,
            ServerMessage::PeerJoined {
                peer: self.info(&host),
                connection_type: LOOPBACK_CONNECTION_TYPE.to_string(),
            },
        );
        self.push_to(
            &host,
            ServerMessage::PeerJoined {
                peer: self.info(id),
                connection_type: LOOPBACK_CONNECTION_TYPE.to_string(),
            },
        );
    }

    fn rejoin(&mut self, link: u64, session_token: &str, flight_code: &str) {
        let id = self
            .participants
            .iter()
            .find(|(_, p)| p.token == session_token)
            .map(|(id, _)| id.clone());

        let Some(id) = id else {
            self.push(
                link,
                ServerMessage::RejoinFailed {
                    reason: "unknown session".to_string(),
                },
            );
            return;
        };
        if self.flight_of(&id).as_deref() != Some(flight_code)
            || !self.flights.contains_key(flight_code)
        {
            self.push(
                link,
                ServerMessage::RejoinFailed {
                    reason: "flight no longer exists".to_string(),
                },
            );
            return;
        }

        let token = random_hex(16);
        if let Some(p) = self.participants.get_mut(&id) {
            p.token = token.clone();
            p.link = Some(link);
        }
        if let Some(slot) = self.links.get_mut(&link) {
            slot.participant = Some(id.clone());
        }

        let other = self.other_member(flight_code, &id);
        tracing::debug!("Relay rejoined {} to {}", id, flight_code);
        self.push(
            link,
            ServerMessage::RejoinSuccess {
                flight_code: flight_code.to_string(),
                session_token: Some(token),
                peer: other.as_deref().map(|o| self.info(o)),
            },
        );
        if let Some(other) = other {
            self.push_to(
                &other,
                ServerMessage::PeerReconnected {
                    peer: self.info(&id),
                    connection_type: LOOPBACK_CONNECTION_TYPE.to_string(),
                },
            );
        }
    }

    fn leave_flight(&mut self, id: &str) {
        let Some(flight) = self.flight_of(id) else {
            return;
        };
        let other = self.other_member(&flight, id);
        if let Some(members) = self.flights.get_mut(&flight) {
            members.retain(|m| m != id);
            if members.is_empty() {
                self.flights.remove(&flight);
            }
        }
        if let Some(p) = self.participants.get_mut(id) {
            p.flight = None;
        }
        tracing::debug!("Relay: {} left {}", id, flight);
        if let Some(other) = other {
            self.push_to(&other, ServerMessage::PeerLeft);
        }
    }

    /// Link went down; the participant keeps its place until it rejoins
    fn disconnect(&mut self, link: u64) {
        let Some(slot) = self.links.get_mut(&link) else {
            return;
        };
        slot.open = false;
        let Some(id) = slot.participant.take() else {
            return;
        };

        if let Some(p) = self.participants.get_mut(&id) {
            if p.link == Some(link) {
                p.link = None;
            }
        }
        if let Some(flight) = self.flight_of(&id) {
            if let Some(other) = self.other_member(&flight, &id) {
                let grace_period_ms = u64::try_from(self.grace_period.as_millis()).unwrap_or(u64::MAX);
                self.push_to(
                    &other,
                    ServerMessage::PeerTemporarilyDisconnected { grace_period_ms },
                );
            }
        }
    }

    fn unused_flight_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code: String = (0..FLIGHT_CODE_LEN)
                .map(|_| {
                    let idx = rng.gen_range(0..FLIGHT_CODE_ALPHABET.len());
                    char::from(FLIGHT_CODE_ALPHABET[idx])
                })
                .collect();
            if !self.flights.contains_key(&code) {
                return code;
            }
        }
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(bytes.as_mut_slice());
    hex::encode(bytes)
}

/// In-process signaling relay
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    /// Empty relay, accepting connections
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Relay lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// A new client link and its event stream
    pub fn link(&self) -> (MemoryLink, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_link;
        state.next_link += 1;
        state.links.insert(
            id,
            LinkSlot {
                events: tx,
                open: false,
                participant: None,
            },
        );
        (
            MemoryLink {
                relay: self.clone(),
                id,
            },
            rx,
        )
    }

    /// While unavailable, every `open` fails with a close event
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Grace period announced to the remaining peer
    pub fn set_grace_period(&self, grace: Duration) {
        self.lock().grace_period = grace;
    }

    /// Drop a link from the relay side, as a network failure would
    pub fn sever(&self, link_id: u64) {
        let mut state = self.lock();
        let was_open = state.links.get(&link_id).is_some_and(|s| s.open);
        if !was_open {
            return;
        }
        state.disconnect(link_id);
        if let Some(slot) = state.links.get(&link_id) {
            let _ = slot.events.send(SignalingEvent::Closed);
        }
    }

    /// Forget a flight, so later rejoins are rejected
    pub fn expire_flight(&self, flight_code: &str) {
        let mut state = self.lock();
        if let Some(members) = state.flights.remove(flight_code) {
            for id in members {
                if let Some(p) = state.participants.get_mut(&id) {
                    p.flight = None;
                }
            }
        }
    }

    /// Open flights
    pub fn flight_count(&self) -> usize {
        self.lock().flights.len()
    }

    /// Members of a flight
    pub fn members(&self, flight_code: &str) -> Vec<String> {
        self.lock()
            .flights
            .get(flight_code)
            .cloned()
            .unwrap_or_default()
    }
}

/// A client's connection to a [`MemoryRelay`]
#[derive(Debug)]
pub struct MemoryLink {
    relay: MemoryRelay,
    id: u64,
}

impl MemoryLink {
    /// Relay-side id of this link, for [`MemoryRelay::sever`]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl SignalingLink for MemoryLink {
    fn open(&self) {
        let mut state = self.relay.lock();
        let available = state.available;
        let Some(slot) = state.links.get_mut(&self.id) else {
            return;
        };
        if slot.open {
            return;
        }
        let event = if available {
            slot.open = true;
            SignalingEvent::Opened
        } else {
            SignalingEvent::Closed
        };
        let _ = slot.events.send(event);
    }

    fn send(&self, message: &ClientMessage) -> Result<()> {
        let mut state = self.relay.lock();
        if !state.links.get(&self.id).is_some_and(|s| s.open) {
            return Err(FlightError::Signaling(Cow::Borrowed("relay link is not open")));
        }
        state.handle(self.id, message.clone());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.relay
            .lock()
            .links
            .get(&self.id)
            .is_some_and(|s| s.open)
    }

    fn close(&self) {
        let mut state = self.relay.lock();
        if !state.links.get(&self.id).is_some_and(|s| s.open) {
            return;
        }
        state.disconnect(self.id);
        if let Some(slot) = state.links.get(&self.id) {
            let _ = slot.events.send(SignalingEvent::Closed);
        }
    }
}
