//! Connection resilience state machine
//!
//! Keeps a flight alive across signaling link loss and short peer absences.
//! The engine performs no I/O and owns no timers: every input returns the
//! [`ReconnectAction`]s the coordinator must carry out, in order.
//!
//! # States
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──registered──▶ Connected
//!      ▲                                                │    ▲  │
//!      │ exhausted / rejoin-failed        link lost     │    │  │ peer-temporarily-
//!      │ peer-left / grace expiry        (in a flight)  ▼    │  ▼ disconnected
//!      └──────────────────────────────────────── Reconnecting  PeerGracePeriod
//! ```

use crate::config::ReconnectConfig;
use crate::error::{FlightError, Result};
use crate::event::SessionEvent;
use crate::identity::SessionToken;
use crate::signaling::{ClientMessage, PeerInfo, ServerMessage, SignalingEvent};
use serde_json::Value;
use std::borrow::Cow;
use std::time::Duration;

/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No relay session
    Disconnected,
    /// Opening the link and registering
    Connecting,
    /// Registered with the relay
    Connected,
    /// Link lost during a flight; retrying
    Reconnecting,
    /// Peer dropped and may return
    PeerGracePeriod,
}

impl ConnectionState {
    /// Returns true for states that resolve without user action
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Reconnecting | Self::PeerGracePeriod
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::PeerGracePeriod => write!(f, "PeerGracePeriod"),
        }
    }
}

/// Work requested by the engine
#[derive(Debug, Clone)]
pub enum ReconnectAction {
    /// Start a link connection attempt
    OpenLink,
    /// Close the link
    CloseLink,
    /// Send an envelope to the relay
    Send(ClientMessage),
    /// Call [`ReconnectEngine::on_retry_timer`] after `delay`
    ScheduleRetry {
        /// 1-based attempt number
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// Disarm the retry timer
    CancelRetry,
    /// Call [`ReconnectEngine::on_grace_expired`] after the duration
    ArmGrace(Duration),
    /// Disarm the grace timer
    CancelGrace,
    /// Hold outbound transfers
    PauseTransfers,
    /// Release outbound transfers
    ResumeTransfers,
    /// Peer came back on a new channel: fail the interrupted send and drop
    /// any partial inbound file
    PeerReturned,
    /// Clear sender, receiver and buffered data
    ResetSession,
    /// Forward to the presentation layer
    Emit(SessionEvent),
}

/// Delay before reconnect attempt `attempt` (1-based)
///
/// `min(base × 2^(attempt−1), max)`
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    config.base_delay.saturating_mul(factor).min(config.max_delay)
}

/// Reconnect and rejoin state machine
#[derive(Debug)]
pub struct ReconnectEngine {
    config: ReconnectConfig,
    display_name: String,
    state: ConnectionState,
    token: Option<SessionToken>,
    participant_id: Option<String>,
    flight: Option<String>,
    pending_join: Option<String>,
    peer: Option<PeerInfo>,
    attempts: u32,
    /// Grace announced for a peer that has not come back yet
    peer_grace: Option<Duration>,
    /// Close events still due from links this engine shut down itself
    closes_owed: u32,
    terminal: bool,
    link_open: bool,
}

impl ReconnectEngine {
    /// Create a disconnected engine registering as `display_name`
    pub fn new(config: ReconnectConfig, display_name: impl Into<String>) -> Self {
        Self {
            config,
            display_name: display_name.into(),
            state: ConnectionState::Disconnected,
            token: None,
            participant_id: None,
            flight: None,
            pending_join: None,
            peer: None,
            attempts: 0,
            peer_grace: None,
            closes_owed: 0,
            terminal: false,
            link_open: false,
        }
    }

    fn set_state(&mut self, new_state: ConnectionState, actions: &mut Vec<ReconnectAction>) {
        if self.state == new_state {
            return;
        }
        tracing::debug!(
            "Connection state transition: {:?} -> {:?}",
            self.state,
            new_state
        );
        self.state = new_state;
        actions.push(ReconnectAction::Emit(SessionEvent::ConnectionStateChanged(
            new_state,
        )));
    }

    /// Open the link and register
    pub fn connect(&mut self) -> Vec<ReconnectAction> {
        let mut actions = Vec::new();
        if self.state != ConnectionState::Disconnected {
            tracing::debug!("connect() ignored in state {:?}", self.state);
            return actions;
        }
        self.terminal = false;
        self.attempts = 0;
        self.set_state(ConnectionState::Connecting, &mut actions);
        actions.push(ReconnectAction::OpenLink);
        actions
    }

    /// Ask the relay for a new flight
    ///
    /// # Errors
    ///
    /// Returns `FlightError::InvalidState` unless registered and outside a flight.
    pub fn create_flight(&mut self) -> Result<Vec<ReconnectAction>> {
        self.check_can_start_flight()?;
        Ok(vec![ReconnectAction::Send(ClientMessage::CreateFlight)])
    }

    /// Join a flight by code
    ///
    /// # Errors
    ///
    /// Returns `FlightError::InvalidState` unless registered and outside a flight.
    pub fn join_flight(&mut self, flight_code: impl Into<String>) -> Result<Vec<ReconnectAction>> {
        self.check_can_start_flight()?;
        let flight_code = flight_code.into();
        self.pending_join = Some(flight_code.clone());
        Ok(vec![ReconnectAction::Send(ClientMessage::JoinFlight {
            flight_code,
        })])
    }

    fn check_can_start_flight(&self) -> Result<()> {
        if self.state != ConnectionState::Connected || self.token.is_none() {
            return Err(FlightError::invalid_state("not registered with the relay"));
        }
        if self.flight.is_some() {
            return Err(FlightError::invalid_state("already in a flight"));
        }
        Ok(())
    }

    /// Forward a channel setup payload to the peer
    ///
    /// # Errors
    ///
    /// Returns `FlightError::Signaling` if the link is down.
    pub fn send_signal(&mut self, data: Value) -> Result<Vec<ReconnectAction>> {
        if !self.link_open {
            return Err(FlightError::Signaling(Cow::Borrowed("signaling link is not open")));
        }
        Ok(vec![ReconnectAction::Send(ClientMessage::Signal { data })])
    }

    /// Handle a signaling link event
    pub fn on_link_event(&mut self, event: SignalingEvent) -> Vec<ReconnectAction> {
        match event {
            SignalingEvent::Opened => self.on_link_opened(),
            SignalingEvent::Closed => self.on_link_closed(),
            SignalingEvent::Message(message) => self.on_server_message(message),
            SignalingEvent::Malformed(reason) => {
                tracing::warn!("Malformed signaling frame: {}", reason);
                vec![ReconnectAction::Emit(SessionEvent::SignalingError(reason))]
            }
        }
    }

    fn on_link_opened(&mut self) -> Vec<ReconnectAction> {
        self.link_open = true;
        match self.state {
            ConnectionState::Connecting => {
                vec![ReconnectAction::Send(ClientMessage::RegisterDetails {
                    name: self.display_name.clone(),
                })]
            }
            ConnectionState::Reconnecting => {
                let (Some(token), Some(flight)) = (self.token.clone(), self.flight.clone()) else {
                    return self.fail(FlightError::RejoinRejected(Cow::Borrowed(
                        "no session to rejoin",
                    )));
                };
                tracing::info!(
                    "Link restored on attempt {}, rejoining flight {}",
                    self.attempts,
                    flight
                );
                vec![ReconnectAction::Send(ClientMessage::RejoinFlight {
                    session_token: token.as_str().to_string(),
                    flight_code: flight,
                })]
            }
            _ => Vec::new(),
        }
    }

    fn on_link_closed(&mut self) -> Vec<ReconnectAction> {
        let mut actions = Vec::new();
        if self.closes_owed > 0 {
            self.closes_owed -= 1;
            tracing::debug!("Ignoring close of a link this session already shut down");
            return actions;
        }

        self.link_open = false;
        if self.terminal {
            return actions;
        }

        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Reconnecting => actions.extend(self.schedule_next()),
            _ if self.flight.is_some() && self.token.is_some() => {
                tracing::warn!("Signaling link lost during flight, reconnecting");
                self.attempts = 0;
                self.set_state(ConnectionState::Reconnecting, &mut actions);
                actions.push(ReconnectAction::CancelGrace);
                actions.push(ReconnectAction::PauseTransfers);
                actions.extend(self.schedule_next());
            }
            _ => {
                tracing::info!("Signaling link closed outside a flight");
                self.token = None;
                self.participant_id = None;
                self.pending_join = None;
                self.set_state(ConnectionState::Disconnected, &mut actions);
            }
        }
        actions
    }

    fn schedule_next(&mut self) -> Vec<ReconnectAction> {
        self.attempts += 1;
        if self.attempts > self.config.max_attempts {
            return self.fail(FlightError::ReconnectExhausted(self.config.max_attempts));
        }
        let delay = backoff_delay(&self.config, self.attempts);
        tracing::info!(
            "Reconnect attempt {}/{} in {:?}",
            self.attempts,
            self.config.max_attempts,
            delay
        );
        vec![ReconnectAction::ScheduleRetry {
            attempt: self.attempts,
            delay,
        }]
    }

    /// The retry timer fired
    pub fn on_retry_timer(&mut self) -> Vec<ReconnectAction> {
        if self.state == ConnectionState::Reconnecting && !self.link_open && !self.terminal {
            vec![ReconnectAction::OpenLink]
        } else {
            Vec::new()
        }
    }

    /// The peer grace timer fired
    pub fn on_grace_expired(&mut self) -> Vec<ReconnectAction> {
        if self.state != ConnectionState::PeerGracePeriod {
            return Vec::new();
        }
        self.peer_lost("peer did not return within its grace period")
    }

    fn on_server_message(&mut self, message: ServerMessage) -> Vec<ReconnectAction> {
        let mut actions = Vec::new();
        match message {
            ServerMessage::Registered { id, session_token } => {
                if self.state != ConnectionState::Connecting {
                    tracing::debug!("Ignoring registration in state {:?}", self.state);
                    return actions;
                }
                tracing::info!("Registered with relay as {}", id);
                self.token = Some(SessionToken::new(session_token));
                self.participant_id = Some(id.clone());
                self.set_state(ConnectionState::Connected, &mut actions);
                actions.push(ReconnectAction::Emit(SessionEvent::Registered { id }));
            }
            ServerMessage::FlightCreated { flight_code } => {
                tracing::info!("Flight {} created", flight_code);
                self.flight = Some(flight_code.clone());
                actions.push(ReconnectAction::Emit(SessionEvent::FlightCreated {
                    flight_code,
                }));
            }
            ServerMessage::PeerJoined {
                peer,
                connection_type,
            } => {
                if let Some(code) = self.pending_join.take() {
                    self.flight = Some(code);
                }
                tracing::info!("Peer {} joined ({})", peer.id, connection_type);
                self.peer = Some(peer.clone());
                actions.push(ReconnectAction::Emit(SessionEvent::PeerJoined {
                    peer,
                    connection_type,
                }));
            }
            ServerMessage::RejoinSuccess {
                flight_code,
                session_token,
                peer,
            } => {
                if self.state != ConnectionState::Reconnecting {
                    tracing::debug!("Ignoring rejoin-success in state {:?}", self.state);
                    return actions;
                }
                tracing::info!("Rejoined flight {} after {} attempts", flight_code, self.attempts);
                self.attempts = 0;
                if let Some(token) = session_token {
                    self.token = Some(SessionToken::new(token));
                }
                self.flight = Some(flight_code);
                actions.push(ReconnectAction::CancelRetry);
                match (peer, self.peer_grace) {
                    (None, Some(grace)) => {
                        tracing::info!("Peer still away after rejoin, waiting up to {:?}", grace);
                        self.set_state(ConnectionState::PeerGracePeriod, &mut actions);
                        actions.push(ReconnectAction::ArmGrace(grace));
                    }
                    (peer, _) => {
                        self.set_state(ConnectionState::Connected, &mut actions);
                        if let Some(peer) = peer {
                            self.peer = Some(peer.clone());
                            self.peer_grace = None;
                            actions.push(ReconnectAction::Emit(SessionEvent::PeerPresence {
                                peer: Some(peer),
                                online: true,
                            }));
                        }
                        actions.push(ReconnectAction::ResumeTransfers);
                    }
                }
            }
            ServerMessage::RejoinFailed { reason } => {
                return self.fail(FlightError::RejoinRejected(Cow::Owned(reason)));
            }
            ServerMessage::PeerTemporarilyDisconnected { grace_period_ms } => {
                if self.state != ConnectionState::Connected || self.flight.is_none() {
                    return actions;
                }
                let grace = Duration::from_millis(grace_period_ms) + self.config.grace_slack;
                tracing::warn!("Peer temporarily disconnected, waiting up to {:?}", grace);
                self.peer_grace = Some(grace);
                self.set_state(ConnectionState::PeerGracePeriod, &mut actions);
                actions.push(ReconnectAction::PauseTransfers);
                actions.push(ReconnectAction::ArmGrace(grace));
                actions.push(ReconnectAction::Emit(SessionEvent::PeerPresence {
                    peer: self.peer.clone(),
                    online: false,
                }));
            }
            ServerMessage::PeerReconnected {
                peer,
                connection_type,
            } => {
                if !matches!(
                    self.state,
                    ConnectionState::PeerGracePeriod | ConnectionState::Connected
                ) {
                    return actions;
                }
                tracing::info!("Peer {} reconnected ({})", peer.id, connection_type);
                self.peer = Some(peer.clone());
                self.peer_grace = None;
                actions.push(ReconnectAction::CancelGrace);
                self.set_state(ConnectionState::Connected, &mut actions);
                actions.push(ReconnectAction::Emit(SessionEvent::PeerPresence {
                    peer: Some(peer),
                    online: true,
                }));
                actions.push(ReconnectAction::PeerReturned);
                actions.push(ReconnectAction::Emit(SessionEvent::RenegotiateChannel));
                actions.push(ReconnectAction::ResumeTransfers);
            }
            ServerMessage::PeerLeft => {
                if self.flight.is_some() {
                    return self.peer_lost("peer left the flight");
                }
            }
            ServerMessage::Signal { data } => {
                actions.push(ReconnectAction::Emit(SessionEvent::Signal(data)));
            }
            ServerMessage::Error { message } => {
                tracing::warn!("Relay error: {}", message);
                self.pending_join = None;
                actions.push(ReconnectAction::Emit(SessionEvent::SignalingError(message)));
            }
        }
        actions
    }

    fn peer_lost(&mut self, context: &'static str) -> Vec<ReconnectAction> {
        let mut actions = Vec::new();
        if self.link_open {
            actions.push(ReconnectAction::Send(ClientMessage::LeaveFlight));
        }
        actions.extend(self.fail(FlightError::peer_lost(context)));
        actions
    }

    /// Terminal failure: clear everything and require user action
    fn fail(&mut self, error: FlightError) -> Vec<ReconnectAction> {
        tracing::warn!("Session failed: {}", error);
        let mut actions = vec![
            ReconnectAction::CancelRetry,
            ReconnectAction::CancelGrace,
            ReconnectAction::ResetSession,
        ];
        if self.link_open {
            self.link_open = false;
            self.closes_owed += 1;
            actions.push(ReconnectAction::CloseLink);
        }
        self.terminal = true;
        self.clear_session();
        self.set_state(ConnectionState::Disconnected, &mut actions);
        actions.push(ReconnectAction::Emit(SessionEvent::SessionFailed(error)));
        actions
    }

    fn clear_session(&mut self) {
        self.attempts = 0;
        self.token = None;
        self.participant_id = None;
        self.flight = None;
        self.pending_join = None;
        self.peer = None;
        self.peer_grace = None;
    }

    /// Leave the flight on purpose
    pub fn leave(&mut self) -> Vec<ReconnectAction> {
        let mut actions = Vec::new();
        if self.state == ConnectionState::Disconnected && !self.link_open {
            return actions;
        }
        tracing::info!("Leaving flight");
        if self.link_open {
            if self.flight.is_some() {
                actions.push(ReconnectAction::Send(ClientMessage::LeaveFlight));
            }
            self.closes_owed += 1;
            self.link_open = false;
            actions.push(ReconnectAction::CloseLink);
        }
        actions.push(ReconnectAction::CancelRetry);
        actions.push(ReconnectAction::CancelGrace);
        actions.push(ReconnectAction::ResetSession);
        self.clear_session();
        self.set_state(ConnectionState::Disconnected, &mut actions);
        actions
    }

    /// The host became visible again
    ///
    /// Starts reconnecting right away if a flight is active but the link is down.
    pub fn on_foreground(&mut self) -> Vec<ReconnectAction> {
        let mut actions = Vec::new();
        if self.flight.is_none()
            || self.token.is_none()
            || self.terminal
            || self.link_open
            || self.state == ConnectionState::Reconnecting
        {
            return actions;
        }
        tracing::info!("Foregrounded with link down, reconnecting");
        self.attempts = 0;
        self.set_state(ConnectionState::Reconnecting, &mut actions);
        actions.push(ReconnectAction::PauseTransfers);
        actions.extend(self.schedule_next());
        actions
    }

    /// Forget a terminal failure so the user can connect again
    pub fn clear_failure(&mut self) {
        self.terminal = false;
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Active flight code
    pub fn flight_code(&self) -> Option<&str> {
        self.flight.as_deref()
    }

    /// Session token held
    pub fn session_token(&self) -> Option<&SessionToken> {
        self.token.as_ref()
    }

    /// Known remote participant
    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    /// Relay-assigned participant id
    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }

    /// Reconnect attempts made in the current outage
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns true after an unrecoverable failure
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Returns true while the link is up
    pub fn is_link_open(&self) -> bool {
        self.link_open
    }
}
