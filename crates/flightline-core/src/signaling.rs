//! Relay signaling messages and link abstraction
//!
//! Envelopes are JSON objects discriminated by a kebab-case `type` field with
//! camelCase payload fields:
//!
//! ```text
//! {"type":"rejoin-flight","sessionToken":"…","flightCode":"K7QX2A"}
//! {"type":"peer-temporarily-disconnected","gracePeriodMs":30000}
//! ```

use crate::error::{FlightError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description of the remote participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Relay-assigned participant id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
}

/// Client → relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Register this client under a display name
    RegisterDetails {
        /// Display name
        name: String,
    },
    /// Open a new flight
    CreateFlight,
    /// Join an existing flight
    #[serde(rename_all = "camelCase")]
    JoinFlight {
        /// Flight code
        flight_code: String,
    },
    /// Resume a flight after the link dropped
    #[serde(rename_all = "camelCase")]
    RejoinFlight {
        /// Token issued on registration
        session_token: String,
        /// Flight being resumed
        flight_code: String,
    },
    /// Leave the current flight
    LeaveFlight,
    /// Opaque channel setup payload for the peer
    Signal {
        /// Payload
        data: Value,
    },
}

/// Relay → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Registration accepted
    #[serde(rename_all = "camelCase")]
    Registered {
        /// Relay-assigned participant id
        id: String,
        /// Credential for later rejoins
        session_token: String,
    },
    /// Flight opened
    #[serde(rename_all = "camelCase")]
    FlightCreated {
        /// Code the peer joins with
        flight_code: String,
    },
    /// Peer present in the flight
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        /// Remote participant
        peer: PeerInfo,
        /// Relay's view of the path between the peers
        connection_type: String,
    },
    /// Rejoin accepted
    #[serde(rename_all = "camelCase")]
    RejoinSuccess {
        /// Flight resumed
        flight_code: String,
        /// Refreshed token, if the relay rotated it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
        /// Remote participant, if still present
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<PeerInfo>,
    },
    /// Rejoin refused; the session is gone
    RejoinFailed {
        /// Relay's reason
        #[serde(default)]
        reason: String,
    },
    /// Peer dropped but may return
    #[serde(rename_all = "camelCase")]
    PeerTemporarilyDisconnected {
        /// Relay-side grace period in milliseconds
        grace_period_ms: u64,
    },
    /// Peer returned within its grace period
    #[serde(rename_all = "camelCase")]
    PeerReconnected {
        /// Remote participant
        peer: PeerInfo,
        /// Relay's view of the path between the peers
        connection_type: String,
    },
    /// Peer left for good
    PeerLeft,
    /// Opaque channel setup payload from the peer
    Signal {
        /// Payload
        data: Value,
    },
    /// Relay-side error
    Error {
        /// Description
        message: String,
    },
}

impl ClientMessage {
    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns `FlightError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns `FlightError::Serialization` if the envelope is unknown or malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Envelope type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterDetails { .. } => "register-details",
            Self::CreateFlight => "create-flight",
            Self::JoinFlight { .. } => "join-flight",
            Self::RejoinFlight { .. } => "rejoin-flight",
            Self::LeaveFlight => "leave-flight",
            Self::Signal { .. } => "signal",
        }
    }
}

impl ServerMessage {
    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns `FlightError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns `FlightError::Serialization` if the envelope is unknown or malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Notification from the signaling link
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Link is up
    Opened,
    /// Link went down, or an open attempt failed
    Closed,
    /// Envelope from the relay
    Message(ServerMessage),
    /// Frame that did not decode
    Malformed(String),
}

impl SignalingEvent {
    /// Decode a raw text frame from the relay
    pub fn from_frame(frame: &str) -> Self {
        match ServerMessage::from_json(frame) {
            Ok(message) => Self::Message(message),
            Err(FlightError::Serialization(e)) => Self::Malformed(e.into_owned()),
            Err(e) => Self::Malformed(e.to_string()),
        }
    }
}

/// Connection to the signaling relay
///
/// `open` starts a connection attempt; its outcome arrives later as
/// [`SignalingEvent::Opened`] or [`SignalingEvent::Closed`].
pub trait SignalingLink: Send {
    /// Start connecting
    fn open(&self);

    /// Send an envelope
    ///
    /// # Errors
    ///
    /// Returns `FlightError::Signaling` if the link is not open.
    fn send(&self, message: &ClientMessage) -> Result<()>;

    /// Returns true while the link is up
    fn is_open(&self) -> bool;

    /// Close the link
    fn close(&self);
}
