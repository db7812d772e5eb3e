//! Events emitted by the session coordinator.

use crate::error::FlightError;
use crate::identity::TransferId;
use crate::progress::{Direction, TransferProgress};
use crate::reconnect::ConnectionState;
use crate::signaling::PeerInfo;
use crate::wire::ChatMessage;
use flightline_files::ReceivedFile;
use serde_json::Value;

/// Everything the presentation layer needs to observe
#[derive(Debug, Clone)]
pub enum SessionEvent {
    // ============ Connection ============
    /// Connection state moved
    ConnectionStateChanged(ConnectionState),

    /// Relay accepted registration
    Registered {
        /// Relay-assigned participant id
        id: String,
    },

    /// Flight opened; share the code with the peer
    FlightCreated {
        /// Flight code
        flight_code: String,
    },

    /// Peer joined the flight
    PeerJoined {
        /// Remote participant
        peer: PeerInfo,
        /// Relay's view of the path between the peers
        connection_type: String,
    },

    /// Peer went away or came back
    PeerPresence {
        /// Remote participant, when known
        peer: Option<PeerInfo>,
        /// Whether the peer is reachable
        online: bool,
    },

    /// The peer channel has to be set up again
    RenegotiateChannel,

    /// Channel setup payload from the peer
    Signal(Value),

    /// Non-fatal relay error
    SignalingError(String),

    /// The session ended and needs user action
    SessionFailed(FlightError),

    /// Session state was cleared
    SessionReset,

    // ============ Transfers ============
    /// Transfer began
    TransferStarted {
        /// Transfer ID
        id: TransferId,
        /// File name
        name: String,
        /// Announced size
        size: u64,
        /// Direction
        direction: Direction,
    },

    /// Throttled progress snapshot
    TransferProgress(TransferProgress),

    /// Transfer finished
    TransferCompleted {
        /// Transfer ID
        id: TransferId,
        /// File name
        name: String,
        /// Direction
        direction: Direction,
    },

    /// Outbound transfer cancelled locally
    TransferCancelled {
        /// Transfer ID
        id: TransferId,
        /// File name
        name: String,
    },

    /// Transfer abandoned after an error
    TransferFailed {
        /// Transfer ID
        id: TransferId,
        /// File name
        name: String,
        /// Direction
        direction: Direction,
        /// Cause
        error: FlightError,
    },

    /// Partial inbound transfer dropped before completion
    TransferDiscarded {
        /// Transfer ID
        id: TransferId,
        /// File name
        name: String,
        /// Bytes received before the discard
        bytes_received: u64,
    },

    /// Inbound file ready
    FileReceived {
        /// File handle
        file: ReceivedFile,
        /// Executable-like name; never auto-open
        hazardous: bool,
    },

    /// No new inbound file within the quiet period
    BatchComplete {
        /// Files received in the batch
        count: usize,
    },

    /// Chat from the peer
    ChatReceived(ChatMessage),

    /// Peer's media stream ended
    StreamEnded,

    /// Peer sent something unparseable; always `FlightError::Protocol`
    ProtocolViolation(FlightError),
}

impl SessionEvent {
    /// Short name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged(_) => "connection-state-changed",
            Self::Registered { .. } => "registered",
            Self::FlightCreated { .. } => "flight-created",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerPresence { .. } => "peer-presence",
            Self::RenegotiateChannel => "renegotiate-channel",
            Self::Signal(_) => "signal",
            Self::SignalingError(_) => "signaling-error",
            Self::SessionFailed(_) => "session-failed",
            Self::SessionReset => "session-reset",
            Self::TransferStarted { .. } => "transfer-started",
            Self::TransferProgress(_) => "transfer-progress",
            Self::TransferCompleted { .. } => "transfer-completed",
            Self::TransferCancelled { .. } => "transfer-cancelled",
            Self::TransferFailed { .. } => "transfer-failed",
            Self::TransferDiscarded { .. } => "transfer-discarded",
            Self::FileReceived { .. } => "file-received",
            Self::BatchComplete { .. } => "batch-complete",
            Self::ChatReceived(_) => "chat-received",
            Self::StreamEnded => "stream-ended",
            Self::ProtocolViolation(_) => "protocol-violation",
        }
    }
}
