//! Error types for the Flightline engine
//!
//! Errors are grouped by how far their damage reaches.
//!
//! # Error Categories
//!
//! - **Transfer-scoped**: fatal to one transfer only (storage full, channel
//!   write failed, unreadable source file). The session keeps running.
//! - **Session-scoped**: the flight cannot continue (reconnect attempts
//!   exhausted, rejoin rejected, peer gone). Sender, receiver and buffer
//!   state are reset and the user has to act.
//! - **Configuration/state**: misuse or bad input.
//!
//! A full channel is flow control and has no variant here.

use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in Flightline operations
#[derive(Debug, Error, Clone)]
pub enum FlightError {
    // ============ Transfer-scoped ============
    /// Durable or memory buffer rejected a write
    #[error("Storage write failed: {0}")]
    StorageWrite(Cow<'static, str>),

    /// Inbound file could not be finalized
    #[error("Finalize failed: {0}")]
    Finalize(Cow<'static, str>),

    /// Source file could not be read
    #[error("Chunk source failed: {0}")]
    ChunkSource(Cow<'static, str>),

    /// Peer channel rejected a write or is closed
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),

    /// Peer sent something the protocol does not allow
    #[error("Protocol violation: {0}")]
    Protocol(Cow<'static, str>),

    // ============ Session-scoped ============
    /// Signaling link could not be restored within the attempt budget
    #[error("Reconnect failed after {0} attempts")]
    ReconnectExhausted(u32),

    /// Relay no longer recognises the session or flight
    #[error("Rejoin rejected: {0}")]
    RejoinRejected(Cow<'static, str>),

    /// Remote peer left or did not return within its grace period
    #[error("Peer lost: {0}")]
    PeerLost(Cow<'static, str>),

    // ============ Configuration & State ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Signaling link error
    #[error("Signaling error: {0}")]
    Signaling(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),
}

impl FlightError {
    /// Returns true if the error only affects the transfer it occurred in
    #[must_use]
    pub fn is_transfer_scoped(&self) -> bool {
        matches!(
            self,
            FlightError::StorageWrite(_)
                | FlightError::Finalize(_)
                | FlightError::ChunkSource(_)
                | FlightError::Channel(_)
                | FlightError::Protocol(_)
        )
    }

    /// Returns true if the error ends the session and forces a full reset
    #[must_use]
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            FlightError::ReconnectExhausted(_)
                | FlightError::RejoinRejected(_)
                | FlightError::PeerLost(_)
        )
    }

    /// Returns true if the engine may still recover without user action
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FlightError::Signaling(_))
    }

    /// Create a channel error with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        FlightError::Channel(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        FlightError::Protocol(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        FlightError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        FlightError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a peer-lost error with static context (zero allocation)
    #[must_use]
    pub const fn peer_lost(context: &'static str) -> Self {
        FlightError::PeerLost(Cow::Borrowed(context))
    }
}

impl From<flightline_files::BufferError> for FlightError {
    fn from(err: flightline_files::BufferError) -> Self {
        match err {
            flightline_files::BufferError::Finalize { .. } => {
                FlightError::Finalize(Cow::Owned(err.to_string()))
            }
            _ => FlightError::StorageWrite(Cow::Owned(err.to_string())),
        }
    }
}

impl From<flightline_files::ChunkError> for FlightError {
    fn from(err: flightline_files::ChunkError) -> Self {
        FlightError::ChunkSource(Cow::Owned(err.to_string()))
    }
}

impl From<serde_json::Error> for FlightError {
    fn from(err: serde_json::Error) -> Self {
        FlightError::Serialization(Cow::Owned(err.to_string()))
    }
}

impl From<std::io::Error> for FlightError {
    fn from(err: std::io::Error) -> Self {
        FlightError::Io(err.to_string())
    }
}

/// Result type for Flightline operations
pub type Result<T> = std::result::Result<T, FlightError>;

#[cfg(test)]
mod tests {
    use super::*;
    use flightline_files::BufferError;

    #[test]
    fn test_transfer_scoped_errors() {
        assert!(FlightError::StorageWrite(Cow::Borrowed("test")).is_transfer_scoped());
        assert!(FlightError::Finalize(Cow::Borrowed("test")).is_transfer_scoped());
        assert!(FlightError::channel("closed").is_transfer_scoped());
        assert!(FlightError::protocol("bad metadata").is_transfer_scoped());
    }

    #[test]
    fn test_session_scoped_errors() {
        assert!(FlightError::ReconnectExhausted(5).is_session_scoped());
        assert!(FlightError::RejoinRejected(Cow::Borrowed("expired")).is_session_scoped());
        assert!(FlightError::peer_lost("grace expired").is_session_scoped());
    }

    #[test]
    fn test_mutual_exclusivity() {
        let errors = [
            FlightError::StorageWrite(Cow::Borrowed("test")),
            FlightError::channel("test"),
            FlightError::ReconnectExhausted(3),
            FlightError::RejoinRejected(Cow::Borrowed("test")),
            FlightError::invalid_config("test"),
        ];

        for err in &errors {
            assert!(!(err.is_transfer_scoped() && err.is_session_scoped()));
        }
    }

    #[test]
    fn test_buffer_error_conversion() {
        let err: FlightError = BufferError::StorageWrite {
            name: "big.iso".to_string(),
            source: std::io::Error::other("no space left"),
        }
        .into();
        assert!(matches!(err, FlightError::StorageWrite(_)));
        assert!(err.to_string().contains("no space left"));

        let err: FlightError = BufferError::Finalize {
            name: "big.iso".to_string(),
            source: std::io::Error::other("flush"),
        }
        .into();
        assert!(matches!(err, FlightError::Finalize(_)));
    }

    #[test]
    fn test_error_display() {
        let err = FlightError::ReconnectExhausted(5);
        assert_eq!(err.to_string(), "Reconnect failed after 5 attempts");
    }
}
