//! Peer channel abstraction.
//!
//! The engine never owns a transport. It writes through [`PeerChannel`] and
//! learns about deliveries, buffer drain and closure from a stream of
//! [`ChannelEvent`]s, the way a browser data channel reports them.

use crate::error::Result;
use bytes::Bytes;
use tokio::sync::mpsc;

/// A message on the peer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// UTF-8 control message
    Text(String),
    /// File chunk
    Binary(Bytes),
}

impl ChannelMessage {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Returns true for an empty payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Notification from the peer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel is ready for writes
    Open,
    /// Message from the peer
    Message(ChannelMessage),
    /// Buffered amount fell to or below the low-water threshold
    BufferedAmountLow,
    /// Channel closed by either side
    Closed,
}

/// Ordered, reliable, message-oriented transport to the peer
pub trait PeerChannel: Send + Sync {
    /// Queue a text message
    ///
    /// # Errors
    ///
    /// Returns `FlightError::Channel` if the channel is closed or rejects the write.
    fn send_text(&self, text: &str) -> Result<()>;

    /// Queue a binary message
    ///
    /// # Errors
    ///
    /// Returns `FlightError::Channel` if the channel is closed or rejects the write.
    fn send_binary(&self, data: Bytes) -> Result<()>;

    /// Bytes queued locally but not yet handed to the network
    fn buffered_amount(&self) -> usize;

    /// Level at which [`ChannelEvent::BufferedAmountLow`] fires
    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Returns true while writes are accepted
    fn is_open(&self) -> bool;

    /// Close the channel
    fn close(&self);
}

/// A channel together with its event stream
pub struct ChannelEndpoint {
    /// Write side
    pub channel: Box<dyn PeerChannel>,
    /// Event side
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelEndpoint {
    /// Bundle a channel with its events
    pub fn new(channel: Box<dyn PeerChannel>, events: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self { channel, events }
    }
}

impl std::fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("open", &self.channel.is_open())
            .field("buffered", &self.channel.buffered_amount())
            .finish()
    }
}
