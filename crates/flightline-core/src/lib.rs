//! # Flightline Core
//!
//! Transfer and resilience engine for Flightline.
//!
//! This crate provides:
//! - Flow-controlled outbound transfers with a FIFO send queue
//! - Inbound reassembly into memory or durable buffers
//! - Sliding-window speed and ETA estimation
//! - The reconnect state machine that keeps a flight alive across link loss
//!   and peer disconnects
//! - A single-task [`SessionCoordinator`] tying it all together
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      SessionCoordinator                       │
//! │        (one task; commands in, SessionEvents out)            │
//! ├───────────────┬───────────────┬──────────────────────────────┤
//! │    Sender     │   Receiver    │       ReconnectEngine         │
//! │ (queue, flow  │ (metadata,    │ (register, rejoin, backoff,   │
//! │  control)     │  buffer tier) │  peer grace period)           │
//! ├───────────────┴───────────────┼──────────────────────────────┤
//! │          PeerChannel          │        SignalingLink          │
//! └───────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Transports are traits; [`memory`] has in-process versions of both.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod memory;
pub mod progress;
pub mod queue;
pub mod receiver;
pub mod reconnect;
pub mod sender;
pub mod session;
pub mod signaling;
pub mod speed;
pub mod wire;

pub use channel::{ChannelEndpoint, ChannelEvent, ChannelMessage, PeerChannel};
pub use config::{
    BufferConfig, FlightConfig, LoggingConfig, ReceiveConfig, ReconnectConfig, SpeedConfig,
    TransferConfig,
};
pub use error::{FlightError, Result};
pub use event::SessionEvent;
pub use identity::{SessionToken, TransferId};
pub use memory::{MemoryChannel, MemoryLink, MemoryRelay};
pub use progress::{Direction, TransferProgress};
pub use queue::{OutboundFile, SendQueue};
pub use receiver::{ReceiveState, Receiver};
pub use reconnect::{ConnectionState, ReconnectAction, ReconnectEngine, backoff_delay};
pub use sender::{Sender, SenderOutput};
pub use session::{SessionCoordinator, SessionHandle, SessionSnapshot};
pub use signaling::{ClientMessage, PeerInfo, ServerMessage, SignalingEvent, SignalingLink};
pub use speed::SpeedEstimator;
pub use wire::{ChatMessage, FileMetadata, PeerMessage};
