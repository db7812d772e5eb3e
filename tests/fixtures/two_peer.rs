//! Two-peer test fixture
//!
//! Two coordinators paired through an in-process relay and joined by an
//! in-memory peer channel, for end-to-end transfer tests.
//!
//! # Example
//!
//! ```no_run
//! use flightline_core::FlightConfig;
//! use flightline_integration_tests::fixtures::TwoPeerFixture;
//!
//! #[tokio::test]
//! async fn test_basic_transfer() {
//!     let mut fixture = TwoPeerFixture::new(FlightConfig::default()).unwrap();
//!     fixture.establish().await;
//!     // ... enqueue on fixture.host, observe fixture.guest.events ...
//!     fixture.cleanup().await;
//! }
//! ```

use crate::test_helpers::expect_event;
use flightline_core::{
    FlightConfig, MemoryChannel, MemoryRelay, Result, SessionCoordinator, SessionEvent,
    SessionHandle,
};
use flightline_files::BufferTier;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One running coordinator
pub struct PeerSide {
    /// Command handle
    pub handle: SessionHandle,
    /// Event stream
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    /// Relay-side link id, for severing
    pub link_id: u64,
    task: JoinHandle<()>,
}

impl PeerSide {
    fn start(
        config: &FlightConfig,
        name: &str,
        relay: &MemoryRelay,
        buffer: BufferTier,
    ) -> Result<Self> {
        let (link, link_events) = relay.link();
        let link_id = link.id();
        let (coordinator, handle, events) =
            SessionCoordinator::new(config.clone(), name, Box::new(link), link_events, buffer)?;
        Ok(Self {
            handle,
            events,
            link_id,
            task: tokio::spawn(coordinator.run()),
        })
    }

    async fn stop(self) {
        let _ = self.handle.shutdown().await;
        let _ = self.task.await;
    }
}

/// Host and guest sharing one relay
pub struct TwoPeerFixture {
    /// The relay
    pub relay: MemoryRelay,
    /// Creates the flight
    pub host: PeerSide,
    /// Joins the flight
    pub guest: PeerSide,
}

impl TwoPeerFixture {
    /// Both sides buffer in memory
    ///
    /// # Errors
    ///
    /// Returns `FlightError::InvalidConfig` if `config` does not validate.
    pub fn new(config: FlightConfig) -> Result<Self> {
        Self::with_buffers(config, BufferTier::in_memory(), BufferTier::in_memory())
    }

    /// Custom buffer tiers per side
    ///
    /// # Errors
    ///
    /// Returns `FlightError::InvalidConfig` if `config` does not validate.
    pub fn with_buffers(
        config: FlightConfig,
        host_buffer: BufferTier,
        guest_buffer: BufferTier,
    ) -> Result<Self> {
        let relay = MemoryRelay::new();
        let host = PeerSide::start(&config, "host", &relay, host_buffer)?;
        let guest = PeerSide::start(&config, "guest", &relay, guest_buffer)?;
        Ok(Self { relay, host, guest })
    }

    /// Register both sides, pair them in a flight and attach a channel
    ///
    /// Returns the flight code.
    pub async fn establish(&mut self) -> String {
        self.host.handle.connect().await.unwrap();
        self.guest.handle.connect().await.unwrap();
        expect_event(&mut self.host.events, "host registration", |e| {
            matches!(e, SessionEvent::Registered { .. }).then_some(())
        })
        .await;
        expect_event(&mut self.guest.events, "guest registration", |e| {
            matches!(e, SessionEvent::Registered { .. }).then_some(())
        })
        .await;

        self.host.handle.create_flight().await.unwrap();
        let code = expect_event(&mut self.host.events, "flight code", |e| match e {
            SessionEvent::FlightCreated { flight_code } => Some(flight_code.clone()),
            _ => None,
        })
        .await;

        self.guest.handle.join_flight(code.clone()).await.unwrap();
        expect_event(&mut self.host.events, "guest joined", |e| {
            matches!(e, SessionEvent::PeerJoined { .. }).then_some(())
        })
        .await;
        expect_event(&mut self.guest.events, "host seen", |e| {
            matches!(e, SessionEvent::PeerJoined { .. }).then_some(())
        })
        .await;

        self.attach_channel().await;
        code
    }

    /// Attach a fresh in-memory channel pair
    pub async fn attach_channel(&mut self) {
        let (host_end, guest_end) = MemoryChannel::pair();
        self.guest.handle.attach_channel(guest_end).await.unwrap();
        self.host.handle.attach_channel(host_end).await.unwrap();
    }

    /// Stop both coordinators
    pub async fn cleanup(self) {
        self.host.stop().await;
        self.guest.stop().await;
    }
}
