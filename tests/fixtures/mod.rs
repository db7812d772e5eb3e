//! Multi-peer fixtures

pub mod two_peer;

pub use two_peer::{PeerSide, TwoPeerFixture};
