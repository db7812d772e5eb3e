//! Fuzz target for peer message decoding
//!
//! Anything the peer sends must decode to some message without panicking.

#![no_main]

use flightline_core::{ChannelMessage, PeerMessage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = PeerMessage::parse_text(text);
        let _ = PeerMessage::decode(ChannelMessage::Text(text.to_string()));
    }

    // Binary frames are always chunks
    let decoded = PeerMessage::decode(ChannelMessage::Binary(data.to_vec().into()));
    assert!(matches!(decoded, PeerMessage::Chunk(_)));
});
