//! Fuzz target for relay envelope decoding

#![no_main]

use flightline_core::{ServerMessage, SignalingEvent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = std::str::from_utf8(data) {
        let _ = SignalingEvent::from_frame(frame);

        // Whatever decodes must encode again
        if let Ok(message) = ServerMessage::from_json(frame) {
            let _ = message.to_json();
        }
    }
});
