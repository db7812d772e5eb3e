//! Fuzz test for configuration file parsing
//!
//! Arbitrary TOML must not panic when parsed or validated as a flight
//! configuration.

#![no_main]

use flightline_core::FlightConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = toml::from_str::<FlightConfig>(s) {
            let _ = config.validate();
        }
    }
});
