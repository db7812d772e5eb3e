//! Fuzz target for progress snapshots
//!
//! Announced sizes come from the peer, so any size and any sample timing
//! must produce a snapshot without panicking.

#![no_main]

use arbitrary::Arbitrary;
use flightline_core::identity::TransferId;
use flightline_core::{Direction, SpeedEstimator, TransferProgress};
use libfuzzer_sys::fuzz_target;
use std::time::{Duration, Instant};

#[derive(Debug, Arbitrary)]
struct Sample {
    bytes: u64,
    after_ms: u32,
}

#[derive(Debug, Arbitrary)]
struct ProgressInput {
    announced: u64,
    sample_interval_ms: u16,
    window: u8,
    samples: Vec<Sample>,
}

fuzz_target!(|input: ProgressInput| {
    let window = usize::from(input.window.max(1));
    let mut speed = SpeedEstimator::new(
        Duration::from_millis(u64::from(input.sample_interval_ms)),
        window,
    );

    let mut now = Instant::now();
    let mut done = 0u64;
    speed.update_at(done, now);
    for sample in input.samples.iter().take(64) {
        now += Duration::from_millis(u64::from(sample.after_ms));
        done = done.saturating_add(sample.bytes);
        speed.update_at(done, now);

        let snapshot = TransferProgress::snapshot(
            TransferId::from_bytes([0; 16]),
            "fuzz.bin",
            Direction::Receive,
            done,
            input.announced,
            &speed,
        );
        assert!(snapshot.progress_percent <= 100.0);
        let _ = snapshot.eta_string();
        let _ = snapshot.speed_string();
    }
});
