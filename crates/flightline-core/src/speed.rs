//! Moving-average transfer speed.
//!
//! Samples are taken at most once per sample interval, so a burst of small
//! chunk writes does not skew the average toward instantaneous spikes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One retained speed sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    /// Bytes moved since the previous sample
    pub bytes_delta: u64,
    /// Wall-clock time since the previous sample
    pub time_delta: Duration,
}

impl SpeedSample {
    /// Bytes per second for this sample
    pub fn rate(&self) -> f64 {
        let secs = self.time_delta.as_secs_f64();
        if secs > 0.0 {
            self.bytes_delta as f64 / secs
        } else {
            0.0
        }
    }
}

/// Windowed speed estimator for one active transfer
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    sample_interval: Duration,
    window: usize,
    samples: VecDeque<SpeedSample>,
    /// Byte offset and time of the last sample boundary
    boundary: Option<(u64, Instant)>,
    /// Most recent raw byte offset
    latest: u64,
}

impl SpeedEstimator {
    /// Create an estimator
    ///
    /// A zero `window` is treated as one.
    pub fn new(sample_interval: Duration, window: usize) -> Self {
        let window = window.max(1);
        Self {
            sample_interval,
            window,
            samples: VecDeque::with_capacity(window),
            boundary: None,
            latest: 0,
        }
    }

    /// Record `done` bytes transferred at the current time
    pub fn update(&mut self, done: u64) {
        self.update_at(done, Instant::now());
    }

    /// Record `done` bytes transferred at `now`
    pub fn update_at(&mut self, done: u64, now: Instant) {
        self.latest = done;

        let Some((base_bytes, base_at)) = self.boundary else {
            self.boundary = Some((done, now));
            return;
        };

        let elapsed = now.saturating_duration_since(base_at);
        if elapsed < self.sample_interval || elapsed.is_zero() {
            return;
        }

        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(SpeedSample {
            bytes_delta: done.saturating_sub(base_bytes),
            time_delta: elapsed,
        });
        self.boundary = Some((done, now));
    }

    /// Mean of the retained samples in bytes/sec, `None` before the first sample
    pub fn average_speed(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(SpeedSample::rate).sum();
        Some(sum / self.samples.len() as f64)
    }

    /// Seconds until `total` is reached from `done`
    ///
    /// `None` while the average speed is unknown or zero.
    pub fn estimated_seconds_remaining(&self, total: u64, done: u64) -> Option<f64> {
        let speed = self.average_speed()?;
        if speed <= 0.0 {
            return None;
        }
        Some(total.saturating_sub(done) as f64 / speed)
    }

    /// Most recent byte offset passed to [`update_at`](Self::update_at)
    pub fn latest(&self) -> u64 {
        self.latest
    }

    /// Retained samples, oldest first
    pub fn samples(&self) -> impl Iterator<Item = &SpeedSample> {
        self.samples.iter()
    }

    /// Forget all samples and offsets
    pub fn reset(&mut self) {
        self.samples.clear();
        self.boundary = None;
        self.latest = 0;
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), 10)
    }
}
