//! File transfer progress tracking
//!
//! Snapshots handed to the presentation layer, and the throttle that keeps
//! them to a fixed cadence instead of one per chunk.

use crate::identity::TransferId;
use crate::speed::SpeedEstimator;
use std::time::{Duration, Instant};

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local file going to the peer
    Send,
    /// Peer file arriving locally
    Receive,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// Detailed transfer progress information
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Transfer ID
    pub transfer_id: TransferId,

    /// File name
    pub name: String,

    /// Direction
    pub direction: Direction,

    /// Bytes transferred so far
    pub bytes_done: u64,

    /// Total bytes announced in the metadata
    pub bytes_total: u64,

    /// Moving-average speed in bytes/second, `None` while unknown
    pub speed_bytes_per_sec: Option<f64>,

    /// Estimated time remaining
    pub eta: Option<Duration>,

    /// Progress percentage (0.0 to 100.0)
    pub progress_percent: f64,
}

impl TransferProgress {
    /// Build a snapshot from the current estimator state
    pub fn snapshot(
        transfer_id: TransferId,
        name: &str,
        direction: Direction,
        bytes_done: u64,
        bytes_total: u64,
        speed: &SpeedEstimator,
    ) -> Self {
        let progress_percent = if bytes_total > 0 {
            (bytes_done as f64 / bytes_total as f64 * 100.0).min(100.0)
        } else {
            100.0
        };

        let eta = speed
            .estimated_seconds_remaining(bytes_total, bytes_done)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

        Self {
            transfer_id,
            name: name.to_string(),
            direction,
            bytes_done,
            bytes_total,
            speed_bytes_per_sec: speed.average_speed(),
            eta,
            progress_percent,
        }
    }

    /// Check if every announced byte has moved
    pub fn is_complete(&self) -> bool {
        self.bytes_done >= self.bytes_total
    }

    /// Get human-readable ETA string
    pub fn eta_string(&self) -> String {
        match self.eta {
            Some(duration) => {
                let seconds = duration.as_secs();
                if seconds < 60 {
                    format!("{seconds}s")
                } else if seconds < 3600 {
                    format!("{}m {}s", seconds / 60, seconds % 60)
                } else {
                    format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
                }
            }
            None => {
                if self.is_complete() {
                    "Complete".to_string()
                } else {
                    "Calculating...".to_string()
                }
            }
        }
    }

    /// Get human-readable speed string
    pub fn speed_string(&self) -> String {
        let Some(speed) = self.speed_bytes_per_sec else {
            return "-".to_string();
        };
        if speed < 1024.0 {
            format!("{speed:.2} B/s")
        } else if speed < 1024.0 * 1024.0 {
            format!("{:.2} KiB/s", speed / 1024.0)
        } else if speed < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MiB/s", speed / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GiB/s", speed / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// Rate limit for progress events
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    /// Allow one emission per `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns true (and records the emission) if enough time has passed
    pub fn ready_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Forget the last emission
    pub fn reset(&mut self) {
        self.last = None;
    }
}
