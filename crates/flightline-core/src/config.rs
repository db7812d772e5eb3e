//! Session configuration
//!
//! Every section deserializes with defaults for missing keys, so a config
//! file only has to name what it changes. Durations are integer milliseconds
//! on the wire.

use crate::error::{FlightError, Result};
use flightline_files::{
    BufferTier, DEFAULT_CHUNK_SIZE, DEFAULT_DURABLE_THRESHOLD, TierPolicy, durable_storage_available,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Session configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    /// Outbound transfer configuration
    pub transfer: TransferConfig,

    /// Inbound buffer configuration
    pub buffer: BufferConfig,

    /// Signaling reconnect configuration
    pub reconnect: ReconnectConfig,

    /// Inbound batch configuration
    pub receive: ReceiveConfig,

    /// Speed estimation configuration
    pub speed: SpeedConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl FlightConfig {
    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `FlightError::InvalidConfig` naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(FlightError::invalid_config("transfer.chunk_size must be > 0"));
        }
        if self.transfer.high_water_mark == 0 {
            return Err(FlightError::invalid_config(
                "transfer.high_water_mark must be > 0",
            ));
        }
        if self.transfer.chunk_size > self.transfer.high_water_mark {
            return Err(FlightError::invalid_config(
                "transfer.chunk_size must not exceed transfer.high_water_mark",
            ));
        }
        if self.transfer.max_pending_chunks == 0 {
            return Err(FlightError::invalid_config(
                "transfer.max_pending_chunks must be > 0",
            ));
        }
        if self.speed.window == 0 {
            return Err(FlightError::invalid_config("speed.window must be > 0"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(FlightError::invalid_config(
                "reconnect.max_attempts must be > 0",
            ));
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(FlightError::invalid_config(
                "reconnect.base_delay must not exceed reconnect.max_delay",
            ));
        }
        Ok(())
    }
}

/// Outbound transfer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per chunk message
    pub chunk_size: usize,

    /// Buffered-amount level at which draining stops
    pub high_water_mark: usize,

    /// Chunks the sender holds before it stops pulling from the reader task
    pub max_pending_chunks: usize,

    /// Minimum spacing between progress events
    #[serde(with = "duration_ms")]
    pub progress_interval: Duration,
}

impl TransferConfig {
    /// Buffered-amount level at which draining resumes
    #[must_use]
    pub fn low_water_mark(&self) -> usize {
        self.high_water_mark / 2
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            high_water_mark: 1024 * 1024, // 1 MiB
            max_pending_chunks: 32,
            progress_interval: Duration::from_millis(200),
        }
    }
}

/// Inbound buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Allow the durable tier
    pub durable_enabled: bool,

    /// Size at or above which inbound files are buffered durably
    pub durable_threshold: u64,

    /// Directory holding durable buffers
    pub durable_dir: PathBuf,
}

impl BufferConfig {
    /// Tier policy given the startup capability probe result
    #[must_use]
    pub fn policy(&self, durable_available: bool) -> TierPolicy {
        TierPolicy {
            durable_enabled: self.durable_enabled,
            durable_threshold: self.durable_threshold,
            durable_available,
        }
    }

    /// Probe durable storage once and build the inbound buffer tier
    pub fn open_tier(&self) -> BufferTier {
        let available = self.durable_enabled && durable_storage_available(&self.durable_dir);
        BufferTier::new(self.policy(available), self.durable_dir.clone())
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            durable_enabled: true,
            durable_threshold: DEFAULT_DURABLE_THRESHOLD,
            durable_dir: std::env::temp_dir().join("flightline-buffer"),
        }
    }
}

/// Signaling reconnect configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    /// Upper bound on any single delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Attempts before the session is declared lost
    pub max_attempts: u32,

    /// Added to the relay-announced peer grace period before local expiry
    #[serde(with = "duration_ms")]
    pub grace_slack: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            grace_slack: Duration::from_secs(5),
        }
    }
}

/// Inbound batch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Silence after the last completed file before a batch is reported done
    #[serde(with = "duration_ms")]
    pub batch_quiet_period: Duration,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            batch_quiet_period: Duration::from_millis(1500),
        }
    }
}

/// Speed estimation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    /// Minimum wall-clock spacing between samples
    #[serde(with = "duration_ms")]
    pub sample_interval: Duration,

    /// Samples retained for the moving average
    pub window: usize,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(500),
            window: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Serialize a `Duration` as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
