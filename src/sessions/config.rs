//! Configuration types for Rampart Rollback sessions.
//!
//! This module contains configuration structs that control the handshake, the running protocol,
//! input queue sizing and the async transport. Every struct has a `Default` matching the values
//! used by classic GGPO-style netcode and a few named presets.
//!
//! # Overview
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `SyncConfig` | Sync handshake behavior | `lan()`, `high_latency()`, `lossy()` |
//! | `ProtocolConfig` | Running protocol timers and limits | `competitive()`, `deterministic()` |
//! | `InputQueueConfig` | Input queue sizing | `high_latency()`, `minimal()` |
//! | `TransportConfig` | Tokio transport queues and jitter | `with_jitter()` |
//! | `SessionConfig` | Everything above plus the session shape | `new()` |
//!
//! All configs derive `serde::{Serialize, Deserialize}`, so they can be loaded from whatever
//! format the application already uses.
//!
//! # Example
//!
//! ```
//! use rampart_rollback::{ProtocolConfig, SessionConfig, SyncConfig};
//!
//! let config = SessionConfig {
//!     num_players: 2,
//!     input_size: 2,
//!     sync: SyncConfig::lan(),
//!     protocol: ProtocolConfig::competitive(),
//!     ..SessionConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use web_time::Duration;

use crate::frame_info::{MAX_INPUT_BYTES, MAX_PLAYERS};
use crate::input_queue::INPUT_QUEUE_LENGTH;
use crate::time_sync::TimeSyncConfig;
use crate::RampartError;

fn out_of_range(field: &str, min: u64, max: u64, actual: u64) -> RampartError {
    RampartError::InvalidRequest {
        info: format!(
            "{} must be between {} and {}, got {}",
            field, min, max, actual
        ),
    }
}

fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<(), RampartError> {
    if value < min || value > max {
        return Err(out_of_range(field, min, max, value));
    }
    Ok(())
}

fn check_duration(
    field: &str,
    value: Duration,
    min_ms: u64,
    max_ms: u64,
) -> Result<(), RampartError> {
    check_range(field, value.as_millis() as u64, min_ms, max_ms)
}

/// Configuration for the synchronization handshake.
///
/// A peer is considered synchronized after `num_sync_packets` request/reply roundtrips. The
/// first request is retried quickly, later ones more slowly so that a peer which is simply not
/// up yet is not flooded.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Always construct it with the
/// `..SyncConfig::default()` pattern.
///
/// # Example
///
/// ```
/// use rampart_rollback::SyncConfig;
/// use web_time::Duration;
///
/// // Give up after 20 unanswered requests
/// let config = SyncConfig {
///     max_sync_retries: Some(20),
///     ..SyncConfig::default()
/// };
/// assert_eq!(config.first_retry_interval, Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[must_use = "SyncConfig has no effect unless passed to a session"]
pub struct SyncConfig {
    /// Number of successful sync roundtrips required before the peer is considered
    /// synchronized.
    ///
    /// Default: 5
    pub num_sync_packets: u32,

    /// Retry interval while no reply at all has arrived.
    ///
    /// Default: 500ms
    pub first_retry_interval: Duration,

    /// Retry interval once the peer has answered at least once.
    ///
    /// Default: 2000ms
    pub retry_interval: Duration,

    /// Number of unanswered retries after which the handshake is abandoned with a
    /// `SyncFailed` event.
    ///
    /// Default: `None` (retry forever)
    pub max_sync_retries: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_sync_packets: 5,
            first_retry_interval: Duration::from_millis(500),
            retry_interval: Duration::from_millis(2000),
            max_sync_retries: None,
        }
    }
}

impl SyncConfig {
    /// Creates a new `SyncConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for local networks.
    ///
    /// Fewer roundtrips and short retries: a LAN peer either answers at once or is not there.
    pub fn lan() -> Self {
        Self {
            num_sync_packets: 3,
            first_retry_interval: Duration::from_millis(100),
            retry_interval: Duration::from_millis(500),
            max_sync_retries: None,
        }
    }

    /// Configuration preset for high-latency networks (100-200ms RTT).
    pub fn high_latency() -> Self {
        Self {
            num_sync_packets: 5,
            first_retry_interval: Duration::from_millis(1000),
            retry_interval: Duration::from_millis(3000),
            max_sync_retries: None,
        }
    }

    /// Configuration preset for lossy networks.
    ///
    /// More roundtrips so a lucky run of packets does not declare the link healthy.
    pub fn lossy() -> Self {
        Self {
            num_sync_packets: 8,
            ..Self::default()
        }
    }

    /// Validates the handshake configuration.
    pub fn validate(&self) -> Result<(), RampartError> {
        check_range("num_sync_packets", u64::from(self.num_sync_packets), 1, 100)?;
        check_duration("first_retry_interval", self.first_retry_interval, 1, 60_000)?;
        check_duration("retry_interval", self.retry_interval, 1, 60_000)?;
        if let Some(retries) = self.max_sync_retries {
            check_range("max_sync_retries", u64::from(retries), 1, 10_000)?;
        }
        Ok(())
    }
}

/// Configuration for a running peer protocol.
///
/// # Example
///
/// ```
/// use rampart_rollback::ProtocolConfig;
/// use web_time::Duration;
///
/// let config = ProtocolConfig {
///     quality_report_interval: Duration::from_millis(500),
///     ..ProtocolConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[must_use = "ProtocolConfig has no effect unless passed to a session"]
pub struct ProtocolConfig {
    /// Interval between quality reports, which measure round-trip time and exchange frame
    /// advantage.
    ///
    /// Default: 1000ms
    pub quality_report_interval: Duration,

    /// Interval after which unacknowledged inputs are sent again.
    ///
    /// Default: 200ms
    pub running_retry_interval: Duration,

    /// A keepalive is sent when nothing else was sent for this long.
    ///
    /// Default: 200ms
    pub keepalive_interval: Duration,

    /// Interval between bandwidth statistics refreshes.
    ///
    /// Default: 1000ms
    pub network_stats_interval: Duration,

    /// Maximum number of unacknowledged inputs. Exceeding it disconnects the peer.
    ///
    /// Default: 128
    pub pending_output_limit: usize,

    /// Messages whose sequence number is further ahead than this are treated as stale and
    /// dropped.
    ///
    /// Default: 32768
    pub max_sequence_distance: u16,

    /// Simulation rate used to convert round-trip time into frames.
    ///
    /// Default: 60
    pub fps: usize,

    /// Optional seed for the protocol RNG (magic numbers and handshake nonces).
    ///
    /// Default: `None` (seeded from entropy)
    pub protocol_rng_seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(1000),
            running_retry_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(200),
            network_stats_interval: Duration::from_millis(1000),
            pending_output_limit: 128,
            max_sequence_distance: 1 << 15,
            fps: 60,
            protocol_rng_seed: None,
        }
    }
}

impl ProtocolConfig {
    /// Creates a new `ProtocolConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Faster quality reports and input resends, for latency-sensitive games.
    pub fn competitive() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(250),
            running_retry_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Slower timers for links with long round trips.
    pub fn high_latency() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(2000),
            running_retry_interval: Duration::from_millis(400),
            keepalive_interval: Duration::from_millis(400),
            pending_output_limit: 256,
            ..Self::default()
        }
    }

    /// Default timers with a fixed RNG seed, for reproducible tests and replays.
    ///
    /// ```
    /// use rampart_rollback::ProtocolConfig;
    ///
    /// let config = ProtocolConfig::deterministic(42);
    /// assert_eq!(config.protocol_rng_seed, Some(42));
    /// ```
    pub fn deterministic(seed: u64) -> Self {
        Self {
            protocol_rng_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Validates the protocol configuration.
    pub fn validate(&self) -> Result<(), RampartError> {
        check_duration(
            "quality_report_interval",
            self.quality_report_interval,
            1,
            10_000,
        )?;
        check_duration(
            "running_retry_interval",
            self.running_retry_interval,
            1,
            10_000,
        )?;
        check_duration("keepalive_interval", self.keepalive_interval, 1, 10_000)?;
        check_duration(
            "network_stats_interval",
            self.network_stats_interval,
            1,
            60_000,
        )?;
        check_range(
            "pending_output_limit",
            self.pending_output_limit as u64,
            1,
            4096,
        )?;
        check_range(
            "max_sequence_distance",
            u64::from(self.max_sequence_distance),
            1,
            u64::from(u16::MAX),
        )?;
        check_range("fps", self.fps as u64, 1, 1000)?;
        Ok(())
    }
}

/// Configuration for input queue sizing.
///
/// # Example
///
/// ```
/// use rampart_rollback::InputQueueConfig;
///
/// // Default configuration (128 frames = ~2.1 seconds at 60 FPS)
/// let default = InputQueueConfig::default();
/// assert_eq!(default.queue_length, 128);
/// assert_eq!(default.max_frame_delay(), 127);
///
/// // For memory-constrained environments
/// let minimal = InputQueueConfig::minimal();
/// assert_eq!(minimal.queue_length, 32);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[must_use = "InputQueueConfig has no effect unless passed to a session"]
pub struct InputQueueConfig {
    /// The length of the input ring per player. Bounds the frame delay (`queue_length - 1`) and
    /// the prediction window.
    ///
    /// Default: 128
    pub queue_length: usize,
}

impl Default for InputQueueConfig {
    fn default() -> Self {
        Self {
            queue_length: INPUT_QUEUE_LENGTH,
        }
    }
}

impl InputQueueConfig {
    /// Creates a new `InputQueueConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// 256 frames, about 4.3 seconds at 60 FPS.
    pub fn high_latency() -> Self {
        Self { queue_length: 256 }
    }

    /// 32 frames, about half a second at 60 FPS.
    pub fn minimal() -> Self {
        Self { queue_length: 32 }
    }

    /// Same as the default.
    pub fn standard() -> Self {
        Self::default()
    }

    /// Returns the maximum allowed frame delay for this configuration.
    #[must_use]
    pub fn max_frame_delay(&self) -> usize {
        self.queue_length.saturating_sub(1)
    }

    /// Returns an error if `frame_delay` does not fit into the ring.
    pub fn validate_frame_delay(&self, frame_delay: usize) -> Result<(), RampartError> {
        if frame_delay >= self.queue_length {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "frame delay {} is too large; the maximum is {}",
                    frame_delay,
                    self.max_frame_delay()
                ),
            });
        }
        Ok(())
    }

    /// Validates the configuration itself.
    pub fn validate(&self) -> Result<(), RampartError> {
        if self.queue_length < 2 {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "queue_length must be at least 2, got {}",
                    self.queue_length
                ),
            });
        }
        Ok(())
    }
}

/// Configuration for the tokio transport.
///
/// # Example
///
/// ```
/// use rampart_rollback::TransportConfig;
/// use web_time::Duration;
///
/// let config = TransportConfig::with_jitter(Duration::from_millis(20), 7);
/// assert_eq!(config.jitter_seed, Some(7));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[must_use = "TransportConfig has no effect unless passed to a transport"]
pub struct TransportConfig {
    /// Outbound datagrams buffered before the oldest one is dropped.
    ///
    /// Default: 256
    pub send_queue_capacity: usize,

    /// Decoded inbound messages buffered before new ones are dropped.
    ///
    /// Default: 256
    pub recv_channel_capacity: usize,

    /// Upper bound of the uniform delay added before each outbound datagram. Zero disables it.
    ///
    /// Default: 0
    pub jitter: Duration,

    /// Seed for the jitter RNG.
    ///
    /// Default: `None` (seeded from entropy)
    pub jitter_seed: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            recv_channel_capacity: 256,
            jitter: Duration::ZERO,
            jitter_seed: None,
        }
    }
}

impl TransportConfig {
    /// Creates a new `TransportConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default queues with artificial send jitter, for exercising reordering locally.
    pub fn with_jitter(jitter: Duration, seed: u64) -> Self {
        Self {
            jitter,
            jitter_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Validates the transport configuration.
    pub fn validate(&self) -> Result<(), RampartError> {
        check_range(
            "send_queue_capacity",
            self.send_queue_capacity as u64,
            1,
            65_536,
        )?;
        check_range(
            "recv_channel_capacity",
            self.recv_channel_capacity as u64,
            1,
            65_536,
        )?;
        check_duration("jitter", self.jitter, 0, 10_000)?;
        Ok(())
    }
}

/// Full configuration of a peer-to-peer session.
///
/// # Example
///
/// ```
/// use rampart_rollback::SessionConfig;
///
/// let config = SessionConfig::new(3, 4);
/// assert_eq!(config.num_players, 3);
/// assert_eq!(config.input_size, 4);
/// assert!(config.validate().is_ok());
///
/// let broken = SessionConfig {
///     input_size: 0,
///     ..SessionConfig::default()
/// };
/// assert!(broken.validate().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[must_use = "SessionConfig has no effect unless passed to a session"]
pub struct SessionConfig {
    /// Number of players in the session, local and remote.
    ///
    /// Default: 2
    pub num_players: usize,
    /// Size in bytes of one player's input.
    ///
    /// Default: 1
    pub input_size: usize,
    /// How many frames the simulation may run ahead of confirmed input.
    ///
    /// Default: 8
    pub max_prediction: usize,
    /// Frame delay applied to local players' input.
    ///
    /// Default: 0
    pub input_delay: usize,
    /// Silence after which a peer is disconnected.
    ///
    /// Default: 5000ms
    pub disconnect_timeout: Duration,
    /// Silence after which a `NetworkInterrupted` event is emitted.
    ///
    /// Default: 750ms
    pub disconnect_notify_start: Duration,
    /// Number of frames between wait recommendations.
    ///
    /// Default: 240
    pub recommendation_interval: u32,
    /// Only recommend waiting while local input is idle.
    ///
    /// Default: false
    pub require_idle_input: bool,
    pub sync: SyncConfig,
    pub protocol: ProtocolConfig,
    pub time_sync: TimeSyncConfig,
    pub input_queue: InputQueueConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_players: 2,
            input_size: 1,
            max_prediction: 8,
            input_delay: 0,
            disconnect_timeout: Duration::from_millis(5000),
            disconnect_notify_start: Duration::from_millis(750),
            recommendation_interval: 240,
            require_idle_input: false,
            sync: SyncConfig::default(),
            protocol: ProtocolConfig::default(),
            time_sync: TimeSyncConfig::default(),
            input_queue: InputQueueConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Default configuration for `num_players` players with `input_size`-byte inputs.
    pub fn new(num_players: usize, input_size: usize) -> Self {
        Self {
            num_players,
            input_size,
            ..Self::default()
        }
    }

    /// Validates this configuration and every nested one.
    pub fn validate(&self) -> Result<(), RampartError> {
        check_range("num_players", self.num_players as u64, 1, MAX_PLAYERS as u64)?;
        check_range(
            "input_size",
            self.input_size as u64,
            1,
            MAX_INPUT_BYTES as u64,
        )?;
        self.input_queue.validate()?;
        check_range(
            "max_prediction",
            self.max_prediction as u64,
            1,
            self.input_queue.max_frame_delay() as u64,
        )?;
        self.input_queue.validate_frame_delay(self.input_delay)?;
        check_duration("disconnect_timeout", self.disconnect_timeout, 1, 600_000)?;
        if self.disconnect_notify_start > self.disconnect_timeout {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "disconnect_notify_start ({:?}) must not exceed disconnect_timeout ({:?})",
                    self.disconnect_notify_start, self.disconnect_timeout
                ),
            });
        }
        check_range(
            "recommendation_interval",
            u64::from(self.recommendation_interval),
            1,
            100_000,
        )?;
        self.sync.validate()?;
        self.protocol.validate()?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.num_sync_packets, 5);
        assert_eq!(config.first_retry_interval, Duration::from_millis(500));
        assert_eq!(config.retry_interval, Duration::from_millis(2000));
        assert_eq!(config.max_sync_retries, None);
        assert_eq!(SyncConfig::new(), config);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sync_presets_are_valid() {
        for config in [SyncConfig::lan(), SyncConfig::high_latency(), SyncConfig::lossy()] {
            assert!(config.validate().is_ok(), "{:?}", config);
        }
        assert_eq!(SyncConfig::lossy().num_sync_packets, 8);
    }

    #[test]
    fn test_sync_config_rejects_zero_packets() {
        let config = SyncConfig {
            num_sync_packets: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RampartError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_protocol_config_defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.quality_report_interval, Duration::from_millis(1000));
        assert_eq!(config.running_retry_interval, Duration::from_millis(200));
        assert_eq!(config.keepalive_interval, Duration::from_millis(200));
        assert_eq!(config.pending_output_limit, 128);
        assert_eq!(config.max_sequence_distance, 1 << 15);
        assert_eq!(config.fps, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_protocol_presets_are_valid() {
        for config in [
            ProtocolConfig::competitive(),
            ProtocolConfig::high_latency(),
            ProtocolConfig::deterministic(9),
        ] {
            assert!(config.validate().is_ok(), "{:?}", config);
        }
    }

    #[test]
    fn test_protocol_config_rejects_zero_fps() {
        let config = ProtocolConfig {
            fps: 0,
            ..ProtocolConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fps"));
    }

    #[test]
    fn test_input_queue_config() {
        assert_eq!(InputQueueConfig::high_latency().queue_length, 256);
        assert_eq!(InputQueueConfig::standard(), InputQueueConfig::default());
        assert!(InputQueueConfig { queue_length: 1 }.validate().is_err());
        let config = InputQueueConfig::minimal();
        assert!(config.validate_frame_delay(31).is_ok());
        assert!(config.validate_frame_delay(32).is_err());
    }

    #[test]
    fn test_transport_config() {
        let config = TransportConfig::default();
        assert_eq!(config.jitter, Duration::ZERO);
        assert!(config.validate().is_ok());
        assert!(TransportConfig {
            send_queue_capacity: 0,
            ..config
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_session_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(SessionConfig::new(MAX_PLAYERS + 1, 1).validate().is_err());
        assert!(SessionConfig::new(2, MAX_INPUT_BYTES + 1).validate().is_err());

        let too_much_prediction = SessionConfig {
            max_prediction: INPUT_QUEUE_LENGTH,
            ..SessionConfig::default()
        };
        assert!(too_much_prediction.validate().is_err());

        let notify_after_timeout = SessionConfig {
            disconnect_notify_start: Duration::from_secs(10),
            ..SessionConfig::default()
        };
        assert!(notify_after_timeout.validate().is_err());
    }

    #[test]
    fn test_nested_config_errors_propagate() {
        let config = SessionConfig {
            protocol: ProtocolConfig {
                pending_output_limit: 0,
                ..ProtocolConfig::default()
            },
            ..SessionConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pending_output_limit"));
    }
}
