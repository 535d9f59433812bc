//! Transport configuration.
//!
//! One [`TransportConfig`] parameterizes both halves of a link endpoint. The
//! timing knobs can also be changed at runtime through the setters on
//! [`Tx`](super::Tx) and [`Rx`](super::Rx).
//!
//! # Example
//!
//! ```
//! use ble_reliable_link::transport::TransportConfig;
//! use std::time::Duration;
//!
//! let config = TransportConfig::ble_default()
//!     .with_mtu(185)
//!     .with_message_timeout(Duration::from_millis(800));
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_payload(), 183);
//! ```

use crate::ble::{DEFAULT_MAX_HELD, HEADER_SIZE, SEQNUM_RANGE};
use std::time::Duration;

/// Default BLE ATT MTU before negotiation.
pub const DEFAULT_MTU: usize = 20;

/// Largest ATT MTU a BLE connection can negotiate.
pub const MAX_MTU: usize = 512;

/// Upper bound on retained fragments: half the sequence space.
pub const MAX_RETRANSMIT_HISTORY: usize = (SEQNUM_RANGE / 2) as usize;

/// Configuration for a transport endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum packet size on the link, header included.
    pub mtu: usize,

    /// Largest message the receiver will reassemble, in bytes.
    pub assembly_capacity: usize,

    /// Out-of-order fragments held while waiting for a gap to close.
    pub max_held_fragments: usize,

    /// Sent fragments retained to answer NACKs.
    pub retransmit_history: usize,

    /// Time to wait for an ACK_REPLY before retrying a reliable send.
    pub message_timeout: Duration,

    /// Retries of a reliable send after the first attempt.
    pub max_ack_retries: u32,

    /// Pacing interval between packets. Zero sends immediately.
    pub connection_interval: Duration,

    /// Delay before the first NACK for a gap, and between repeated NACKs.
    pub nack_gap_timeout: Duration,

    /// Ceiling on a gap episode before the partial message is abandoned.
    /// Also the silence after which a stalled message is NACKed.
    pub nak_timeout: Duration,

    /// Emit NACKs for missing fragments.
    pub nacks_enabled: bool,

    /// Timeout passed to every `QueueSink::queue_write`.
    pub queue_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            assembly_capacity: 16 * 1024,
            max_held_fragments: DEFAULT_MAX_HELD,
            retransmit_history: 128,
            message_timeout: Duration::from_millis(2000),
            max_ack_retries: 3,
            connection_interval: Duration::ZERO,
            nack_gap_timeout: Duration::from_millis(100),
            nak_timeout: Duration::from_millis(1000),
            nacks_enabled: true,
            queue_timeout: Duration::from_millis(50),
        }
    }
}

impl TransportConfig {
    /// Settings for a real BLE connection: default MTU, paced at the
    /// minimum 7.5 ms connection interval.
    pub fn ble_default() -> Self {
        Self {
            connection_interval: Duration::from_micros(7500),
            ..Default::default()
        }
    }

    /// Settings for the simulator: a negotiated 185 byte MTU, unpaced, with
    /// a generous retry budget.
    pub fn simulation() -> Self {
        Self {
            mtu: 185,
            connection_interval: Duration::ZERO,
            max_ack_retries: 50,
            message_timeout: Duration::from_millis(1500),
            ..Default::default()
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_assembly_capacity(mut self, capacity: usize) -> Self {
        self.assembly_capacity = capacity;
        self
    }

    pub fn with_max_held_fragments(mut self, max_held: usize) -> Self {
        self.max_held_fragments = max_held;
        self
    }

    pub fn with_retransmit_history(mut self, history: usize) -> Self {
        self.retransmit_history = history;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_max_ack_retries(mut self, retries: u32) -> Self {
        self.max_ack_retries = retries;
        self
    }

    pub fn with_connection_interval(mut self, interval: Duration) -> Self {
        self.connection_interval = interval;
        self
    }

    pub fn with_nack_gap_timeout(mut self, timeout: Duration) -> Self {
        self.nack_gap_timeout = timeout;
        self
    }

    pub fn with_nak_timeout(mut self, timeout: Duration) -> Self {
        self.nak_timeout = timeout;
        self
    }

    pub fn with_nacks(mut self, enabled: bool) -> Self {
        self.nacks_enabled = enabled;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Payload bytes per fragment.
    pub fn max_payload(&self) -> usize {
        self.mtu.saturating_sub(HEADER_SIZE)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu <= HEADER_SIZE {
            return Err(ConfigError::InvalidConfig("mtu must be > header size"));
        }
        if self.mtu > MAX_MTU {
            return Err(ConfigError::InvalidConfig("mtu must be <= 512"));
        }
        if self.assembly_capacity == 0 {
            return Err(ConfigError::InvalidConfig("assembly_capacity must be > 0"));
        }
        if self.max_held_fragments == 0 {
            return Err(ConfigError::InvalidConfig("max_held_fragments must be > 0"));
        }
        // Older fragments would alias sequence numbers still in flight
        if self.retransmit_history == 0 || self.retransmit_history > MAX_RETRANSMIT_HISTORY {
            return Err(ConfigError::InvalidConfig(
                "retransmit_history must be in 1..=128",
            ));
        }
        if self.message_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig("message_timeout must be > 0"));
        }
        if self.nack_gap_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig("nack_gap_timeout must be > 0"));
        }
        if self.nak_timeout < self.nack_gap_timeout {
            return Err(ConfigError::InvalidConfig(
                "nak_timeout must be >= nack_gap_timeout",
            ));
        }
        Ok(())
    }
}

/// Errors that can occur while configuring a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration parameter.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid transport config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.max_payload(), 18);
        assert_eq!(config.nack_gap_timeout, Duration::from_millis(100));
        assert_eq!(config.nak_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_presets_valid() {
        assert!(TransportConfig::ble_default().validate().is_ok());
        assert!(TransportConfig::simulation().validate().is_ok());
        assert!(TransportConfig::simulation().connection_interval.is_zero());
        assert!(!TransportConfig::ble_default().connection_interval.is_zero());
    }

    #[test]
    fn test_builder_setters() {
        let config = TransportConfig::default()
            .with_mtu(8)
            .with_max_ack_retries(7)
            .with_nacks(false)
            .with_nack_gap_timeout(Duration::from_millis(30))
            .with_nak_timeout(Duration::from_millis(300));
        assert_eq!(config.mtu, 8);
        assert_eq!(config.max_payload(), 6);
        assert_eq!(config.max_ack_retries, 7);
        assert!(!config.nacks_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_mtu() {
        let config = TransportConfig::default().with_mtu(2);
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidConfig("mtu must be > header size"))
        );
        assert!(TransportConfig::default().with_mtu(513).validate().is_err());
        assert_eq!(TransportConfig::default().with_mtu(1).max_payload(), 0);
    }

    #[test]
    fn test_invalid_timeouts() {
        let config = TransportConfig::default().with_message_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = TransportConfig::default()
            .with_nack_gap_timeout(Duration::from_millis(500))
            .with_nak_timeout(Duration::from_millis(100));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_history() {
        assert!(TransportConfig::default()
            .with_retransmit_history(0)
            .validate()
            .is_err());
        assert!(TransportConfig::default()
            .with_retransmit_history(129)
            .validate()
            .is_err());
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::InvalidConfig("test message");
        assert_eq!(err.to_string(), "invalid transport config: test message");
    }
}
