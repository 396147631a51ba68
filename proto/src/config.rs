//! Host configuration.

use thiserror::Error;
use wire::{Limits, DEFAULT_MTU, MAX_CHANNEL_COUNT, MAX_MTU, MAX_PEER_ID, MIN_MTU};

use crate::fragment::MAX_FRAGMENT_COUNT;

/// Tunables for a [`Host`](crate::Host).
///
/// Times are in milliseconds, bandwidths in bytes per second with `0`
/// meaning unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct HostConfig {
    /// Number of peer slots.
    pub max_peers: usize,
    /// Most channels a connection may negotiate.
    pub channel_limit: u8,
    /// Largest datagram this host sends.
    pub mtu: u16,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    /// Idle connected peers are pinged this often.
    pub ping_interval_ms: u32,
    /// A peer whose oldest unacknowledged command is this old fails once
    /// the command also exhausted `max_retransmits`.
    pub timeout_minimum_ms: u32,
    /// A peer whose oldest unacknowledged command is this old fails.
    pub timeout_maximum_ms: u32,
    pub max_retransmits: u32,
    pub throttle_interval_ms: u32,
    pub throttle_acceleration: u32,
    pub throttle_deceleration: u32,
    /// Largest payload accepted by `send` and by reassembly.
    pub max_payload_bytes: usize,
    /// Concurrent partially reassembled messages per peer.
    pub max_fragment_sets_per_peer: usize,
    /// Seed for connect ids; `None` draws from the OS.
    pub seed: Option<u64>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_peers: 64,
            channel_limit: MAX_CHANNEL_COUNT,
            mtu: DEFAULT_MTU,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            ping_interval_ms: 500,
            timeout_minimum_ms: 5_000,
            timeout_maximum_ms: 30_000,
            max_retransmits: 5,
            throttle_interval_ms: 5_000,
            throttle_acceleration: 2,
            throttle_deceleration: 2,
            max_payload_bytes: 16 * 1024 * 1024,
            max_fragment_sets_per_peer: 32,
            seed: None,
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_peers must be between 1 and {max}, got {value}")]
    MaxPeers { value: usize, max: usize },
    #[error("channel_limit must be at least 1")]
    ChannelLimit,
    #[error("mtu must be between {MIN_MTU} and {MAX_MTU}, got {0}")]
    Mtu(u16),
    #[error("timeout_minimum_ms ({minimum}) must be non-zero and not exceed timeout_maximum_ms ({maximum})")]
    Timeouts { minimum: u32, maximum: u32 },
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("max_payload_bytes {value} exceeds {max}")]
    MaxPayload { value: usize, max: usize },
}

impl HostConfig {
    /// Small, deterministic configuration for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_peers: 8,
            channel_limit: 8,
            mtu: MIN_MTU,
            max_payload_bytes: 256 * 1024,
            seed: Some(0x5EED),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_peers = usize::from(MAX_PEER_ID) + 1;
        if self.max_peers == 0 || self.max_peers > max_peers {
            return Err(ConfigError::MaxPeers {
                value: self.max_peers,
                max: max_peers,
            });
        }
        if self.channel_limit == 0 {
            return Err(ConfigError::ChannelLimit);
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::Mtu(self.mtu));
        }
        if self.timeout_minimum_ms == 0 || self.timeout_minimum_ms > self.timeout_maximum_ms {
            return Err(ConfigError::Timeouts {
                minimum: self.timeout_minimum_ms,
                maximum: self.timeout_maximum_ms,
            });
        }
        for (name, value) in [
            ("ping_interval_ms", self.ping_interval_ms),
            ("throttle_interval_ms", self.throttle_interval_ms),
            ("max_retransmits", self.max_retransmits),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.max_fragment_sets_per_peer == 0 {
            return Err(ConfigError::Zero("max_fragment_sets_per_peer"));
        }
        let max_payload = max_message_len();
        if self.max_payload_bytes == 0 || self.max_payload_bytes > max_payload {
            return Err(ConfigError::MaxPayload {
                value: self.max_payload_bytes,
                max: max_payload,
            });
        }
        Ok(())
    }

    /// Limits applied to every inbound datagram.
    pub(crate) fn wire_limits(&self) -> Limits {
        Limits {
            max_datagram_bytes: usize::from(MAX_MTU),
            max_commands: wire::MAX_COMMANDS_PER_DATAGRAM,
            max_payload_len: usize::from(MAX_MTU),
            max_fragment_count: MAX_FRAGMENT_COUNT,
            max_message_len: self.max_payload_bytes,
        }
    }
}

/// Largest message that still fits the fragment sequence space at the
/// smallest MTU a peer can negotiate.
const fn max_message_len() -> usize {
    wire::max_fragment_payload(MIN_MTU) * MAX_FRAGMENT_COUNT as usize
}
