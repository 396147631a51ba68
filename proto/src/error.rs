//! Errors returned by the host API.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::peer::PeerHandle;

/// Errors returned synchronously by [`Host`](crate::Host) operations.
///
/// Protocol violations by the remote never surface here; offending datagrams
/// are dropped and logged.
#[derive(Debug, Error)]
pub enum HostError {
    /// The handle refers to a released slot or an earlier connection.
    #[error("peer {0:?} is no longer valid")]
    StalePeer(PeerHandle),
    #[error("peer {0:?} is not connected")]
    NotConnected(PeerHandle),
    #[error("channel {channel} out of range for {count} channels")]
    InvalidChannel { channel: u8, count: u8 },
    #[error("channel count {requested} must be between 1 and {limit}")]
    InvalidChannelCount { requested: u8, limit: u8 },
    #[error("all {capacity} peer slots are in use")]
    ResourceExhausted { capacity: usize },
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("command encoding failed: {0}")]
    Encode(#[from] wire::EncodeError),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

pub type HostResult<T> = Result<T, HostError>;
