//! Error types for wire format operations.

use std::fmt;

use octets::OctetError;

use crate::command::CommandKind;

/// Result type for wire format operations.
pub type WireResult<T> = Result<T, DecodeError>;

/// Decode errors for datagram framing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    /// Datagram is too small to contain the required header.
    DatagramTooSmall { actual: usize, required: usize },

    /// Unsupported protocol version.
    UnsupportedVersion { found: u8 },

    /// Header declares no commands.
    EmptyDatagram,

    /// Unknown command kind byte.
    UnknownCommand { kind: u8 },

    /// Flags are not valid for the command kind.
    InvalidFlags { kind: CommandKind, flags: u8 },

    /// Command addressed to a channel it may not use.
    InvalidChannel { kind: CommandKind, channel: u8 },

    /// Fragment fields are inconsistent with each other.
    InvalidFragment {
        fragment_number: u32,
        fragment_count: u32,
        fragment_offset: u32,
        total_length: u32,
    },

    /// Input ended in the middle of a command.
    Truncated { needed: usize, available: usize },

    /// Bytes left over after the declared commands.
    TrailingBytes { count: usize },

    /// Limits exceeded.
    LimitsExceeded {
        kind: LimitKind,
        limit: usize,
        actual: usize,
    },
}

/// Specific wire limits that can be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    DatagramBytes,
    CommandCount,
    PayloadLength,
    FragmentCount,
    MessageLength,
}

/// Errors that can occur during encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    BufferTooSmall { needed: usize, available: usize },
    LengthOverflow { length: usize },
}

impl From<OctetError> for DecodeError {
    fn from(err: OctetError) -> Self {
        match err {
            OctetError::UnexpectedEof {
                requested,
                available,
            }
            | OctetError::BufferTooSmall {
                needed: requested,
                available,
            } => Self::Truncated {
                needed: requested,
                available,
            },
        }
    }
}

impl From<OctetError> for EncodeError {
    fn from(err: OctetError) -> Self {
        match err {
            OctetError::BufferTooSmall { needed, available }
            | OctetError::UnexpectedEof {
                requested: needed,
                available,
            } => Self::BufferTooSmall { needed, available },
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DatagramTooSmall { actual, required } => {
                write!(
                    f,
                    "datagram too small: {actual} bytes, need at least {required}"
                )
            }
            Self::UnsupportedVersion { found } => {
                write!(f, "unsupported protocol version: {found}")
            }
            Self::EmptyDatagram => write!(f, "datagram carries no commands"),
            Self::UnknownCommand { kind } => write!(f, "unknown command kind: {kind}"),
            Self::InvalidFlags { kind, flags } => {
                write!(f, "invalid flags 0x{flags:02X} for {kind:?}")
            }
            Self::InvalidChannel { kind, channel } => {
                write!(f, "{kind:?} not allowed on channel {channel}")
            }
            Self::InvalidFragment {
                fragment_number,
                fragment_count,
                fragment_offset,
                total_length,
            } => {
                write!(
                    f,
                    "invalid fragment {fragment_number}/{fragment_count} at offset {fragment_offset} of {total_length}"
                )
            }
            Self::Truncated { needed, available } => {
                write!(f, "truncated command: need {needed} bytes, have {available}")
            }
            Self::TrailingBytes { count } => {
                write!(f, "{count} trailing bytes after last command")
            }
            Self::LimitsExceeded {
                kind,
                limit,
                actual,
            } => {
                write!(f, "{kind} limit exceeded: {actual} > {limit}")
            }
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DatagramBytes => "datagram bytes",
            Self::CommandCount => "command count",
            Self::PayloadLength => "payload length",
            Self::FragmentCount => "fragment count",
            Self::MessageLength => "message length",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall { needed, available } => {
                write!(f, "buffer too small: need {needed}, have {available}")
            }
            Self::LengthOverflow { length } => {
                write!(f, "length overflow: {length}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl std::error::Error for EncodeError {}
