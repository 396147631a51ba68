//! Configurable limits for bounded decoding.

use crate::header::{MAX_COMMANDS_PER_DATAGRAM, MAX_MTU};

/// Wire-level limits for datagram decoding.
///
/// These limits are enforced during decoding to prevent resource exhaustion
/// and ensure bounded memory usage. Reassembly bookkeeping belongs to the
/// engine; this only bounds what a single datagram may claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum datagram size in bytes.
    pub max_datagram_bytes: usize,

    /// Maximum number of commands in one datagram.
    pub max_commands: usize,

    /// Maximum payload carried by a single command.
    pub max_payload_len: usize,

    /// Maximum number of fragments a message may be split into.
    pub max_fragment_count: u32,

    /// Maximum reassembled message length.
    pub max_message_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_datagram_bytes: usize::from(MAX_MTU),
            max_commands: MAX_COMMANDS_PER_DATAGRAM,
            max_payload_len: usize::from(MAX_MTU),

            // 1M fragments and 32 MiB messages
            max_fragment_count: 1024 * 1024,
            max_message_len: 32 * 1024 * 1024,
        }
    }
}

impl Limits {
    /// Creates limits suitable for testing with smaller values.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_datagram_bytes: 1400,
            max_commands: 8,
            max_payload_len: 1024,
            max_fragment_count: 64,
            max_message_len: 64 * 1024,
        }
    }

    /// Creates limits with no restrictions (use with caution).
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_datagram_bytes: usize::MAX,
            max_commands: usize::MAX,
            max_payload_len: usize::MAX,
            max_fragment_count: u32::MAX,
            max_message_len: usize::MAX,
        }
    }
}
