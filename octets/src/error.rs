//! Error types for byte cursor operations.

use std::fmt;

/// Result type for byte cursor operations.
pub type OctetResult<T> = Result<T, OctetError>;

/// Errors that can occur while reading or writing octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OctetError {
    /// Attempted to read past the end of the input.
    UnexpectedEof {
        /// Number of bytes requested.
        requested: usize,
        /// Number of bytes available.
        available: usize,
    },

    /// Attempted to write past the end of the output buffer.
    BufferTooSmall {
        /// Number of bytes the write needed.
        needed: usize,
        /// Number of bytes left in the buffer.
        available: usize,
    },
}

impl fmt::Display for OctetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof {
                requested,
                available,
            } => {
                write!(
                    f,
                    "attempted to read {requested} bytes but only {available} bytes available"
                )
            }
            Self::BufferTooSmall { needed, available } => {
                write!(
                    f,
                    "attempted to write {needed} bytes but only {available} bytes of space left"
                )
            }
        }
    }
}

impl std::error::Error for OctetError {}
