//! Datagram framing and command layout for the ricochet transport.
//!
//! This crate handles the binary wire format: the datagram header, the
//! command header, and one body per command kind. It does not know about
//! peers, timers or delivery guarantees, only the structure of datagrams.
//!
//! # Design Principles
//!
//! - **Fixed byte order** - Every field is big-endian.
//! - **Bounded decoding** - Counts and lengths are validated against [`Limits`].
//! - **Bijective framing** - Accepted datagrams re-encode to identical bytes.
//! - **Zero-copy decode** - Payloads borrow from the input buffer.

mod command;
mod datagram;
mod error;
mod header;
mod limits;

pub use command::{
    decode_command, encode_command, max_fragment_payload, Acknowledge, Command, CommandBody,
    CommandFlags, CommandKind, ConnectParams, Fragment, COMMAND_HEADER_SIZE,
    SEND_FRAGMENT_OVERHEAD,
};
pub use datagram::{
    decode_datagram, decode_header, encode_datagram, encode_header, encoded_len, WireDatagram,
};
pub use error::{DecodeError, EncodeError, LimitKind, WireResult};
pub use header::{
    DatagramHeader, DATAGRAM_HEADER_SIZE, DEFAULT_MTU, MAX_CHANNEL_COUNT,
    MAX_COMMANDS_PER_DATAGRAM, MAX_MTU, MAX_PEER_ID, MAX_WINDOW_SIZE, MIN_MTU, MIN_WINDOW_SIZE,
    PROTOCOL_VERSION, SYSTEM_CHANNEL, UNASSIGNED_PEER_ID,
};
pub use limits::Limits;
