//! Datagram header types and protocol constants.

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Datagram header size in bytes (12 total).
pub const DATAGRAM_HEADER_SIZE: usize = 1 + 1 + 2 + 4 + 4;

/// Peer id carried by datagrams sent before the receiver assigned one.
pub const UNASSIGNED_PEER_ID: u16 = 0xFFFF;

/// Largest peer id a host may hand out.
pub const MAX_PEER_ID: u16 = 0x0FFF;

/// Channel reserved for connection control commands.
pub const SYSTEM_CHANNEL: u8 = 0xFF;

/// Upper bound on data channels per connection (ids `0..=254`).
pub const MAX_CHANNEL_COUNT: u8 = 255;

pub const MAX_COMMANDS_PER_DATAGRAM: usize = 32;

pub const MIN_MTU: u16 = 576;
pub const MAX_MTU: u16 = 4096;
pub const DEFAULT_MTU: u16 = 1400;

/// Smallest negotiated reliable window, in bytes.
pub const MIN_WINDOW_SIZE: u32 = 4096;
/// Largest negotiated reliable window, in bytes.
pub const MAX_WINDOW_SIZE: u32 = 32768;

/// Header at the start of every datagram.
///
/// Layout (big-endian): version `u8`, command count `u8`, peer id `u16`,
/// connect id `u32`, sent time `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatagramHeader {
    /// Protocol version.
    pub version: u8,
    /// Number of commands that follow.
    pub command_count: u8,
    /// Receiver's slot for this connection, or [`UNASSIGNED_PEER_ID`].
    pub peer_id: u16,
    /// Incarnation id chosen by the initiator of the connection.
    pub connect_id: u32,
    /// Sender's clock in milliseconds, echoed back in acknowledgements.
    pub sent_time: u32,
}

impl DatagramHeader {
    /// Creates a header for the current protocol version.
    #[must_use]
    pub const fn new(command_count: u8, peer_id: u16, connect_id: u32, sent_time: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command_count,
            peer_id,
            connect_id,
            sent_time,
        }
    }

    /// Returns `true` if the sender did not know its slot on the receiver.
    #[must_use]
    pub const fn is_unassigned(&self) -> bool {
        self.peer_id == UNASSIGNED_PEER_ID
    }
}
