//! Command kinds, flags and bodies.

use octets::{ByteReader, ByteWriter};

use crate::error::{DecodeError, EncodeError, LimitKind, WireResult};
use crate::header::{DATAGRAM_HEADER_SIZE, SYSTEM_CHANNEL};
use crate::limits::Limits;

/// Fixed command header size: kind, channel, flags, sequence.
pub const COMMAND_HEADER_SIZE: usize = 1 + 1 + 1 + 2;

/// Size of a `SendFragment` command excluding its payload.
pub const SEND_FRAGMENT_OVERHEAD: usize = COMMAND_HEADER_SIZE + 2 + 4 + 4 + 4 + 4 + 2;

/// Largest payload that travels in a single datagram at the given MTU.
///
/// Payloads above this are split into fragments of at most this size.
#[must_use]
pub const fn max_fragment_payload(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(DATAGRAM_HEADER_SIZE + SEND_FRAGMENT_OVERHEAD)
}

/// Command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandKind {
    Acknowledge = 1,
    Connect = 2,
    VerifyConnect = 3,
    Disconnect = 4,
    Ping = 5,
    SendReliable = 6,
    SendUnreliable = 7,
    SendUnsequenced = 8,
    SendFragment = 9,
    BandwidthLimit = 10,
    ThrottleConfigure = 11,
}

impl CommandKind {
    /// Parses a command kind from a raw byte.
    pub fn parse(kind: u8) -> Result<Self, DecodeError> {
        match kind {
            1 => Ok(Self::Acknowledge),
            2 => Ok(Self::Connect),
            3 => Ok(Self::VerifyConnect),
            4 => Ok(Self::Disconnect),
            5 => Ok(Self::Ping),
            6 => Ok(Self::SendReliable),
            7 => Ok(Self::SendUnreliable),
            8 => Ok(Self::SendUnsequenced),
            9 => Ok(Self::SendFragment),
            10 => Ok(Self::BandwidthLimit),
            11 => Ok(Self::ThrottleConfigure),
            _ => Err(DecodeError::UnknownCommand { kind }),
        }
    }

    /// Returns `true` for connection control commands, which live on
    /// [`SYSTEM_CHANNEL`].
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(
            self,
            Self::Connect
                | Self::VerifyConnect
                | Self::Disconnect
                | Self::Ping
                | Self::BandwidthLimit
                | Self::ThrottleConfigure
        )
    }

    /// Returns `true` for commands that carry application payload.
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(
            self,
            Self::SendReliable | Self::SendUnreliable | Self::SendUnsequenced | Self::SendFragment
        )
    }

    /// Returns `true` if `flags` is a legal combination for this kind.
    #[must_use]
    pub const fn accepts_flags(self, flags: CommandFlags) -> bool {
        if flags.has_reserved() {
            return false;
        }
        let reliable = flags.is_reliable();
        let reliable_ok = match self {
            Self::Acknowledge | Self::SendUnreliable | Self::SendUnsequenced => !reliable,
            Self::Disconnect => true,
            _ => reliable,
        };
        let unordered_ok =
            !flags.is_unordered() || matches!(self, Self::SendReliable | Self::SendFragment);
        reliable_ok && unordered_ok
    }

    /// Returns `true` if this kind may be sent on `channel`.
    #[must_use]
    pub const fn accepts_channel(self, channel: u8) -> bool {
        if self.is_control() {
            channel == SYSTEM_CHANNEL
        } else if self.is_data() {
            channel != SYSTEM_CHANNEL
        } else {
            true
        }
    }
}

/// Per-command flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CommandFlags(u8);

impl CommandFlags {
    /// The command must be acknowledged and is retransmitted until it is.
    pub const RELIABLE: u8 = 1 << 0;

    /// The payload is delivered on arrival instead of in sequence order.
    pub const UNORDERED: u8 = 1 << 1;

    const RESERVED_MASK: u8 = !0b11;

    /// Creates flags from a raw value.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Returns the raw flag bits.
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_reliable(self) -> bool {
        self.0 & Self::RELIABLE != 0
    }

    #[must_use]
    pub const fn is_unordered(self) -> bool {
        self.0 & Self::UNORDERED != 0
    }

    const fn has_reserved(self) -> bool {
        self.0 & Self::RESERVED_MASK != 0
    }

    #[must_use]
    pub const fn reliable() -> Self {
        Self(Self::RELIABLE)
    }

    #[must_use]
    pub const fn reliable_unordered() -> Self {
        Self(Self::RELIABLE | Self::UNORDERED)
    }

    #[must_use]
    pub const fn unreliable() -> Self {
        Self(0)
    }
}

/// Acknowledgement of reliable commands on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledge {
    /// Highest reliable sequence received without gaps.
    pub cumulative: u16,
    /// Bit `i` set means `cumulative + 1 + i` was also received.
    pub selective: u32,
    /// Sent time of the datagram that triggered this acknowledgement.
    pub received_sent_time: u32,
}

/// Connection parameters exchanged during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    /// Slot the sender assigned to this connection; the receiver puts it in
    /// the header of every datagram it sends back.
    pub outgoing_peer_id: u16,
    pub mtu: u16,
    pub window_size: u32,
    pub channel_count: u8,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub throttle_interval: u32,
    pub throttle_acceleration: u32,
    pub throttle_deceleration: u32,
}

/// One piece of a fragmented message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    /// Reliable sequence of fragment zero.
    pub start_sequence: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
    pub data: &'a [u8],
}

/// Kind-specific command body. Payloads borrow from the decoded datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBody<'a> {
    Acknowledge(Acknowledge),
    Connect { params: ConnectParams, data: u32 },
    VerifyConnect(ConnectParams),
    Disconnect { data: u32 },
    Ping,
    SendReliable { data: &'a [u8] },
    SendUnreliable { unreliable_sequence: u16, data: &'a [u8] },
    SendUnsequenced { group: u16, data: &'a [u8] },
    SendFragment(Fragment<'a>),
    BandwidthLimit { incoming: u32, outgoing: u32 },
    ThrottleConfigure {
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    },
}

impl CommandBody<'_> {
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Acknowledge(_) => CommandKind::Acknowledge,
            Self::Connect { .. } => CommandKind::Connect,
            Self::VerifyConnect(_) => CommandKind::VerifyConnect,
            Self::Disconnect { .. } => CommandKind::Disconnect,
            Self::Ping => CommandKind::Ping,
            Self::SendReliable { .. } => CommandKind::SendReliable,
            Self::SendUnreliable { .. } => CommandKind::SendUnreliable,
            Self::SendUnsequenced { .. } => CommandKind::SendUnsequenced,
            Self::SendFragment(_) => CommandKind::SendFragment,
            Self::BandwidthLimit { .. } => CommandKind::BandwidthLimit,
            Self::ThrottleConfigure { .. } => CommandKind::ThrottleConfigure,
        }
    }

    /// Encoded body size in bytes.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        match self {
            Self::Acknowledge(_) => 2 + 4 + 4,
            Self::Connect { .. } => CONNECT_PARAMS_SIZE + 4,
            Self::VerifyConnect(_) => CONNECT_PARAMS_SIZE,
            Self::Disconnect { .. } => 4,
            Self::Ping => 0,
            Self::SendReliable { data } => 2 + data.len(),
            Self::SendUnreliable { data, .. } | Self::SendUnsequenced { data, .. } => {
                2 + 2 + data.len()
            }
            Self::SendFragment(fragment) => {
                SEND_FRAGMENT_OVERHEAD - COMMAND_HEADER_SIZE + fragment.data.len()
            }
            Self::BandwidthLimit { .. } => 4 + 4,
            Self::ThrottleConfigure { .. } => 4 + 4 + 4,
        }
    }
}

const CONNECT_PARAMS_SIZE: usize = 2 + 2 + 4 + 1 + 4 + 4 + 4 + 4 + 4;

/// A decoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    pub channel: u8,
    pub flags: CommandFlags,
    /// Reliable sequence on `channel`.
    pub sequence: u16,
    pub body: CommandBody<'a>,
}

impl<'a> Command<'a> {
    /// Creates a command on [`SYSTEM_CHANNEL`] with the flags its kind requires.
    #[must_use]
    pub const fn control(sequence: u16, body: CommandBody<'a>) -> Self {
        Self {
            channel: SYSTEM_CHANNEL,
            flags: CommandFlags::reliable(),
            sequence,
            body,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.body.kind()
    }

    /// Encoded size including the command header.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        COMMAND_HEADER_SIZE + self.body.encoded_len()
    }
}

fn read_params(reader: &mut ByteReader<'_>) -> WireResult<ConnectParams> {
    Ok(ConnectParams {
        outgoing_peer_id: reader.read_u16()?,
        mtu: reader.read_u16()?,
        window_size: reader.read_u32()?,
        channel_count: reader.read_u8()?,
        incoming_bandwidth: reader.read_u32()?,
        outgoing_bandwidth: reader.read_u32()?,
        throttle_interval: reader.read_u32()?,
        throttle_acceleration: reader.read_u32()?,
        throttle_deceleration: reader.read_u32()?,
    })
}

fn read_payload<'a>(reader: &mut ByteReader<'a>, limits: &Limits) -> WireResult<&'a [u8]> {
    let len = usize::from(reader.read_u16()?);
    if len > limits.max_payload_len {
        return Err(DecodeError::LimitsExceeded {
            kind: LimitKind::PayloadLength,
            limit: limits.max_payload_len,
            actual: len,
        });
    }
    Ok(reader.read_bytes(len)?)
}

fn read_fragment<'a>(reader: &mut ByteReader<'a>, limits: &Limits) -> WireResult<Fragment<'a>> {
    let start_sequence = reader.read_u16()?;
    let fragment_count = reader.read_u32()?;
    let fragment_number = reader.read_u32()?;
    let total_length = reader.read_u32()?;
    let fragment_offset = reader.read_u32()?;
    let data = read_payload(reader, limits)?;

    if fragment_count > limits.max_fragment_count {
        return Err(DecodeError::LimitsExceeded {
            kind: LimitKind::FragmentCount,
            limit: limits.max_fragment_count as usize,
            actual: fragment_count as usize,
        });
    }
    if total_length as usize > limits.max_message_len {
        return Err(DecodeError::LimitsExceeded {
            kind: LimitKind::MessageLength,
            limit: limits.max_message_len,
            actual: total_length as usize,
        });
    }
    let end = u64::from(fragment_offset) + data.len() as u64;
    if fragment_number >= fragment_count || end > u64::from(total_length) {
        return Err(DecodeError::InvalidFragment {
            fragment_number,
            fragment_count,
            fragment_offset,
            total_length,
        });
    }

    Ok(Fragment {
        start_sequence,
        fragment_count,
        fragment_number,
        total_length,
        fragment_offset,
        data,
    })
}

/// Decodes one command, validating flags and channel for its kind.
pub fn decode_command<'a>(reader: &mut ByteReader<'a>, limits: &Limits) -> WireResult<Command<'a>> {
    let kind = CommandKind::parse(reader.read_u8()?)?;
    let channel = reader.read_u8()?;
    let flags = CommandFlags::from_raw(reader.read_u8()?);
    let sequence = reader.read_u16()?;

    if !kind.accepts_flags(flags) {
        return Err(DecodeError::InvalidFlags {
            kind,
            flags: flags.raw(),
        });
    }
    if !kind.accepts_channel(channel) {
        return Err(DecodeError::InvalidChannel { kind, channel });
    }

    let body = match kind {
        CommandKind::Acknowledge => CommandBody::Acknowledge(Acknowledge {
            cumulative: reader.read_u16()?,
            selective: reader.read_u32()?,
            received_sent_time: reader.read_u32()?,
        }),
        CommandKind::Connect => CommandBody::Connect {
            params: read_params(reader)?,
            data: reader.read_u32()?,
        },
        CommandKind::VerifyConnect => CommandBody::VerifyConnect(read_params(reader)?),
        CommandKind::Disconnect => CommandBody::Disconnect {
            data: reader.read_u32()?,
        },
        CommandKind::Ping => CommandBody::Ping,
        CommandKind::SendReliable => CommandBody::SendReliable {
            data: read_payload(reader, limits)?,
        },
        CommandKind::SendUnreliable => CommandBody::SendUnreliable {
            unreliable_sequence: reader.read_u16()?,
            data: read_payload(reader, limits)?,
        },
        CommandKind::SendUnsequenced => CommandBody::SendUnsequenced {
            group: reader.read_u16()?,
            data: read_payload(reader, limits)?,
        },
        CommandKind::SendFragment => CommandBody::SendFragment(read_fragment(reader, limits)?),
        CommandKind::BandwidthLimit => CommandBody::BandwidthLimit {
            incoming: reader.read_u32()?,
            outgoing: reader.read_u32()?,
        },
        CommandKind::ThrottleConfigure => CommandBody::ThrottleConfigure {
            interval: reader.read_u32()?,
            acceleration: reader.read_u32()?,
            deceleration: reader.read_u32()?,
        },
    };

    Ok(Command {
        channel,
        flags,
        sequence,
        body,
    })
}

fn write_params(writer: &mut ByteWriter<'_>, params: &ConnectParams) -> Result<(), EncodeError> {
    writer.write_u16(params.outgoing_peer_id)?;
    writer.write_u16(params.mtu)?;
    writer.write_u32(params.window_size)?;
    writer.write_u8(params.channel_count)?;
    writer.write_u32(params.incoming_bandwidth)?;
    writer.write_u32(params.outgoing_bandwidth)?;
    writer.write_u32(params.throttle_interval)?;
    writer.write_u32(params.throttle_acceleration)?;
    writer.write_u32(params.throttle_deceleration)?;
    Ok(())
}

fn write_payload(writer: &mut ByteWriter<'_>, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len())
        .map_err(|_| EncodeError::LengthOverflow { length: data.len() })?;
    writer.write_u16(len)?;
    writer.write_bytes(data)?;
    Ok(())
}

/// Encodes a single command into the provided output buffer.
pub fn encode_command(command: &Command<'_>, out: &mut [u8]) -> Result<usize, EncodeError> {
    let needed = command.encoded_len();
    if out.len() < needed {
        return Err(EncodeError::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }

    let mut writer = ByteWriter::new(out);
    writer.write_u8(command.kind() as u8)?;
    writer.write_u8(command.channel)?;
    writer.write_u8(command.flags.raw())?;
    writer.write_u16(command.sequence)?;

    match &command.body {
        CommandBody::Acknowledge(ack) => {
            writer.write_u16(ack.cumulative)?;
            writer.write_u32(ack.selective)?;
            writer.write_u32(ack.received_sent_time)?;
        }
        CommandBody::Connect { params, data } => {
            write_params(&mut writer, params)?;
            writer.write_u32(*data)?;
        }
        CommandBody::VerifyConnect(params) => write_params(&mut writer, params)?,
        CommandBody::Disconnect { data } => writer.write_u32(*data)?,
        CommandBody::Ping => {}
        CommandBody::SendReliable { data } => write_payload(&mut writer, data)?,
        CommandBody::SendUnreliable {
            unreliable_sequence,
            data,
        } => {
            writer.write_u16(*unreliable_sequence)?;
            write_payload(&mut writer, data)?;
        }
        CommandBody::SendUnsequenced { group, data } => {
            writer.write_u16(*group)?;
            write_payload(&mut writer, data)?;
        }
        CommandBody::SendFragment(fragment) => {
            writer.write_u16(fragment.start_sequence)?;
            writer.write_u32(fragment.fragment_count)?;
            writer.write_u32(fragment.fragment_number)?;
            writer.write_u32(fragment.total_length)?;
            writer.write_u32(fragment.fragment_offset)?;
            write_payload(&mut writer, fragment.data)?;
        }
        CommandBody::BandwidthLimit { incoming, outgoing } => {
            writer.write_u32(*incoming)?;
            writer.write_u32(*outgoing)?;
        }
        CommandBody::ThrottleConfigure {
            interval,
            acceleration,
            deceleration,
        } => {
            writer.write_u32(*interval)?;
            writer.write_u32(*acceleration)?;
            writer.write_u32(*deceleration)?;
        }
    }

    Ok(writer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectParams {
        ConnectParams {
            outgoing_peer_id: 3,
            mtu: 1400,
            window_size: 32768,
            channel_count: 2,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            throttle_interval: 5000,
            throttle_acceleration: 2,
            throttle_deceleration: 2,
        }
    }

    fn roundtrip(command: &Command<'_>) -> Vec<u8> {
        let mut buf = vec![0u8; command.encoded_len()];
        let written = encode_command(command, &mut buf).unwrap();
        assert_eq!(written, command.encoded_len());

        let mut reader = ByteReader::new(&buf);
        let decoded = decode_command(&mut reader, &Limits::default()).unwrap();
        assert_eq!(&decoded, command);
        assert!(reader.is_empty());
        buf
    }

    #[test]
    fn kind_parse_rejects_unknown() {
        assert_eq!(CommandKind::parse(9).unwrap(), CommandKind::SendFragment);
        assert!(matches!(
            CommandKind::parse(0),
            Err(DecodeError::UnknownCommand { kind: 0 })
        ));
        assert!(CommandKind::parse(12).is_err());
    }

    #[test]
    fn control_kinds_require_reliable() {
        assert!(CommandKind::Ping.accepts_flags(CommandFlags::reliable()));
        assert!(!CommandKind::Ping.accepts_flags(CommandFlags::unreliable()));
        assert!(!CommandKind::Connect.accepts_flags(CommandFlags::reliable_unordered()));
    }

    #[test]
    fn disconnect_accepts_either_reliability() {
        assert!(CommandKind::Disconnect.accepts_flags(CommandFlags::reliable()));
        assert!(CommandKind::Disconnect.accepts_flags(CommandFlags::unreliable()));
    }

    #[test]
    fn unreliable_kinds_reject_reliable_flag() {
        assert!(!CommandKind::Acknowledge.accepts_flags(CommandFlags::reliable()));
        assert!(!CommandKind::SendUnsequenced.accepts_flags(CommandFlags::reliable()));
        assert!(CommandKind::SendUnreliable.accepts_flags(CommandFlags::unreliable()));
    }

    #[test]
    fn reserved_flag_bits_rejected() {
        let flags = CommandFlags::from_raw(CommandFlags::RELIABLE | 0x10);
        assert!(!CommandKind::SendReliable.accepts_flags(flags));
    }

    #[test]
    fn channel_rules() {
        assert!(CommandKind::Ping.accepts_channel(SYSTEM_CHANNEL));
        assert!(!CommandKind::Ping.accepts_channel(0));
        assert!(CommandKind::SendReliable.accepts_channel(0));
        assert!(!CommandKind::SendReliable.accepts_channel(SYSTEM_CHANNEL));
        assert!(CommandKind::Acknowledge.accepts_channel(SYSTEM_CHANNEL));
        assert!(CommandKind::Acknowledge.accepts_channel(4));
    }

    #[test]
    fn fragment_overhead_matches_encoding() {
        let command = Command {
            channel: 0,
            flags: CommandFlags::reliable(),
            sequence: 9,
            body: CommandBody::SendFragment(Fragment {
                start_sequence: 9,
                fragment_count: 1,
                fragment_number: 0,
                total_length: 0,
                fragment_offset: 0,
                data: &[],
            }),
        };
        assert_eq!(command.encoded_len(), SEND_FRAGMENT_OVERHEAD);
        assert_eq!(SEND_FRAGMENT_OVERHEAD, 25);
    }

    #[test]
    fn max_fragment_payload_at_default_mtu() {
        assert_eq!(max_fragment_payload(1400), 1400 - 12 - 25);
        assert_eq!(max_fragment_payload(0), 0);
    }

    #[test]
    fn acknowledge_layout() {
        let command = Command {
            channel: 1,
            flags: CommandFlags::unreliable(),
            sequence: 0,
            body: CommandBody::Acknowledge(Acknowledge {
                cumulative: 0x0102,
                selective: 0x8000_0001,
                received_sent_time: 0x0A0B_0C0D,
            }),
        };
        let bytes = roundtrip(&command);
        assert_eq!(
            bytes,
            [1, 1, 0, 0, 0, 0x01, 0x02, 0x80, 0, 0, 0x01, 0x0A, 0x0B, 0x0C, 0x0D]
        );
    }

    #[test]
    fn connect_and_verify_roundtrip() {
        roundtrip(&Command::control(
            1,
            CommandBody::Connect {
                params: params(),
                data: 42,
            },
        ));
        roundtrip(&Command::control(1, CommandBody::VerifyConnect(params())));
    }

    #[test]
    fn payload_commands_roundtrip() {
        roundtrip(&Command {
            channel: 0,
            flags: CommandFlags::reliable_unordered(),
            sequence: 65535,
            body: CommandBody::SendReliable { data: b"hello" },
        });
        roundtrip(&Command {
            channel: 3,
            flags: CommandFlags::unreliable(),
            sequence: 4,
            body: CommandBody::SendUnreliable {
                unreliable_sequence: 17,
                data: b"pos",
            },
        });
        roundtrip(&Command {
            channel: 3,
            flags: CommandFlags::unreliable(),
            sequence: 0,
            body: CommandBody::SendUnsequenced {
                group: 1023,
                data: &[],
            },
        });
    }

    #[test]
    fn payload_over_limit_rejected() {
        let data = [0u8; 64];
        let command = Command {
            channel: 0,
            flags: CommandFlags::reliable(),
            sequence: 1,
            body: CommandBody::SendReliable { data: &data },
        };
        let mut buf = vec![0u8; command.encoded_len()];
        encode_command(&command, &mut buf).unwrap();

        let limits = Limits {
            max_payload_len: 32,
            ..Limits::default()
        };
        let err = decode_command(&mut ByteReader::new(&buf), &limits).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::LimitsExceeded {
                kind: LimitKind::PayloadLength,
                limit: 32,
                actual: 64
            }
        ));
    }

    #[test]
    fn fragment_past_total_length_rejected() {
        let command = Command {
            channel: 0,
            flags: CommandFlags::reliable(),
            sequence: 2,
            body: CommandBody::SendFragment(Fragment {
                start_sequence: 1,
                fragment_count: 2,
                fragment_number: 1,
                total_length: 10,
                fragment_offset: 8,
                data: b"abc",
            }),
        };
        let mut buf = vec![0u8; command.encoded_len()];
        encode_command(&command, &mut buf).unwrap();
        let err = decode_command(&mut ByteReader::new(&buf), &Limits::default()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidFragment { .. }));
    }

    #[test]
    fn fragment_number_out_of_range_rejected() {
        let command = Command {
            channel: 0,
            flags: CommandFlags::reliable(),
            sequence: 2,
            body: CommandBody::SendFragment(Fragment {
                start_sequence: 0,
                fragment_count: 2,
                fragment_number: 2,
                total_length: 10,
                fragment_offset: 0,
                data: b"abc",
            }),
        };
        let mut buf = vec![0u8; command.encoded_len()];
        encode_command(&command, &mut buf).unwrap();
        assert!(decode_command(&mut ByteReader::new(&buf), &Limits::default()).is_err());
    }

    #[test]
    fn ping_on_data_channel_rejected() {
        let buf = [CommandKind::Ping as u8, 0, CommandFlags::RELIABLE, 0, 1];
        let err = decode_command(&mut ByteReader::new(&buf), &Limits::default()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::InvalidChannel {
                kind: CommandKind::Ping,
                channel: 0
            }
        );
    }

    #[test]
    fn encode_into_short_buffer_fails() {
        let command = Command::control(1, CommandBody::Disconnect { data: 0 });
        let mut buf = [0u8; 4];
        let err = encode_command(&command, &mut buf).unwrap_err();
        assert_eq!(
            err,
            EncodeError::BufferTooSmall {
                needed: 9,
                available: 4
            }
        );
    }

    #[test]
    fn oversized_payload_encode_fails() {
        let data = vec![0u8; usize::from(u16::MAX) + 1];
        let command = Command {
            channel: 0,
            flags: CommandFlags::reliable(),
            sequence: 1,
            body: CommandBody::SendReliable { data: &data },
        };
        let mut buf = vec![0u8; command.encoded_len()];
        assert!(matches!(
            encode_command(&command, &mut buf),
            Err(EncodeError::LengthOverflow { .. })
        ));
    }
}
