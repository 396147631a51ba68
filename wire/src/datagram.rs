//! Datagram decoding and encoding.

use octets::{ByteReader, ByteWriter};

use crate::command::{decode_command, encode_command, Command};
use crate::error::{DecodeError, EncodeError, LimitKind, WireResult};
use crate::header::{DatagramHeader, DATAGRAM_HEADER_SIZE, PROTOCOL_VERSION};
use crate::limits::Limits;

/// A decoded datagram: header plus borrowed commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireDatagram<'a> {
    pub header: DatagramHeader,
    pub commands: Vec<Command<'a>>,
}

/// Decodes only the datagram header.
pub fn decode_header(buf: &[u8]) -> WireResult<DatagramHeader> {
    if buf.len() < DATAGRAM_HEADER_SIZE {
        return Err(DecodeError::DatagramTooSmall {
            actual: buf.len(),
            required: DATAGRAM_HEADER_SIZE,
        });
    }
    let mut reader = ByteReader::new(buf);
    let version = reader.read_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion { found: version });
    }
    Ok(DatagramHeader {
        version,
        command_count: reader.read_u8()?,
        peer_id: reader.read_u16()?,
        connect_id: reader.read_u32()?,
        sent_time: reader.read_u32()?,
    })
}

/// Decodes a datagram into its header and commands.
///
/// The datagram must contain exactly `command_count` commands and nothing
/// after them, so every accepted datagram re-encodes to the same bytes.
pub fn decode_datagram<'a>(buf: &'a [u8], limits: &Limits) -> WireResult<WireDatagram<'a>> {
    if buf.len() > limits.max_datagram_bytes {
        return Err(DecodeError::LimitsExceeded {
            kind: LimitKind::DatagramBytes,
            limit: limits.max_datagram_bytes,
            actual: buf.len(),
        });
    }
    let header = decode_header(buf)?;
    let count = usize::from(header.command_count);
    if count == 0 {
        return Err(DecodeError::EmptyDatagram);
    }
    if count > limits.max_commands {
        return Err(DecodeError::LimitsExceeded {
            kind: LimitKind::CommandCount,
            limit: limits.max_commands,
            actual: count,
        });
    }

    let mut reader = ByteReader::new(&buf[DATAGRAM_HEADER_SIZE..]);
    let mut commands = Vec::with_capacity(count);
    for _ in 0..count {
        commands.push(decode_command(&mut reader, limits)?);
    }
    if !reader.is_empty() {
        return Err(DecodeError::TrailingBytes {
            count: reader.remaining(),
        });
    }

    Ok(WireDatagram { header, commands })
}

/// Encodes a datagram header into the provided output buffer.
pub fn encode_header(header: &DatagramHeader, out: &mut [u8]) -> Result<usize, EncodeError> {
    if out.len() < DATAGRAM_HEADER_SIZE {
        return Err(EncodeError::BufferTooSmall {
            needed: DATAGRAM_HEADER_SIZE,
            available: out.len(),
        });
    }
    let mut writer = ByteWriter::new(out);
    writer.write_u8(header.version)?;
    writer.write_u8(header.command_count)?;
    writer.write_u16(header.peer_id)?;
    writer.write_u32(header.connect_id)?;
    writer.write_u32(header.sent_time)?;
    Ok(writer.finish())
}

/// Encodes a whole datagram. `header.command_count` is taken from `commands`.
pub fn encode_datagram(
    header: &DatagramHeader,
    commands: &[Command<'_>],
    out: &mut [u8],
) -> Result<usize, EncodeError> {
    let count = u8::try_from(commands.len()).map_err(|_| EncodeError::LengthOverflow {
        length: commands.len(),
    })?;
    let header = DatagramHeader {
        command_count: count,
        ..*header
    };
    let mut offset = encode_header(&header, out)?;
    for command in commands {
        offset += encode_command(command, &mut out[offset..])?;
    }
    Ok(offset)
}

/// Encoded size of a datagram carrying `commands`.
#[must_use]
pub fn encoded_len(commands: &[Command<'_>]) -> usize {
    DATAGRAM_HEADER_SIZE + commands.iter().map(Command::encoded_len).sum::<usize>()
}
