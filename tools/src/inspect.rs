//! Structural dump of a captured datagram.

use std::fmt::Write as _;

use serde::Serialize;
use wire::{decode_datagram, Command, CommandBody, DecodeError, Limits, DATAGRAM_HEADER_SIZE};

/// Decoded datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeaderReport {
    pub version: u8,
    pub command_count: u8,
    /// `None` when the sender did not know its slot yet.
    pub peer_id: Option<u16>,
    pub connect_id: u32,
    pub sent_time: u32,
}

/// One decoded command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReport {
    pub kind: String,
    pub channel: u8,
    pub reliable: bool,
    pub unordered: bool,
    pub sequence: u16,
    /// Encoded size including the command header.
    pub byte_len: usize,
    /// Application payload carried by data commands.
    pub payload_len: Option<usize>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectReport {
    pub total_bytes: usize,
    pub header: HeaderReport,
    pub commands: Vec<CommandReport>,
}

impl InspectReport {
    /// Payload bytes across all data commands.
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        self.commands.iter().filter_map(|c| c.payload_len).sum()
    }
}

pub fn inspect_datagram(bytes: &[u8], limits: &Limits) -> Result<InspectReport, DecodeError> {
    let datagram = decode_datagram(bytes, limits)?;
    let header = datagram.header;
    Ok(InspectReport {
        total_bytes: bytes.len(),
        header: HeaderReport {
            version: header.version,
            command_count: header.command_count,
            peer_id: (!header.is_unassigned()).then_some(header.peer_id),
            connect_id: header.connect_id,
            sent_time: header.sent_time,
        },
        commands: datagram.commands.iter().map(command_report).collect(),
    })
}

fn command_report(command: &Command<'_>) -> CommandReport {
    let (payload_len, detail) = match command.body {
        CommandBody::Acknowledge(ack) => (
            None,
            format!(
                "cumulative={} selective={:#010x} echo={}",
                ack.cumulative, ack.selective, ack.received_sent_time
            ),
        ),
        CommandBody::Connect { params, data } => (
            None,
            format!(
                "peer={} mtu={} window={} channels={} data={data}",
                params.outgoing_peer_id, params.mtu, params.window_size, params.channel_count
            ),
        ),
        CommandBody::VerifyConnect(params) => (
            None,
            format!(
                "peer={} mtu={} window={} channels={}",
                params.outgoing_peer_id, params.mtu, params.window_size, params.channel_count
            ),
        ),
        CommandBody::Disconnect { data } => (None, format!("data={data}")),
        CommandBody::Ping => (None, String::new()),
        CommandBody::SendReliable { data } => (Some(data.len()), String::new()),
        CommandBody::SendUnreliable {
            unreliable_sequence,
            data,
        } => (Some(data.len()), format!("unreliable_sequence={unreliable_sequence}")),
        CommandBody::SendUnsequenced { group, data } => {
            (Some(data.len()), format!("group={group}"))
        }
        CommandBody::SendFragment(fragment) => (
            Some(fragment.data.len()),
            format!(
                "start={} fragment={}/{} offset={} total={}",
                fragment.start_sequence,
                fragment.fragment_number + 1,
                fragment.fragment_count,
                fragment.fragment_offset,
                fragment.total_length
            ),
        ),
        CommandBody::BandwidthLimit { incoming, outgoing } => {
            (None, format!("incoming={incoming} outgoing={outgoing}"))
        }
        CommandBody::ThrottleConfigure {
            interval,
            acceleration,
            deceleration,
        } => (
            None,
            format!("interval={interval} acceleration={acceleration} deceleration={deceleration}"),
        ),
    };
    CommandReport {
        kind: format!("{:?}", command.kind()),
        channel: command.channel,
        reliable: command.flags.is_reliable(),
        unordered: command.flags.is_unordered(),
        sequence: command.sequence,
        byte_len: command.encoded_len(),
        payload_len,
        detail,
    }
}

/// Renders a report for terminals.
#[must_use]
pub fn format_pretty(report: &InspectReport) -> String {
    let header = report.header;
    let mut out = String::new();
    let peer = header
        .peer_id
        .map_or_else(|| "unassigned".to_string(), |id| id.to_string());
    let _ = writeln!(
        out,
        "version: {} peer: {peer} connect_id: {:#010x} sent_time: {}",
        header.version, header.connect_id, header.sent_time
    );
    let _ = writeln!(
        out,
        "{} bytes: {DATAGRAM_HEADER_SIZE} header, {} payload, {} commands",
        report.total_bytes,
        report.payload_bytes(),
        report.commands.len()
    );
    for command in &report.commands {
        let mode = match (command.reliable, command.unordered) {
            (true, false) => "reliable",
            (true, true) => "reliable-unordered",
            _ => "unreliable",
        };
        let channel = if command.channel == wire::SYSTEM_CHANNEL {
            "system".to_string()
        } else {
            command.channel.to_string()
        };
        let _ = write!(
            out,
            "  {} ch={channel} seq={} {mode} ({} bytes)",
            command.kind, command.sequence, command.byte_len
        );
        if !command.detail.is_empty() {
            let _ = write!(out, " {}", command.detail);
        }
        out.push('\n');
    }
    out
}
