//! Per-connection state.

use std::collections::VecDeque;
use std::net::SocketAddr;

use wire::{
    encode_command, Command, CommandBody, CommandFlags, ConnectParams, EncodeError,
    SYSTEM_CHANNEL, UNASSIGNED_PEER_ID,
};

use crate::channel::{Channel, UnsequencedWindow};
use crate::config::HostConfig;
use crate::congestion::{CongestionWindow, LossEstimator, PacketThrottle, RttEstimator};
use crate::reliability::{OutgoingCommand, ReliableQueue};

/// Stable reference to a peer slot.
///
/// The generation changes every time the slot is reused, so a handle to a
/// released connection never reaches its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerHandle {
    index: u16,
    generation: u32,
}

impl PeerHandle {
    pub(crate) const fn new(index: u16, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index, also the peer id the remote puts in its datagrams.
    #[must_use]
    pub const fn index(self) -> u16 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PeerState {
    Disconnected,
    /// We sent `Connect` and wait for `VerifyConnect`.
    Connecting,
    /// We answered a `Connect` and wait for the acknowledgement.
    AcknowledgingConnect,
    Connected,
    /// We sent a reliable `Disconnect` and wait for its acknowledgement.
    Disconnecting,
    /// The remote disconnected; the acknowledgement is still to be sent.
    AcknowledgingDisconnect,
    /// Presumed dead; released at the end of the service round.
    Zombie,
}

impl PeerState {
    /// Returns `true` while the handshake is still in progress.
    #[must_use]
    pub const fn is_handshake(self) -> bool {
        matches!(self, Self::Connecting | Self::AcknowledgingConnect)
    }
}

/// Snapshot of a connection's health.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerStats {
    pub state: PeerState,
    pub rtt_ms: u32,
    pub rtt_variance_ms: u32,
    /// Smoothed loss, out of 65536.
    pub packet_loss: u32,
    pub packet_loss_variance: u32,
    pub packets_sent: u64,
    pub packets_lost: u64,
    /// Reliable bytes sent and not yet acknowledged.
    pub reliable_in_flight: u32,
    pub window_size: u32,
    /// Reliable commands waiting for window space.
    pub queued_reliable: usize,
    /// Reliable commands sent and awaiting acknowledgement.
    pub unacknowledged_reliable: usize,
    /// Unreliable send probability, out of 32.
    pub throttle: u32,
    pub mtu: u16,
    pub channel_count: u8,
}

/// Event emitted when a zombie is purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Farewell {
    Timeout,
    ConnectFailed,
    Disconnect(u32),
    Silent,
}

#[derive(Debug)]
pub(crate) struct Peer {
    pub generation: u32,
    pub state: PeerState,
    pub address: Option<SocketAddr>,
    pub connect_id: u32,
    /// Our slot on the remote host, stamped on every datagram we send.
    pub remote_peer_id: u16,
    pub mtu: u16,
    pub channels: Vec<Channel>,
    pub system: Channel,
    pub reliable: ReliableQueue,
    /// Encoded unreliable commands for the next flush.
    pub unreliable: VecDeque<Vec<u8>>,
    /// Channels with received reliable commands and the sent time of the
    /// datagram that carried them.
    pub acks: Vec<(u8, u32)>,
    pub remote_incoming_bandwidth: u32,
    pub remote_outgoing_bandwidth: u32,
    pub rtt: RttEstimator,
    pub throttle: PacketThrottle,
    pub window: CongestionWindow,
    pub loss: LossEstimator,
    pub unsequenced: UnsequencedWindow,
    pub outgoing_unsequenced_group: u16,
    pub last_receive: u32,
    pub last_send: u32,
    /// Data delivered with the `Connect` event.
    pub event_data: u32,
    pub farewell: Option<Farewell>,
}

impl Peer {
    pub(crate) fn new(generation: u32, config: &HostConfig) -> Self {
        Self {
            generation,
            state: PeerState::Disconnected,
            address: None,
            connect_id: 0,
            remote_peer_id: UNASSIGNED_PEER_ID,
            mtu: config.mtu,
            channels: Vec::new(),
            system: Channel::new(),
            reliable: ReliableQueue::default(),
            unreliable: VecDeque::new(),
            acks: Vec::new(),
            remote_incoming_bandwidth: 0,
            remote_outgoing_bandwidth: 0,
            rtt: RttEstimator::default(),
            throttle: PacketThrottle::new(
                config.throttle_interval_ms,
                config.throttle_acceleration,
                config.throttle_deceleration,
            ),
            window: CongestionWindow::new(wire::MAX_WINDOW_SIZE, config.mtu),
            loss: LossEstimator::default(),
            unsequenced: UnsequencedWindow::default(),
            outgoing_unsequenced_group: 0,
            last_receive: 0,
            last_send: 0,
            event_data: 0,
            farewell: None,
        }
    }

    pub(crate) const fn handle(&self, index: u16) -> PeerHandle {
        PeerHandle::new(index, self.generation)
    }

    pub(crate) fn is_free(&self) -> bool {
        self.state == PeerState::Disconnected
    }

    pub(crate) fn channel_count(&self) -> u8 {
        u8::try_from(self.channels.len()).unwrap_or(u8::MAX)
    }

    /// Prepares a free slot for a new connection.
    pub(crate) fn open(
        &mut self,
        address: SocketAddr,
        connect_id: u32,
        channel_count: u8,
        mtu: u16,
        window: u32,
        now: u32,
    ) {
        self.address = Some(address);
        self.connect_id = connect_id;
        self.channels = (0..channel_count).map(|_| Channel::new()).collect();
        self.mtu = mtu;
        self.window = CongestionWindow::new(window, mtu);
        self.last_receive = now;
        self.last_send = now;
    }

    /// Handshake parameters advertised by this side.
    pub(crate) fn connect_params(&self, index: u16, config: &HostConfig) -> ConnectParams {
        ConnectParams {
            outgoing_peer_id: index,
            mtu: self.mtu,
            window_size: self.window.window(),
            channel_count: self.channel_count(),
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            throttle_interval: self.throttle.interval,
            throttle_acceleration: self.throttle.acceleration,
            throttle_deceleration: self.throttle.deceleration,
        }
    }

    /// Channel by wire id; [`SYSTEM_CHANNEL`] maps to the control channel.
    pub(crate) fn channel_mut(&mut self, id: u8) -> Option<&mut Channel> {
        if id == SYSTEM_CHANNEL {
            Some(&mut self.system)
        } else {
            self.channels.get_mut(usize::from(id))
        }
    }

    /// Queues a reliable control command with the next system sequence.
    pub(crate) fn queue_control(&mut self, body: CommandBody<'_>) -> Result<(), EncodeError> {
        let sequence = self.system.next_reliable();
        self.queue_reliable(&Command::control(sequence, body))
    }

    pub(crate) fn queue_reliable(&mut self, command: &Command<'_>) -> Result<(), EncodeError> {
        self.reliable.push(OutgoingCommand::encode(command)?);
        Ok(())
    }

    pub(crate) fn queue_unreliable(&mut self, command: &Command<'_>) -> Result<(), EncodeError> {
        let mut bytes = vec![0u8; command.encoded_len()];
        let written = encode_command(command, &mut bytes)?;
        bytes.truncate(written);
        self.unreliable.push_back(bytes);
        Ok(())
    }

    /// Builds an unreliable `Disconnect`.
    pub(crate) const fn unreliable_disconnect(data: u32) -> Command<'static> {
        Command {
            channel: SYSTEM_CHANNEL,
            flags: CommandFlags::unreliable(),
            sequence: 0,
            body: CommandBody::Disconnect { data },
        }
    }

    /// Schedules an acknowledgement for `channel`. One acknowledgement per
    /// channel per received datagram.
    pub(crate) fn queue_ack(&mut self, channel: u8, sent_time: u32) {
        if !self.acks.contains(&(channel, sent_time)) {
            self.acks.push((channel, sent_time));
        }
    }

    /// Drops every queued command and buffered incoming command, keeping
    /// sequence counters.
    pub(crate) fn reset_queues(&mut self) {
        self.reliable.clear();
        self.unreliable.clear();
        self.acks.clear();
        self.window.clear_in_flight();
        for channel in &mut self.channels {
            channel.clear_incoming();
        }
        self.system.clear_incoming();
    }

    pub(crate) fn zombify(&mut self, farewell: Farewell) {
        self.state = PeerState::Zombie;
        self.farewell = Some(farewell);
    }

    pub(crate) fn stats(&self) -> PeerStats {
        let (packets_sent, packets_lost) = self.loss.totals();
        PeerStats {
            state: self.state,
            rtt_ms: self.rtt.rtt(),
            rtt_variance_ms: self.rtt.variance(),
            packet_loss: self.loss.loss(),
            packet_loss_variance: self.loss.variance(),
            packets_sent,
            packets_lost,
            reliable_in_flight: self.window.in_flight(),
            window_size: self.window.window(),
            queued_reliable: self.reliable.queued(),
            unacknowledged_reliable: self.reliable.in_flight(),
            throttle: self.throttle.value(),
            mtu: self.mtu,
            channel_count: self.channel_count(),
        }
    }
}
