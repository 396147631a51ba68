//! The host: peer slots, datagram dispatch and the service loop.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};
use wire::{
    decode_datagram, encode_command, encode_header, max_fragment_payload, Acknowledge, Command,
    CommandBody, CommandFlags, CommandKind, ConnectParams, DatagramHeader, EncodeError, Fragment,
    Limits, DATAGRAM_HEADER_SIZE, MAX_COMMANDS_PER_DATAGRAM, MAX_MTU, MAX_PEER_ID, MIN_MTU,
    UNASSIGNED_PEER_ID,
};

use crate::channel::{Acceptance, Pending, Ready};
use crate::config::HostConfig;
use crate::congestion::{window_for_bandwidth, CongestionWindow};
use crate::error::{HostError, HostResult};
use crate::event::{Delivery, Event, ServiceEvents};
use crate::fragment::{
    fragment_count, FragmentArena, FragmentError, FragmentKey, Progress, MAX_FRAGMENT_COUNT,
};
use crate::peer::{Farewell, Peer, PeerHandle, PeerState, PeerStats};
use crate::reliability::{Acked, TimeoutOutcome, TimeoutPolicy};
use crate::seq::{time_difference, time_less};
use crate::transport::{BufferPool, Datagram, Transport, UdpTransport};

/// Wire id of a slot index. Slot counts are bounded by [`MAX_PEER_ID`].
fn slot_id(index: usize) -> u16 {
    u16::try_from(index).unwrap_or(UNASSIGNED_PEER_ID)
}

/// Packs encoded commands into datagrams for one peer.
struct Outbox<'a, T: Transport> {
    transport: &'a mut T,
    buf: &'a mut Vec<u8>,
    address: SocketAddr,
    peer_id: u16,
    connect_id: u32,
    sent_time: u32,
    mtu: usize,
    count: usize,
    datagrams: usize,
}

impl<'a, T: Transport> Outbox<'a, T> {
    fn new(
        transport: &'a mut T,
        buf: &'a mut Vec<u8>,
        peer: &Peer,
        address: SocketAddr,
        now: u32,
    ) -> Self {
        buf.clear();
        buf.resize(DATAGRAM_HEADER_SIZE, 0);
        Self {
            transport,
            buf,
            address,
            peer_id: peer.remote_peer_id,
            connect_id: peer.connect_id,
            sent_time: now,
            mtu: usize::from(peer.mtu),
            count: 0,
            datagrams: 0,
        }
    }

    /// Returns `true` if `len` more bytes fit the datagram being built.
    fn fits(&self, len: usize) -> bool {
        self.count < MAX_COMMANDS_PER_DATAGRAM && self.buf.len() + len <= self.mtu
    }

    fn make_room(&mut self, len: usize) {
        if self.count > 0 && !self.fits(len) {
            self.send();
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.make_room(bytes.len());
        self.buf.extend_from_slice(bytes);
        self.count += 1;
    }

    fn push_command(&mut self, command: &Command<'_>) -> Result<(), EncodeError> {
        let len = command.encoded_len();
        self.make_room(len);
        let start = self.buf.len();
        self.buf.resize(start + len, 0);
        encode_command(command, &mut self.buf[start..])?;
        self.count += 1;
        Ok(())
    }

    fn send(&mut self) {
        let count = u8::try_from(self.count).unwrap_or(u8::MAX);
        let header = DatagramHeader::new(count, self.peer_id, self.connect_id, self.sent_time);
        match encode_header(&header, &mut self.buf[..DATAGRAM_HEADER_SIZE]) {
            Ok(_) => {
                trace!(
                    to = %self.address,
                    commands = count,
                    bytes = self.buf.len(),
                    "sending datagram"
                );
                if let Err(err) = self.transport.send(self.address, &self.buf[..]) {
                    warn!(to = %self.address, %err, "datagram send failed");
                }
            }
            Err(err) => warn!(%err, "datagram header encoding failed"),
        }
        self.datagrams += 1;
        self.buf.truncate(DATAGRAM_HEADER_SIZE);
        self.count = 0;
    }

    /// Sends the partial datagram and returns how many were sent.
    fn finish(mut self) -> usize {
        if self.count > 0 {
            self.send();
        }
        self.datagrams
    }
}

/// A connection endpoint multiplexing peers over one [`Transport`].
///
/// All work happens inside [`service`](Self::service) and
/// [`flush`](Self::flush); the host spawns no threads and holds no locks.
pub struct Host<T: Transport> {
    config: HostConfig,
    limits: Limits,
    transport: T,
    peers: Vec<Peer>,
    events: VecDeque<Event>,
    fragments: FragmentArena,
    rng: StdRng,
    epoch: Instant,
    /// Milliseconds since `epoch`, wrapping.
    service_time: u32,
    inbound: Vec<Datagram>,
    buffers: BufferPool,
    datagram: Vec<u8>,
    ready: Vec<Ready>,
    acked: Vec<Acked>,
}

impl Host<UdpTransport> {
    /// Binds a UDP socket and creates a host on it.
    pub fn bind(address: impl ToSocketAddrs, config: HostConfig) -> HostResult<Self> {
        let transport = UdpTransport::bind(address)?;
        Self::new(config, transport)
    }
}

impl<T: Transport> Host<T> {
    pub fn new(config: HostConfig, transport: T) -> HostResult<Self> {
        config.validate()?;
        let peers = (0..config.max_peers).map(|_| Peer::new(0, &config)).collect();
        let rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let epoch = transport.now();
        Ok(Self {
            limits: config.wire_limits(),
            config,
            transport,
            peers,
            events: VecDeque::new(),
            fragments: FragmentArena::new(),
            rng,
            epoch,
            service_time: 0,
            inbound: Vec::new(),
            buffers: BufferPool::new(),
            datagram: Vec::with_capacity(usize::from(MAX_MTU)),
            ready: Vec::new(),
            acked: Vec::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &HostConfig {
        &self.config
    }

    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Handles of every connected peer.
    pub fn connected_peers(&self) -> impl Iterator<Item = PeerHandle> + '_ {
        self.peers
            .iter()
            .enumerate()
            .filter(|(_, peer)| peer.state == PeerState::Connected)
            .map(|(index, peer)| peer.handle(slot_id(index)))
    }

    /// Starts connecting to `address` with `channel_count` channels.
    ///
    /// `data` is delivered to the remote with its `Connect` event. The
    /// returned handle produces `Connect` or `ConnectFailed` later.
    pub fn connect(
        &mut self,
        address: SocketAddr,
        channel_count: u8,
        data: u32,
    ) -> HostResult<PeerHandle> {
        let limit = self.config.channel_limit;
        if channel_count == 0 || channel_count > limit {
            return Err(HostError::InvalidChannelCount {
                requested: channel_count,
                limit,
            });
        }
        let index = self.free_slot().ok_or(HostError::ResourceExhausted {
            capacity: self.peers.len(),
        })?;
        self.sync_clock();

        let connect_id: u32 = self.rng.gen();
        let window = window_for_bandwidth(self.config.outgoing_bandwidth, 0);
        let now = self.service_time;
        let peer = &mut self.peers[index];
        peer.open(address, connect_id, channel_count, self.config.mtu, window, now);
        peer.state = PeerState::Connecting;
        let params = peer.connect_params(slot_id(index), &self.config);
        if let Err(err) = peer.queue_control(CommandBody::Connect { params, data }) {
            self.release(index);
            return Err(err.into());
        }
        debug!(peer = index, %address, connect_id, "connecting");
        Ok(self.peers[index].handle(slot_id(index)))
    }

    /// Queues `payload` for `peer` on `channel`.
    ///
    /// Payloads above the fragment size of the connection's MTU are split
    /// and always sent reliably.
    pub fn send(
        &mut self,
        peer: PeerHandle,
        channel: u8,
        payload: &[u8],
        delivery: Delivery,
    ) -> HostResult<()> {
        let limit = self.config.max_payload_bytes;
        let handle = peer;
        let peer = self.peer_mut(handle)?;
        if peer.state != PeerState::Connected {
            return Err(HostError::NotConnected(handle));
        }
        let count = peer.channel_count();
        if channel >= count {
            return Err(HostError::InvalidChannel { channel, count });
        }
        if payload.len() > limit {
            return Err(HostError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let fragment_size = max_fragment_payload(peer.mtu);
        if payload.len() > fragment_size {
            return queue_fragments(peer, channel, payload, delivery.fragmented(), fragment_size);
        }

        let lane = &mut peer.channels[usize::from(channel)];
        match delivery {
            Delivery::ReliableOrdered | Delivery::ReliableUnordered => {
                let sequence = lane.next_reliable();
                let flags = if delivery.is_ordered() {
                    CommandFlags::reliable()
                } else {
                    CommandFlags::reliable_unordered()
                };
                peer.queue_reliable(&Command {
                    channel,
                    flags,
                    sequence,
                    body: CommandBody::SendReliable { data: payload },
                })?;
            }
            Delivery::UnreliableSequenced => {
                let unreliable_sequence = lane.next_unreliable();
                peer.queue_unreliable(&Command {
                    channel,
                    flags: CommandFlags::unreliable(),
                    sequence: 0,
                    body: CommandBody::SendUnreliable {
                        unreliable_sequence,
                        data: payload,
                    },
                })?;
            }
            Delivery::UnreliableUnordered => {
                peer.outgoing_unsequenced_group = peer.outgoing_unsequenced_group.wrapping_add(1);
                let group = peer.outgoing_unsequenced_group;
                peer.queue_unreliable(&Command {
                    channel,
                    flags: CommandFlags::unreliable(),
                    sequence: 0,
                    body: CommandBody::SendUnsequenced {
                        group,
                        data: payload,
                    },
                })?;
            }
        }
        Ok(())
    }

    /// Runs one service round and returns the queued events.
    ///
    /// The round ticks timers, flushes outgoing commands, waits up to
    /// `timeout` for datagrams (not at all if events are already queued),
    /// dispatches them, flushes the resulting acknowledgements and releases
    /// dead peers.
    pub fn service(&mut self, timeout: Duration) -> HostResult<ServiceEvents<'_>> {
        self.sync_clock();
        self.tick();
        let mut first_error = self.flush_all().err();

        let wait = if self.events.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };
        let mut inbound = std::mem::take(&mut self.inbound);
        let received = self
            .transport
            .poll_receive(wait, &mut self.buffers, &mut inbound);
        self.sync_clock();
        for datagram in inbound.drain(..) {
            self.dispatch(datagram.address, &datagram.payload);
            self.buffers.recycle(datagram.payload);
        }
        self.inbound = inbound;
        if let Err(err) = received {
            first_error = first_error.or(Some(err.into()));
        }

        if let Err(err) = self.flush_all() {
            first_error = first_error.or(Some(err));
        }
        self.purge_zombies();

        match first_error {
            Some(err) => Err(err),
            None => Ok(ServiceEvents::new(&mut self.events)),
        }
    }

    /// Sends every queued command without waiting for datagrams.
    pub fn flush(&mut self) -> HostResult<()> {
        self.sync_clock();
        self.flush_all()
    }

    /// Starts the disconnect handshake.
    ///
    /// A connected peer gets a reliable `Disconnect` and produces a
    /// `Disconnect` event once it is acknowledged; pending outgoing data is
    /// discarded. A peer still in the handshake is released at once without
    /// an event.
    pub fn disconnect(&mut self, peer: PeerHandle, data: u32) -> HostResult<()> {
        let index = self.index_of(peer)?;
        match self.peers[index].state {
            PeerState::Connected => {
                let peer = &mut self.peers[index];
                peer.reset_queues();
                peer.queue_control(CommandBody::Disconnect { data })?;
                peer.state = PeerState::Disconnecting;
                debug!(peer = index, data, "disconnecting");
            }
            PeerState::Connecting | PeerState::AcknowledgingConnect => {
                self.sync_clock();
                self.send_now(index, &Peer::unreliable_disconnect(data));
                self.release(index);
            }
            PeerState::Disconnecting
            | PeerState::AcknowledgingDisconnect
            | PeerState::Zombie
            | PeerState::Disconnected => {}
        }
        Ok(())
    }

    /// Sends a best-effort unreliable `Disconnect` and releases the peer
    /// without an event.
    pub fn disconnect_immediate(&mut self, peer: PeerHandle, data: u32) -> HostResult<()> {
        let index = self.index_of(peer)?;
        if self.peers[index].state != PeerState::Zombie {
            self.sync_clock();
            self.send_now(index, &Peer::unreliable_disconnect(data));
        }
        debug!(peer = index, data, "disconnected immediately");
        self.release(index);
        Ok(())
    }

    /// Releases the peer without notifying the remote.
    pub fn reset(&mut self, peer: PeerHandle) -> HostResult<()> {
        let index = self.index_of(peer)?;
        debug!(peer = index, "reset");
        self.release(index);
        Ok(())
    }

    /// Queues a reliable ping, refreshing the round-trip estimate.
    pub fn ping(&mut self, peer: PeerHandle) -> HostResult<()> {
        let handle = peer;
        let peer = self.peer_mut(handle)?;
        if peer.state != PeerState::Connected {
            return Err(HostError::NotConnected(handle));
        }
        peer.queue_control(CommandBody::Ping)?;
        Ok(())
    }

    pub fn peer_state(&self, peer: PeerHandle) -> HostResult<PeerState> {
        Ok(self.peer(peer)?.state)
    }

    pub fn peer_stats(&self, peer: PeerHandle) -> HostResult<PeerStats> {
        Ok(self.peer(peer)?.stats())
    }

    pub fn peer_address(&self, peer: PeerHandle) -> HostResult<SocketAddr> {
        self.peer(peer)?
            .address
            .ok_or(HostError::StalePeer(peer))
    }

    /// Changes the unreliable throttle parameters and tells the remote.
    pub fn throttle_configure(
        &mut self,
        peer: PeerHandle,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) -> HostResult<()> {
        let handle = peer;
        let peer = self.peer_mut(handle)?;
        if peer.state != PeerState::Connected {
            return Err(HostError::NotConnected(handle));
        }
        peer.throttle.configure(interval, acceleration, deceleration);
        peer.queue_control(CommandBody::ThrottleConfigure {
            interval,
            acceleration,
            deceleration,
        })?;
        Ok(())
    }

    /// Changes this host's bandwidth limits and announces them to every
    /// connected peer. `0` means unlimited.
    pub fn set_bandwidth_limit(&mut self, incoming: u32, outgoing: u32) -> HostResult<()> {
        self.config.incoming_bandwidth = incoming;
        self.config.outgoing_bandwidth = outgoing;
        for peer in &mut self.peers {
            if peer.state != PeerState::Connected {
                continue;
            }
            peer.window
                .set_max(window_for_bandwidth(outgoing, peer.remote_incoming_bandwidth));
            peer.queue_control(CommandBody::BandwidthLimit { incoming, outgoing })?;
        }
        Ok(())
    }

    fn index_of(&self, handle: PeerHandle) -> HostResult<usize> {
        let index = usize::from(handle.index());
        match self.peers.get(index) {
            Some(peer) if peer.generation == handle.generation() && !peer.is_free() => Ok(index),
            _ => Err(HostError::StalePeer(handle)),
        }
    }

    fn peer(&self, handle: PeerHandle) -> HostResult<&Peer> {
        let index = self.index_of(handle)?;
        Ok(&self.peers[index])
    }

    fn peer_mut(&mut self, handle: PeerHandle) -> HostResult<&mut Peer> {
        let index = self.index_of(handle)?;
        Ok(&mut self.peers[index])
    }

    fn free_slot(&self) -> Option<usize> {
        self.peers.iter().position(Peer::is_free)
    }

    /// Frees a slot and bumps its generation.
    fn release(&mut self, index: usize) {
        self.fragments.release_peer(slot_id(index));
        let generation = self.peers[index].generation.wrapping_add(1);
        self.peers[index] = Peer::new(generation, &self.config);
    }

    fn sync_clock(&mut self) {
        let elapsed = self.transport.now().saturating_duration_since(self.epoch);
        self.service_time =
            u32::try_from(elapsed.as_millis() & u128::from(u32::MAX)).unwrap_or_default();
    }

    /// Retransmission, timeout and keep-alive timers.
    fn tick(&mut self) {
        let now = self.service_time;
        let ping_interval = self.config.ping_interval_ms;
        let policy = TimeoutPolicy {
            minimum: self.config.timeout_minimum_ms,
            maximum: self.config.timeout_maximum_ms,
            max_retransmits: self.config.max_retransmits,
        };

        for (index, peer) in self.peers.iter_mut().enumerate() {
            if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
                continue;
            }
            peer.loss.update(now);

            match peer.reliable.check_timeouts(now, policy) {
                TimeoutOutcome::Idle => {}
                TimeoutOutcome::Retransmit { commands, bytes } => {
                    for _ in 0..commands {
                        peer.loss.record_lost();
                    }
                    peer.window.on_requeue(bytes);
                    peer.window.on_loss();
                    trace!(
                        peer = index,
                        commands,
                        window = peer.window.window(),
                        "retransmission timeout"
                    );
                }
                TimeoutOutcome::Failed => {
                    let farewell = match peer.state {
                        PeerState::Connecting => Farewell::ConnectFailed,
                        // The application never saw this connection.
                        PeerState::AcknowledgingConnect => Farewell::Silent,
                        PeerState::Disconnecting => Farewell::Disconnect(0),
                        PeerState::AcknowledgingDisconnect => Farewell::Disconnect(peer.event_data),
                        _ => Farewell::Timeout,
                    };
                    debug!(peer = index, state = ?peer.state, "peer timed out");
                    peer.zombify(farewell);
                    continue;
                }
            }

            if peer.state == PeerState::Connected
                && peer.reliable.is_idle()
                && time_difference(now, peer.last_receive) >= ping_interval
            {
                if let Err(err) = peer.queue_control(CommandBody::Ping) {
                    warn!(peer = index, %err, "failed to queue ping");
                }
            }
        }
    }

    fn flush_all(&mut self) -> HostResult<()> {
        let mut result = Ok(());
        for index in 0..self.peers.len() {
            if let Err(err) = self.flush_peer(index) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Sends acknowledgements, then reliable commands the window admits,
    /// then unreliable commands the throttle admits.
    fn flush_peer(&mut self, index: usize) -> HostResult<()> {
        let now = self.service_time;
        let Self {
            peers,
            transport,
            datagram,
            ..
        } = self;
        let peer = &mut peers[index];
        if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
            return Ok(());
        }
        let Some(address) = peer.address else {
            return Ok(());
        };
        if peer.acks.is_empty() && peer.reliable.front().is_none() && peer.unreliable.is_empty() {
            return Ok(());
        }

        let mut outbox = Outbox::new(transport, datagram, peer, address, now);

        let acks = std::mem::take(&mut peer.acks);
        for &(channel, sent_time) in &acks {
            let Some(ack) = peer.channel_mut(channel).map(|lane| lane.ack(sent_time)) else {
                continue;
            };
            outbox.push_command(&Command {
                channel,
                flags: CommandFlags::unreliable(),
                sequence: 0,
                body: CommandBody::Acknowledge(ack),
            })?;
        }

        while let Some(front) = peer.reliable.front() {
            let len = front.len();
            if !peer.window.admits(len) {
                trace!(peer = index, len, in_flight = peer.window.in_flight(), "window full");
                break;
            }
            let (channel, sequence) = (front.channel, front.sequence);
            if !peer
                .channel_mut(channel)
                .map_or(true, |lane| lane.can_transmit(sequence))
            {
                break;
            }
            let Some(command) = peer.reliable.pop_front() else {
                break;
            };
            outbox.push(&command.bytes);
            peer.window.on_send(len);
            peer.loss.record_sent();
            let rto = peer.rtt.rto();
            peer.reliable.record_sent(command, now, rto);
        }

        while let Some(bytes) = peer.unreliable.pop_front() {
            if !peer.throttle.admit() {
                trace!(peer = index, "throttled unreliable command");
                continue;
            }
            outbox.push(&bytes);
        }

        if outbox.finish() > 0 {
            peer.last_send = now;
        }
        if peer.state == PeerState::AcknowledgingDisconnect && !acks.is_empty() {
            let data = peer.event_data;
            peer.zombify(Farewell::Disconnect(data));
        }
        Ok(())
    }

    /// Sends a single command in its own datagram, bypassing the queues.
    fn send_now(&mut self, index: usize, command: &Command<'_>) {
        let now = self.service_time;
        let Self {
            peers,
            transport,
            datagram,
            ..
        } = self;
        let peer = &peers[index];
        let Some(address) = peer.address else {
            return;
        };
        let mut outbox = Outbox::new(transport, datagram, peer, address, now);
        match outbox.push_command(command) {
            Ok(()) => {
                outbox.finish();
            }
            Err(err) => warn!(peer = index, %err, "failed to encode command"),
        }
    }

    /// Emits one event per zombie and frees its slot.
    fn purge_zombies(&mut self) {
        for index in 0..self.peers.len() {
            let peer = &self.peers[index];
            if peer.state != PeerState::Zombie {
                continue;
            }
            let handle = peer.handle(slot_id(index));
            match peer.farewell.unwrap_or(Farewell::Silent) {
                Farewell::Timeout => self.events.push_back(Event::Timeout { peer: handle }),
                Farewell::ConnectFailed => {
                    self.events.push_back(Event::ConnectFailed { peer: handle });
                }
                Farewell::Disconnect(data) => {
                    self.events
                        .push_back(Event::Disconnect { peer: handle, data });
                }
                Farewell::Silent => {}
            }
            self.release(index);
        }
    }

    fn dispatch(&mut self, address: SocketAddr, payload: &[u8]) {
        let datagram = match decode_datagram(payload, &self.limits) {
            Ok(datagram) => datagram,
            Err(err) => {
                debug!(from = %address, %err, "dropping malformed datagram");
                return;
            }
        };
        let header = datagram.header;

        let index = if header.is_unassigned() {
            match self.route_unassigned(address, &header, &datagram.commands) {
                Some(index) => index,
                None => return,
            }
        } else {
            let index = usize::from(header.peer_id);
            match self.peers.get(index) {
                Some(peer)
                    if !matches!(peer.state, PeerState::Disconnected | PeerState::Zombie)
                        && peer.address == Some(address)
                        && peer.connect_id == header.connect_id => {}
                _ => {
                    trace!(from = %address, peer_id = header.peer_id, "datagram for unknown peer");
                    return;
                }
            }
            index
        };

        self.peers[index].last_receive = self.service_time;
        for command in &datagram.commands {
            if matches!(
                self.peers[index].state,
                PeerState::Disconnected | PeerState::Zombie
            ) {
                break;
            }
            self.handle_command(index, header.sent_time, command);
        }
    }

    /// Finds or creates the peer for a datagram sent before the remote knew
    /// our slot. Only a leading `Connect` may open a slot.
    fn route_unassigned(
        &mut self,
        address: SocketAddr,
        header: &DatagramHeader,
        commands: &[Command<'_>],
    ) -> Option<usize> {
        let Some(Command {
            body: CommandBody::Connect { params, data },
            ..
        }) = commands.first()
        else {
            trace!(from = %address, "unassigned datagram without connect");
            return None;
        };

        let existing = self.peers.iter().position(|peer| {
            !peer.is_free() && peer.address == Some(address) && peer.connect_id == header.connect_id
        });
        if existing.is_some() {
            return existing;
        }
        self.accept_connect(address, header.connect_id, params, *data)
    }

    fn accept_connect(
        &mut self,
        address: SocketAddr,
        connect_id: u32,
        params: &ConnectParams,
        data: u32,
    ) -> Option<usize> {
        if params.channel_count == 0 || params.outgoing_peer_id > MAX_PEER_ID {
            debug!(from = %address, "rejecting connect with invalid parameters");
            return None;
        }
        let Some(index) = self.free_slot() else {
            warn!(
                from = %address,
                capacity = self.peers.len(),
                "no free peer slot, refusing connection"
            );
            return None;
        };

        let channel_count = params.channel_count.min(self.config.channel_limit);
        let mtu = params.mtu.clamp(MIN_MTU, MAX_MTU).min(self.config.mtu);
        let window = window_for_bandwidth(self.config.outgoing_bandwidth, params.incoming_bandwidth)
            .min(params.window_size);
        let now = self.service_time;

        let peer = &mut self.peers[index];
        peer.open(address, connect_id, channel_count, mtu, window, now);
        peer.state = PeerState::AcknowledgingConnect;
        peer.remote_peer_id = params.outgoing_peer_id;
        peer.remote_incoming_bandwidth = params.incoming_bandwidth;
        peer.remote_outgoing_bandwidth = params.outgoing_bandwidth;
        peer.throttle.configure(
            params.throttle_interval,
            params.throttle_acceleration,
            params.throttle_deceleration,
        );
        peer.event_data = data;

        let verify = peer.connect_params(slot_id(index), &self.config);
        if let Err(err) = peer.queue_control(CommandBody::VerifyConnect(verify)) {
            warn!(%err, "failed to queue verify connect");
            self.release(index);
            return None;
        }
        debug!(
            peer = index,
            from = %address,
            connect_id,
            channel_count,
            mtu,
            "accepted connection"
        );
        Some(index)
    }

    fn handle_command(&mut self, index: usize, sent_time: u32, command: &Command<'_>) {
        let kind = command.kind();
        if kind.is_data() {
            let peer = &self.peers[index];
            if peer.state != PeerState::Connected {
                trace!(peer = index, ?kind, state = ?peer.state, "data before connection");
                return;
            }
            if usize::from(command.channel) >= peer.channels.len() {
                debug!(peer = index, channel = command.channel, "command for invalid channel");
                return;
            }
        }

        if !command.flags.is_reliable() {
            self.receive_unreliable(index, command);
            return;
        }

        let acceptance = match self.peers[index].channel_mut(command.channel) {
            Some(lane) => lane.accept_reliable(command.sequence),
            None => return,
        };
        match acceptance {
            Acceptance::New => {}
            Acceptance::Duplicate => {
                trace!(peer = index, sequence = command.sequence, "duplicate reliable command");
                self.peers[index].queue_ack(command.channel, sent_time);
                return;
            }
            Acceptance::OutOfWindow => {
                trace!(peer = index, sequence = command.sequence, "reliable command out of window");
                return;
            }
        }

        let Some(pending) = self.receive_reliable(index, command) else {
            return;
        };
        self.record_reliable(index, command.channel, command.sequence, pending, sent_time);
    }

    /// Stores an accepted reliable command, delivers what became in order
    /// and schedules the acknowledgement.
    fn record_reliable(
        &mut self,
        index: usize,
        channel: u8,
        sequence: u16,
        pending: Pending,
        sent_time: u32,
    ) {
        let Self {
            peers,
            events,
            fragments,
            ready,
            ..
        } = self;
        let peer = &mut peers[index];
        if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
            return;
        }
        let handle = peer.handle(slot_id(index));
        let Some(lane) = peer.channel_mut(channel) else {
            return;
        };
        lane.insert(sequence, pending);
        lane.drain_ready(ready);
        peer.queue_ack(channel, sent_time);

        for item in ready.drain(..) {
            let payload = match item {
                Ready::Payload(payload) => payload,
                Ready::Fragment { start } => {
                    let key = FragmentKey {
                        slot: slot_id(index),
                        channel,
                        start,
                    };
                    let Some(payload) = fragments.take(key) else {
                        continue;
                    };
                    payload
                }
            };
            events.push_back(Event::Receive {
                peer: handle,
                channel,
                delivery: Delivery::ReliableOrdered,
                payload,
            });
        }
    }

    /// Applies a new reliable command. `None` leaves it unacknowledged.
    fn receive_reliable(&mut self, index: usize, command: &Command<'_>) -> Option<Pending> {
        match command.body {
            CommandBody::SendReliable { data } => {
                if command.flags.is_unordered() {
                    self.emit_receive(
                        index,
                        command.channel,
                        Delivery::ReliableUnordered,
                        data.to_vec(),
                    );
                    Some(Pending::Marker)
                } else {
                    Some(Pending::Payload(data.to_vec()))
                }
            }
            CommandBody::SendFragment(fragment) => self.receive_fragment(index, command, &fragment),
            CommandBody::Connect { .. } | CommandBody::Ping => Some(Pending::Marker),
            CommandBody::VerifyConnect(params) => self.handle_verify_connect(index, &params),
            CommandBody::Disconnect { data } => self.handle_disconnect(index, data, true),
            CommandBody::BandwidthLimit { incoming, outgoing } => {
                let local_outgoing = self.config.outgoing_bandwidth;
                let peer = &mut self.peers[index];
                peer.remote_incoming_bandwidth = incoming;
                peer.remote_outgoing_bandwidth = outgoing;
                peer.window
                    .set_max(window_for_bandwidth(local_outgoing, incoming));
                debug!(
                    peer = index,
                    incoming,
                    outgoing,
                    window = peer.window.window(),
                    "bandwidth limit"
                );
                Some(Pending::Marker)
            }
            CommandBody::ThrottleConfigure {
                interval,
                acceleration,
                deceleration,
            } => {
                self.peers[index]
                    .throttle
                    .configure(interval, acceleration, deceleration);
                Some(Pending::Marker)
            }
            CommandBody::Acknowledge(_)
            | CommandBody::SendUnreliable { .. }
            | CommandBody::SendUnsequenced { .. } => None,
        }
    }

    fn receive_fragment(
        &mut self,
        index: usize,
        command: &Command<'_>,
        fragment: &Fragment<'_>,
    ) -> Option<Pending> {
        let number = u16::try_from(fragment.fragment_number).ok()?;
        if command.sequence != fragment.start_sequence.wrapping_add(number) {
            debug!(peer = index, sequence = command.sequence, "fragment sequence mismatch");
            return None;
        }
        let key = FragmentKey {
            slot: slot_id(index),
            channel: command.channel,
            start: fragment.start_sequence,
        };
        // The set at the head of an ordered channel is never refused.
        let head = !command.flags.is_unordered()
            && self.peers[index]
                .channel_mut(command.channel)
                .is_some_and(|lane| lane.next_expected() == fragment.start_sequence);
        let max_sets = if head {
            usize::MAX
        } else {
            self.config.max_fragment_sets_per_peer
        };
        let progress = match self.fragments.insert(key, fragment, max_sets) {
            Ok(progress) => progress,
            Err(FragmentError::Inconsistent) => {
                debug!(peer = index, start = fragment.start_sequence, "inconsistent fragment");
                return None;
            }
            Err(FragmentError::TooManySets { limit }) => {
                warn!(peer = index, limit, "too many partial messages, dropping fragment");
                return None;
            }
        };

        if !command.flags.is_unordered() {
            return Some(Pending::Fragment {
                start: fragment.start_sequence,
                last: fragment.fragment_number + 1 == fragment.fragment_count,
            });
        }
        if progress == Progress::Complete {
            if let Some(payload) = self.fragments.take(key) {
                self.emit_receive(index, command.channel, Delivery::ReliableUnordered, payload);
            }
        }
        Some(Pending::Marker)
    }

    fn receive_unreliable(&mut self, index: usize, command: &Command<'_>) {
        match command.body {
            CommandBody::Acknowledge(ack) => self.handle_ack(index, command.channel, &ack),
            CommandBody::SendUnreliable {
                unreliable_sequence,
                data,
            } => {
                let fresh = self.peers[index]
                    .channel_mut(command.channel)
                    .is_some_and(|lane| lane.accept_unreliable(unreliable_sequence));
                if fresh {
                    self.emit_receive(
                        index,
                        command.channel,
                        Delivery::UnreliableSequenced,
                        data.to_vec(),
                    );
                } else {
                    trace!(peer = index, unreliable_sequence, "dropping stale unreliable command");
                }
            }
            CommandBody::SendUnsequenced { group, data } => {
                if self.peers[index].unsequenced.accept(group) {
                    self.emit_receive(
                        index,
                        command.channel,
                        Delivery::UnreliableUnordered,
                        data.to_vec(),
                    );
                } else {
                    trace!(peer = index, group, "dropping duplicate unsequenced command");
                }
            }
            CommandBody::Disconnect { data } => {
                self.handle_disconnect(index, data, false);
            }
            _ => {}
        }
    }

    fn emit_receive(&mut self, index: usize, channel: u8, delivery: Delivery, payload: Vec<u8>) {
        let peer = self.peers[index].handle(slot_id(index));
        self.events.push_back(Event::Receive {
            peer,
            channel,
            delivery,
            payload,
        });
    }

    fn handle_ack(&mut self, index: usize, channel: u8, ack: &Acknowledge) {
        let now = self.service_time;
        let Self {
            peers,
            events,
            acked,
            ..
        } = self;
        let peer = &mut peers[index];
        if time_less(now, ack.received_sent_time) {
            trace!(peer = index, "acknowledgement from the future");
            return;
        }

        let sample = time_difference(now, ack.received_sent_time);
        let timely = peer.rtt.is_timely(sample);
        let (last_rtt, last_variance) = peer.rtt.previous_epoch();
        peer.throttle.adjust(sample, last_rtt, last_variance);
        peer.rtt.update(sample, now, peer.throttle.interval);
        peer.reliable.clear_earliest_timeout();
        if let Some(lane) = peer.channel_mut(channel) {
            lane.note_remote_ack(ack.cumulative);
        }

        acked.clear();
        peer.reliable.acknowledge(channel, ack, acked);
        let handle = peer.handle(slot_id(index));
        for done in acked.iter() {
            if done.in_flight {
                peer.window.on_ack(done.len, timely);
            }
            match (done.kind, peer.state) {
                (CommandKind::VerifyConnect, PeerState::AcknowledgingConnect) => {
                    peer.state = PeerState::Connected;
                    events.push_back(Event::Connect {
                        peer: handle,
                        data: peer.event_data,
                    });
                    debug!(peer = index, "connected");
                }
                (CommandKind::Disconnect, PeerState::Disconnecting) => {
                    debug!(peer = index, "disconnect acknowledged");
                    peer.zombify(Farewell::Disconnect(0));
                }
                _ => {}
            }
        }
    }

    fn handle_verify_connect(&mut self, index: usize, params: &ConnectParams) -> Option<Pending> {
        let Self {
            peers,
            events,
            acked,
            ..
        } = self;
        let peer = &mut peers[index];
        if peer.state != PeerState::Connecting {
            return Some(Pending::Marker);
        }

        let valid = (1..=peer.channel_count()).contains(&params.channel_count)
            && (MIN_MTU..=MAX_MTU).contains(&params.mtu)
            && params.outgoing_peer_id <= MAX_PEER_ID
            && params.throttle_interval == peer.throttle.interval
            && params.throttle_acceleration == peer.throttle.acceleration
            && params.throttle_deceleration == peer.throttle.deceleration;
        if !valid {
            debug!(peer = index, "verify connect does not match the request");
            peer.zombify(Farewell::ConnectFailed);
            return None;
        }

        acked.clear();
        peer.reliable.remove_kind(CommandKind::Connect, acked);
        peer.channels.truncate(usize::from(params.channel_count));
        peer.remote_peer_id = params.outgoing_peer_id;
        peer.remote_incoming_bandwidth = params.incoming_bandwidth;
        peer.remote_outgoing_bandwidth = params.outgoing_bandwidth;
        peer.mtu = peer.mtu.min(params.mtu);
        let window = peer.window.window().min(params.window_size);
        peer.window = CongestionWindow::new(window, peer.mtu);
        peer.state = PeerState::Connected;

        events.push_back(Event::Connect {
            peer: peer.handle(slot_id(index)),
            data: 0,
        });
        debug!(peer = index, channels = params.channel_count, mtu = peer.mtu, "connected");
        Some(Pending::Marker)
    }

    /// Applies a remote `Disconnect`. `None` when the peer no longer
    /// needs the command acknowledged.
    fn handle_disconnect(&mut self, index: usize, data: u32, reliable: bool) -> Option<Pending> {
        let state = self.peers[index].state;
        debug!(peer = index, ?state, data, reliable, "remote disconnect");
        match state {
            PeerState::AcknowledgingConnect => {
                self.release(index);
                None
            }
            PeerState::Connecting => {
                self.peers[index].zombify(Farewell::ConnectFailed);
                None
            }
            PeerState::Disconnecting => {
                self.peers[index].zombify(Farewell::Disconnect(data));
                None
            }
            PeerState::Connected => {
                let peer = &mut self.peers[index];
                peer.reset_queues();
                if reliable {
                    peer.state = PeerState::AcknowledgingDisconnect;
                    peer.event_data = data;
                    Some(Pending::Marker)
                } else {
                    peer.zombify(Farewell::Disconnect(data));
                    None
                }
            }
            PeerState::AcknowledgingDisconnect => Some(Pending::Marker),
            PeerState::Disconnected | PeerState::Zombie => None,
        }
    }
}

/// Splits `payload` into reliable fragments on consecutive sequences.
fn queue_fragments(
    peer: &mut Peer,
    channel: u8,
    payload: &[u8],
    delivery: Delivery,
    fragment_size: usize,
) -> HostResult<()> {
    let too_large = || HostError::PayloadTooLarge {
        size: payload.len(),
        limit: fragment_size.saturating_mul(MAX_FRAGMENT_COUNT as usize),
    };
    let fragment_count =
        u32::try_from(fragment_count(payload.len(), fragment_size)).map_err(|_| too_large())?;
    if fragment_count > MAX_FRAGMENT_COUNT {
        return Err(too_large());
    }
    let total_length = u32::try_from(payload.len()).map_err(|_| too_large())?;
    let flags = if delivery.is_ordered() {
        CommandFlags::reliable()
    } else {
        CommandFlags::reliable_unordered()
    };

    let lane = usize::from(channel);
    let mut start_sequence = 0;
    let mut fragment_offset = 0u32;
    for (number, data) in (0u32..).zip(payload.chunks(fragment_size)) {
        let sequence = peer.channels[lane].next_reliable();
        if number == 0 {
            start_sequence = sequence;
        }
        peer.queue_reliable(&Command {
            channel,
            flags,
            sequence,
            body: CommandBody::SendFragment(Fragment {
                start_sequence,
                fragment_count,
                fragment_number: number,
                total_length,
                fragment_offset,
                data,
            }),
        })?;
        fragment_offset += u32::try_from(data.len()).map_err(|_| too_large())?;
    }
    trace!(channel, fragment_count, total_length, "queued fragmented payload");
    Ok(())
}
