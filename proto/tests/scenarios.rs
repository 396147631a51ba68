use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use proto::{
    Delivery, Event, Host, HostConfig, HostError, PeerHandle, PeerState, SimNetwork, SimPacket,
    SimTransport,
};
use tracing_subscriber::EnvFilter;
use wire::{
    decode_datagram, encode_datagram, encoded_len, max_fragment_payload, Command, CommandBody,
    CommandFlags, ConnectParams, DatagramHeader, Limits, MIN_WINDOW_SIZE, SYSTEM_CHANNEL,
};

const TICK: Duration = Duration::from_millis(10);
const SLOW_TICK: Duration = Duration::from_millis(100);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client_addr() -> SocketAddr {
    "192.0.2.1:4000".parse().unwrap()
}

fn server_addr() -> SocketAddr {
    "192.0.2.2:5000".parse().unwrap()
}

fn late_addr() -> SocketAddr {
    "192.0.2.3:6000".parse().unwrap()
}

fn host(network: &SimNetwork, address: SocketAddr, config: HostConfig) -> Host<SimTransport> {
    Host::new(config, network.endpoint(address)).unwrap()
}

fn drain(host: &mut Host<SimTransport>, events: &mut Vec<Event>) {
    events.extend(host.service(Duration::ZERO).unwrap());
}

fn encode(header: &DatagramHeader, commands: &[Command<'_>]) -> Vec<u8> {
    let mut buf = vec![0u8; encoded_len(commands)];
    let len = encode_datagram(header, commands, &mut buf).unwrap();
    buf.truncate(len);
    buf
}

struct Harness {
    network: SimNetwork,
    client: Host<SimTransport>,
    server: Host<SimTransport>,
    client_peer: PeerHandle,
    server_peer: PeerHandle,
    client_events: Vec<Event>,
    server_events: Vec<Event>,
}

impl Harness {
    fn connected(channels: u8) -> Self {
        init_tracing();
        let network = SimNetwork::new(11);
        let config = HostConfig::for_testing();
        let mut client = Host::new(config.clone(), network.endpoint(client_addr())).unwrap();
        let mut server = Host::new(config, network.endpoint(server_addr())).unwrap();
        let client_peer = client.connect(server_addr(), channels, 0).unwrap();

        let mut server_peer = None;
        for _ in 0..20 {
            client.service(Duration::ZERO).unwrap().for_each(drop);
            for event in server.service(Duration::ZERO).unwrap() {
                if let Event::Connect { peer, .. } = event {
                    server_peer = Some(peer);
                }
            }
            network.advance(TICK);
        }

        Self {
            network,
            client,
            server,
            client_peer,
            server_peer: server_peer.expect("server never saw the connection"),
            client_events: Vec::new(),
            server_events: Vec::new(),
        }
    }

    fn pump(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.step();
        }
    }

    fn step(&mut self) {
        self.client_events
            .extend(self.client.service(Duration::ZERO).unwrap());
        self.server_events
            .extend(self.server.service(Duration::ZERO).unwrap());
        self.network.advance(TICK);
    }

    fn server_payloads(&self, channel: u8) -> Vec<Vec<u8>> {
        self.server_events
            .iter()
            .filter_map(|event| match event {
                Event::Receive {
                    channel: c,
                    payload,
                    ..
                } if *c == channel => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Records every client-to-server datagram while letting it through.
fn capture(network: &SimNetwork) -> Rc<RefCell<Vec<Vec<u8>>>> {
    let captured = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&captured);
    network.set_filter(move |packet: &SimPacket| {
        if packet.from == client_addr() {
            sink.borrow_mut().push(packet.payload.clone());
        }
        true
    });
    captured
}

fn count_commands(
    datagrams: &[Vec<u8>],
    mut predicate: impl FnMut(&CommandBody<'_>) -> bool,
) -> usize {
    let limits = Limits::unlimited();
    datagrams
        .iter()
        .filter_map(|bytes| decode_datagram(bytes, &limits).ok())
        .flat_map(|datagram| datagram.commands)
        .filter(|command| predicate(&command.body))
        .count()
}

#[test]
fn dropped_hello_is_delivered_exactly_once() {
    let mut harness = Harness::connected(2);
    harness.network.drop_next(client_addr(), server_addr(), 1);
    harness
        .client
        .send(harness.client_peer, 1, b"hello", Delivery::ReliableOrdered)
        .unwrap();

    harness.pump(300);

    assert_eq!(harness.server_payloads(1), vec![b"hello".to_vec()]);
    assert!(harness.server_payloads(0).is_empty());
    assert!(harness.network.stats().dropped >= 1);
    let stats = harness.client.peer_stats(harness.client_peer).unwrap();
    assert!(stats.packets_lost >= 1);
    assert_eq!(stats.unacknowledged_reliable, 0);
}

#[test]
fn silent_peer_times_out_exactly_once() {
    let mut harness = Harness::connected(1);
    harness.network.set_isolated(server_addr(), true);
    harness
        .client
        .send(harness.client_peer, 0, b"anyone there", Delivery::ReliableOrdered)
        .unwrap();

    // Ten virtual seconds per hundred rounds.
    for _ in 0..1_000 {
        harness
            .client_events
            .extend(harness.client.service(Duration::ZERO).unwrap());
        harness.network.advance(Duration::from_millis(100));
    }

    assert_eq!(
        harness.client_events,
        vec![Event::Timeout {
            peer: harness.client_peer
        }]
    );
    assert!(matches!(
        harness
            .client
            .send(harness.client_peer, 0, b"late", Delivery::ReliableOrdered),
        Err(HostError::StalePeer(_))
    ));
}

#[test]
fn fragmentation_boundary() {
    let mut harness = Harness::connected(1);
    let mtu = harness
        .client
        .peer_stats(harness.client_peer)
        .unwrap()
        .mtu;
    let max_payload = max_fragment_payload(mtu);
    let captured = capture(&harness.network);

    let whole: Vec<u8> = (0..max_payload).map(|n| (n % 256) as u8).collect();
    harness
        .client
        .send(harness.client_peer, 0, &whole, Delivery::ReliableOrdered)
        .unwrap();
    harness.pump(5);
    assert_eq!(
        count_commands(&captured.borrow(), |body| matches!(body, CommandBody::SendFragment(_))),
        0
    );
    assert_eq!(harness.server_payloads(0), vec![whole.clone()]);

    captured.borrow_mut().clear();
    harness.server_events.clear();
    let split: Vec<u8> = (0..=max_payload).map(|n| (n % 253) as u8).collect();
    harness
        .client
        .send(harness.client_peer, 0, &split, Delivery::ReliableOrdered)
        .unwrap();
    harness.pump(5);
    assert_eq!(
        count_commands(&captured.borrow(), |body| matches!(body, CommandBody::SendFragment(_))),
        2
    );
    assert_eq!(harness.server_payloads(0), vec![split]);
}

#[test]
fn window_shrinks_and_defers_sends() {
    let mut harness = Harness::connected(1);
    let initial = harness
        .client
        .peer_stats(harness.client_peer)
        .unwrap()
        .window_size;
    assert!(initial > MIN_WINDOW_SIZE);

    let blocked = Rc::new(RefCell::new(true));
    let gate = Rc::clone(&blocked);
    harness.network.set_filter(move |packet: &SimPacket| {
        !(*gate.borrow() && packet.from == client_addr())
    });

    harness
        .client
        .send(harness.client_peer, 0, &[0; 500], Delivery::ReliableOrdered)
        .unwrap();
    let mut rounds = 0;
    while harness
        .client
        .peer_stats(harness.client_peer)
        .unwrap()
        .window_size
        > MIN_WINDOW_SIZE
    {
        harness.step();
        rounds += 1;
        assert!(rounds < 2_000, "window never shrank");
    }
    let stats = harness.client.peer_stats(harness.client_peer).unwrap();
    assert_eq!(stats.window_size, initial / 8);
    assert!(stats.packets_lost >= 3);

    for n in 1..=10u8 {
        harness
            .client
            .send(harness.client_peer, 0, &[n; 500], Delivery::ReliableOrdered)
            .unwrap();
    }
    harness.client.flush().unwrap();
    let stats = harness.client.peer_stats(harness.client_peer).unwrap();
    assert!(stats.queued_reliable > 0, "{stats:?}");
    assert!(stats.reliable_in_flight <= stats.window_size);

    *blocked.borrow_mut() = false;
    harness.pump(3_000);

    let stats = harness.client.peer_stats(harness.client_peer).unwrap();
    assert_eq!(stats.queued_reliable, 0);
    assert_eq!(stats.unacknowledged_reliable, 0);
    let expected: Vec<Vec<u8>> = (0..=10u8).map(|n| vec![n; 500]).collect();
    assert_eq!(harness.server_payloads(0), expected);
    assert!(harness.client_events.is_empty());
}

#[test]
fn replayed_datagrams_deliver_at_most_once() {
    let mut harness = Harness::connected(2);
    let captured = capture(&harness.network);
    let peer = harness.client_peer;
    harness
        .client
        .send(peer, 0, b"reliable", Delivery::ReliableOrdered)
        .unwrap();
    harness
        .client
        .send(peer, 0, b"unordered", Delivery::ReliableUnordered)
        .unwrap();
    harness
        .client
        .send(peer, 1, b"sequenced", Delivery::UnreliableSequenced)
        .unwrap();
    harness
        .client
        .send(peer, 1, b"unsequenced", Delivery::UnreliableUnordered)
        .unwrap();
    harness.pump(10);

    harness.network.clear_filter();
    let replay = captured.borrow().clone();
    assert!(!replay.is_empty());
    for _ in 0..2 {
        for datagram in &replay {
            harness
                .network
                .inject(client_addr(), server_addr(), datagram.clone());
        }
        harness.pump(3);
    }

    let mut payloads = harness.server_payloads(0);
    payloads.extend(harness.server_payloads(1));
    payloads.sort();
    let mut expected: Vec<Vec<u8>> = [&b"reliable"[..], b"unordered", b"sequenced", b"unsequenced"]
        .iter()
        .map(|p| p.to_vec())
        .collect();
    expected.sort();
    assert_eq!(payloads, expected);
}

#[test]
fn handles_do_not_survive_their_connection() {
    let mut harness = Harness::connected(1);
    let server_peer = harness.server_peer;
    harness.client.disconnect(harness.client_peer, 99).unwrap();
    harness.pump(10);

    assert_eq!(
        harness.server_events,
        vec![Event::Disconnect {
            peer: server_peer,
            data: 99
        }]
    );
    assert!(matches!(
        harness.server.send(server_peer, 0, b"gone", Delivery::ReliableOrdered),
        Err(HostError::StalePeer(_))
    ));

    let again = harness.client.connect(server_addr(), 1, 5).unwrap();
    harness.pump(10);
    assert!(harness
        .client_events
        .iter()
        .any(|event| matches!(event, Event::Connect { peer, .. } if *peer == again)));
    let reconnected = harness
        .server_events
        .iter()
        .find_map(|event| match event {
            Event::Connect { peer, data: 5 } => Some(*peer),
            _ => None,
        })
        .unwrap();
    assert_ne!(reconnected, server_peer);
}

#[test]
fn ordered_fragments_survive_a_lost_head() {
    let mut harness = Harness::connected(1);
    let peer = harness.client_peer;
    harness.network.drop_next(client_addr(), server_addr(), 2);
    let expected: Vec<Vec<u8>> = (0..40u8).map(|n| vec![n; 700]).collect();
    for payload in &expected {
        harness
            .client
            .send(peer, 0, payload, Delivery::ReliableOrdered)
            .unwrap();
    }

    harness.pump(6_000);

    assert_eq!(harness.server_payloads(0), expected);
    assert!(harness.client_events.is_empty(), "{:?}", harness.client_events);
    assert_eq!(harness.client.peer_state(peer).unwrap(), PeerState::Connected);
}

/// A client whose `Connect` went out to a server that never answers, plus
/// the header and parameters it sent.
fn pending_connect(
    network: &SimNetwork,
) -> (Host<SimTransport>, PeerHandle, DatagramHeader, ConnectParams) {
    init_tracing();
    let mut client = host(network, client_addr(), HostConfig::for_testing());
    let captured = capture(network);
    let peer = client.connect(server_addr(), 2, 0).unwrap();
    client.service(Duration::ZERO).unwrap().for_each(drop);
    network.clear_filter();

    let bytes = captured.borrow()[0].clone();
    let datagram = decode_datagram(&bytes, &Limits::unlimited()).unwrap();
    let CommandBody::Connect { params, .. } = datagram.commands[0].body else {
        panic!("first datagram is not a connect: {:?}", datagram.commands);
    };
    (client, peer, datagram.header, params)
}

#[test]
fn mismatched_verify_connect_fails_the_handshake() {
    let network = SimNetwork::new(3);
    let (mut client, peer, sent, params) = pending_connect(&network);

    let verify = ConnectParams {
        channel_count: params.channel_count + 1,
        outgoing_peer_id: 0,
        ..params
    };
    let header = DatagramHeader::new(1, params.outgoing_peer_id, sent.connect_id, 0);
    network.inject(
        server_addr(),
        client_addr(),
        encode(&header, &[Command::control(1, CommandBody::VerifyConnect(verify))]),
    );

    let mut events = Vec::new();
    for _ in 0..5 {
        drain(&mut client, &mut events);
        network.advance(TICK);
    }
    assert_eq!(events, vec![Event::ConnectFailed { peer }]);
    assert!(matches!(client.peer_state(peer), Err(HostError::StalePeer(_))));
}

#[test]
fn disconnect_during_handshake_fails_the_connect() {
    let network = SimNetwork::new(4);
    let (mut client, peer, sent, params) = pending_connect(&network);

    let header = DatagramHeader::new(1, params.outgoing_peer_id, sent.connect_id, 0);
    let disconnect = Command {
        channel: SYSTEM_CHANNEL,
        flags: CommandFlags::unreliable(),
        sequence: 0,
        body: CommandBody::Disconnect { data: 9 },
    };
    network.inject(server_addr(), client_addr(), encode(&header, &[disconnect]));

    let mut events = Vec::new();
    for _ in 0..5 {
        drain(&mut client, &mut events);
        network.advance(TICK);
    }
    assert_eq!(events, vec![Event::ConnectFailed { peer }]);
}

#[test]
fn duplicate_connect_is_ignored() {
    init_tracing();
    let network = SimNetwork::new(5);
    let mut client = host(&network, client_addr(), HostConfig::for_testing());
    let mut server = host(&network, server_addr(), HostConfig::for_testing());
    let captured = capture(&network);
    let peer = client.connect(server_addr(), 1, 7).unwrap();

    let (mut client_events, mut server_events) = (Vec::new(), Vec::new());
    for _ in 0..20 {
        drain(&mut client, &mut client_events);
        drain(&mut server, &mut server_events);
        network.advance(TICK);
    }
    let hello = captured.borrow()[0].clone();
    network.clear_filter();
    for _ in 0..3 {
        network.inject(client_addr(), server_addr(), hello.clone());
        for _ in 0..5 {
            drain(&mut client, &mut client_events);
            drain(&mut server, &mut server_events);
            network.advance(TICK);
        }
    }

    let connects: Vec<&Event> = server_events
        .iter()
        .filter(|event| matches!(event, Event::Connect { data: 7, .. }))
        .collect();
    assert_eq!(connects.len(), 1, "{server_events:?}");
    assert_eq!(server_events.len(), 1);
    assert_eq!(server.connected_peers().count(), 1);
    assert_eq!(client_events, vec![Event::Connect { peer, data: 0 }]);
}

#[test]
fn abandoned_inbound_handshake_is_released_silently() {
    init_tracing();
    let network = SimNetwork::new(6);
    let single = HostConfig {
        max_peers: 1,
        ..HostConfig::for_testing()
    };
    let mut client = host(&network, client_addr(), HostConfig::for_testing());
    let mut server = host(&network, server_addr(), single);
    network.set_filter(|packet: &SimPacket| packet.from != server_addr());
    let peer = client.connect(server_addr(), 1, 0).unwrap();

    let (mut client_events, mut server_events) = (Vec::new(), Vec::new());
    for _ in 0..1_500 {
        drain(&mut client, &mut client_events);
        drain(&mut server, &mut server_events);
        network.advance(SLOW_TICK);
    }
    assert_eq!(client_events, vec![Event::ConnectFailed { peer }]);
    assert!(server_events.is_empty(), "{server_events:?}");

    // The only slot is free again.
    network.clear_filter();
    let mut late = host(&network, late_addr(), HostConfig::for_testing());
    let late_peer = late.connect(server_addr(), 1, 3).unwrap();
    let mut late_events = Vec::new();
    for _ in 0..20 {
        drain(&mut late, &mut late_events);
        drain(&mut server, &mut server_events);
        network.advance(TICK);
    }
    assert_eq!(late_events, vec![Event::Connect { peer: late_peer, data: 0 }]);
    assert!(matches!(server_events[..], [Event::Connect { data: 3, .. }]));
}

#[test]
fn connect_over_capacity_leaves_existing_peers_alone() {
    init_tracing();
    let network = SimNetwork::new(8);
    let single = HostConfig {
        max_peers: 1,
        ..HostConfig::for_testing()
    };
    let mut client = host(&network, client_addr(), HostConfig::for_testing());
    let mut server = host(&network, server_addr(), single);
    let mut late = host(&network, late_addr(), HostConfig::for_testing());
    let peer = client.connect(server_addr(), 1, 0).unwrap();

    let (mut client_events, mut server_events, mut late_events) =
        (Vec::new(), Vec::new(), Vec::new());
    for _ in 0..20 {
        drain(&mut client, &mut client_events);
        drain(&mut server, &mut server_events);
        network.advance(TICK);
    }
    assert_eq!(client_events, vec![Event::Connect { peer, data: 0 }]);
    client_events.clear();
    server_events.clear();

    let refused = late.connect(server_addr(), 1, 0).unwrap();
    for _ in 0..1_000 {
        drain(&mut client, &mut client_events);
        drain(&mut server, &mut server_events);
        drain(&mut late, &mut late_events);
        network.advance(SLOW_TICK);
    }
    assert_eq!(late_events, vec![Event::ConnectFailed { peer: refused }]);
    assert!(client_events.is_empty(), "{client_events:?}");
    assert!(server_events.is_empty(), "{server_events:?}");

    client
        .send(peer, 0, b"still here", Delivery::ReliableOrdered)
        .unwrap();
    for _ in 0..20 {
        drain(&mut client, &mut client_events);
        drain(&mut server, &mut server_events);
        network.advance(TICK);
    }
    assert!(matches!(
        &server_events[..],
        [Event::Receive { payload, .. }] if payload == b"still here"
    ));
}
