use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use proptest::prelude::*;
use proto::{Delivery, Event, Host, HostConfig, LinkConditioner, PeerHandle, SimNetwork};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([198, 51, 100, 7], port))
}

#[derive(Debug, Clone)]
struct Message {
    channel: u8,
    delivery: Delivery,
    payload: Vec<u8>,
}

fn delivery_strategy() -> impl Strategy<Value = Delivery> {
    prop_oneof![
        3 => Just(Delivery::ReliableOrdered),
        1 => Just(Delivery::ReliableUnordered),
        1 => Just(Delivery::UnreliableSequenced),
        1 => Just(Delivery::UnreliableUnordered),
    ]
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (
        0u8..2,
        delivery_strategy(),
        prop_oneof![
            4 => prop::collection::vec(any::<u8>(), 0..64),
            1 => prop::collection::vec(any::<u8>(), 500..2_000),
        ],
    )
        .prop_map(|(channel, delivery, payload)| Message {
            channel,
            delivery,
            payload,
        })
}

/// Prefixes every payload with its index so copies can be told apart.
fn tagged(index: usize, message: &Message) -> Vec<u8> {
    let mut payload = u32::try_from(index).unwrap().to_be_bytes().to_vec();
    payload.extend_from_slice(&message.payload);
    payload
}

fn tag_of(payload: &[u8]) -> usize {
    u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize
}

struct Outcome {
    received: Vec<(u8, Delivery, Vec<u8>)>,
    failed: bool,
}

fn run(seed: u64, conditioner: LinkConditioner, messages: &[Message]) -> Outcome {
    init_tracing();
    let network = SimNetwork::new(seed);
    let config = HostConfig {
        seed: Some(seed),
        ..HostConfig::for_testing()
    };
    let mut client = Host::new(config.clone(), network.endpoint(addr(1))).unwrap();
    let mut server = Host::new(config, network.endpoint(addr(2))).unwrap();
    let peer: PeerHandle = client.connect(addr(2), 2, 0).unwrap();

    // Handshake on a clean link, then turn the faults on.
    for _ in 0..20 {
        client.service(Duration::ZERO).unwrap().for_each(drop);
        server.service(Duration::ZERO).unwrap().for_each(drop);
        network.advance(Duration::from_millis(10));
    }
    network.set_conditioner(conditioner);

    for (index, message) in messages.iter().enumerate() {
        client
            .send(peer, message.channel, &tagged(index, message), message.delivery)
            .unwrap();
    }

    let mut outcome = Outcome {
        received: Vec::new(),
        failed: false,
    };
    for _ in 0..3_000 {
        for event in client.service(Duration::ZERO).unwrap() {
            if matches!(event, Event::Timeout { .. } | Event::Disconnect { .. }) {
                outcome.failed = true;
            }
        }
        for event in server.service(Duration::ZERO).unwrap() {
            if let Event::Receive {
                channel,
                delivery,
                payload,
                ..
            } = event
            {
                outcome.received.push((channel, delivery, payload));
            }
        }
        let stats = client.peer_stats(peer);
        if stats.map_or(true, |stats| {
            stats.queued_reliable == 0 && stats.unacknowledged_reliable == 0
        }) && network.in_flight() == 0
        {
            break;
        }
        network.advance(Duration::from_millis(10));
    }
    outcome
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn reliable_delivery_survives_faults(
        seed in any::<u64>(),
        messages in prop::collection::vec(message_strategy(), 1..40),
        loss in 0.0f64..0.05,
        duplicate in 0.0f64..0.1,
        jitter_ms in 0u64..30,
    ) {
        let conditioner = LinkConditioner {
            latency_ms: 5,
            jitter_ms,
            loss,
            duplicate,
        };
        let outcome = run(seed, conditioner, &messages);
        prop_assert!(!outcome.failed);

        let mut seen = HashSet::new();
        let mut last_ordered = [None::<usize>; 2];
        for (channel, _, payload) in &outcome.received {
            let tag = tag_of(payload);
            // Never an unsent payload, never a second copy.
            prop_assert!(tag < messages.len());
            prop_assert!(seen.insert(tag), "payload {} delivered twice", tag);
            let sent = &messages[tag];
            prop_assert_eq!(*channel, sent.channel);
            prop_assert_eq!(&payload[4..], &sent.payload[..]);

            if sent.delivery == Delivery::ReliableOrdered {
                let last = &mut last_ordered[usize::from(*channel)];
                prop_assert!(last.map_or(true, |last| last < tag));
                *last = Some(tag);
            }
        }

        for (tag, message) in messages.iter().enumerate() {
            if message.delivery.is_reliable() {
                prop_assert!(seen.contains(&tag), "reliable payload {} lost", tag);
            }
        }
    }
}

#[test]
fn unreliable_unordered_never_duplicates() {
    let messages: Vec<Message> = (0..200u8)
        .map(|n| Message {
            channel: n % 2,
            delivery: Delivery::UnreliableUnordered,
            payload: vec![n; 16],
        })
        .collect();
    let conditioner = LinkConditioner {
        latency_ms: 5,
        jitter_ms: 40,
        loss: 0.2,
        duplicate: 0.5,
    };
    let outcome = run(99, conditioner, &messages);

    let mut seen = HashSet::new();
    for (_, delivery, payload) in &outcome.received {
        assert_eq!(*delivery, Delivery::UnreliableUnordered);
        let tag = tag_of(payload);
        assert!(tag < messages.len());
        assert!(seen.insert(tag), "payload {tag} delivered twice");
    }
    assert!(!seen.is_empty());
}
