//! Two hosts exchanging messages over a simulated lossy network.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use proto::{
    Delivery, Event, Host, HostConfig, LinkConditioner, PeerStats, SimNetwork, SimStats,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Parameters of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    pub messages: usize,
    pub payload_len: usize,
    pub channels: u8,
    pub delivery: Delivery,
    pub link: LinkConditioner,
    pub host: HostConfig,
    /// Virtual milliseconds per service round.
    pub step_ms: u64,
    /// Rounds after which the run gives up.
    pub max_steps: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            messages: 100,
            payload_len: 64,
            channels: 2,
            delivery: Delivery::ReliableOrdered,
            link: LinkConditioner {
                latency_ms: 30,
                jitter_ms: 20,
                loss: 0.05,
                duplicate: 0.01,
            },
            host: HostConfig::default(),
            step_ms: 5,
            max_steps: 100_000,
        }
    }
}

/// What happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    pub connected: bool,
    pub sent: usize,
    pub delivered: usize,
    pub duplicates: usize,
    /// Ordered payloads that arrived after a later one on their channel.
    pub out_of_order: usize,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub network: SimStats,
    pub sender: Option<PeerStats>,
}

impl SimulationReport {
    /// Returns `true` if the run met the guarantees of its delivery mode.
    #[must_use]
    pub fn is_healthy(&self, delivery: Delivery) -> bool {
        let complete = !delivery.is_reliable() || self.delivered == self.sent;
        let ordered = !delivery.is_ordered() || self.out_of_order == 0;
        self.connected && !self.timed_out && self.duplicates == 0 && complete && ordered
    }
}

fn endpoint(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Payload `index` on its channel: an index header padded to `len`.
fn payload(index: usize, len: usize) -> Vec<u8> {
    let mut bytes = u32::try_from(index).unwrap_or(u32::MAX).to_be_bytes().to_vec();
    bytes.resize(len.max(bytes.len()), u8::try_from(index % 251).unwrap_or(0));
    bytes
}

fn payload_index(payload: &[u8]) -> Option<usize> {
    let prefix: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    usize::try_from(u32::from_be_bytes(prefix)).ok()
}

pub fn simulate(config: &SimulationConfig) -> Result<SimulationReport> {
    if config.channels == 0 {
        bail!("simulation needs at least one channel");
    }
    let network = SimNetwork::new(config.seed);
    let host_config = HostConfig {
        seed: Some(config.seed),
        ..config.host.clone()
    };
    let mut client = Host::new(host_config.clone(), network.endpoint(endpoint(1)))
        .context("create client host")?;
    let mut server =
        Host::new(host_config, network.endpoint(endpoint(2))).context("create server host")?;
    network.set_conditioner(config.link.clone());

    let step = Duration::from_millis(config.step_ms.max(1));
    let peer = client.connect(endpoint(2), config.channels, 0)?;
    let mut report = SimulationReport {
        connected: false,
        sent: 0,
        delivered: 0,
        duplicates: 0,
        out_of_order: 0,
        elapsed_ms: 0,
        timed_out: false,
        network: SimStats::default(),
        sender: None,
    };
    let mut seen = HashSet::new();
    let mut last_ordered = vec![None::<usize>; usize::from(config.channels)];

    for _ in 0..config.max_steps {
        let events: Vec<Event> = client.service(Duration::ZERO)?.collect();
        for event in events {
            match event {
                Event::Connect { .. } => {
                    report.connected = true;
                    info!("connected after {} ms", network.elapsed().as_millis());
                    for index in 0..config.messages {
                        let channel = u8::try_from(index % usize::from(config.channels))?;
                        client.send(
                            peer,
                            channel,
                            &payload(index, config.payload_len),
                            config.delivery,
                        )?;
                    }
                    report.sent = config.messages;
                }
                Event::Timeout { .. } | Event::ConnectFailed { .. } | Event::Disconnect { .. } => {
                    report.timed_out = true;
                }
                Event::Receive { .. } => {}
            }
        }
        for event in server.service(Duration::ZERO)? {
            if let Event::Receive {
                channel, payload, ..
            } = event
            {
                let Some(index) = payload_index(&payload) else {
                    continue;
                };
                if !seen.insert(index) {
                    report.duplicates += 1;
                    continue;
                }
                report.delivered += 1;
                let last = &mut last_ordered[usize::from(channel)];
                if last.is_some_and(|last| last > index) {
                    report.out_of_order += 1;
                }
                *last = Some(index);
            }
        }

        if report.timed_out {
            break;
        }
        let idle = client
            .peer_stats(peer)
            .is_ok_and(|stats| stats.queued_reliable == 0 && stats.unacknowledged_reliable == 0);
        if report.connected && idle && network.in_flight() == 0 {
            break;
        }
        network.advance(step);
    }

    report.elapsed_ms = u64::try_from(network.elapsed().as_millis()).unwrap_or(u64::MAX);
    report.network = network.stats();
    report.sender = client.peer_stats(peer).ok();
    debug!(?report, "simulation finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lossy_link_still_delivers_everything_in_order() {
        let config = SimulationConfig {
            messages: 50,
            host: HostConfig::for_testing(),
            ..SimulationConfig::default()
        };
        let report = simulate(&config).unwrap();
        assert!(report.is_healthy(config.delivery), "{report:?}");
        assert_eq!(report.delivered, 50);
        assert!(report.network.sent > 0);
    }

    #[test]
    fn large_payloads_are_fragmented() {
        let config = SimulationConfig {
            messages: 5,
            payload_len: 5_000,
            channels: 1,
            host: HostConfig::for_testing(),
            ..SimulationConfig::default()
        };
        let report = simulate(&config).unwrap();
        assert!(report.is_healthy(config.delivery), "{report:?}");
    }

    #[test]
    fn config_fills_missing_fields() {
        let config: SimulationConfig =
            serde_json::from_str(r#"{ "messages": 7, "link": { "loss": 0.5 } }"#).unwrap();
        assert_eq!(config.messages, 7);
        assert!((config.link.loss - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.link.latency_ms, 10);
        assert_eq!(config.channels, 2);
    }

    #[test]
    fn zero_channels_rejected() {
        let config = SimulationConfig {
            channels: 0,
            ..SimulationConfig::default()
        };
        assert!(simulate(&config).is_err());
    }
}
