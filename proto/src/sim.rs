//! In-memory lossy network on a virtual clock.
//!
//! Every [`SimTransport`] created from one [`SimNetwork`] shares the same
//! packet queue and clock. Time only moves when the network is advanced or
//! an endpoint waits in [`Transport::poll_receive`], so runs are
//! reproducible for a given seed.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::transport::{BufferPool, Datagram, Transport};

/// Fault model applied to every datagram.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct LinkConditioner {
    pub latency_ms: u64,
    /// Extra uniform delay in `0..=jitter_ms`; reorders datagrams.
    pub jitter_ms: u64,
    /// Probability that a datagram is lost.
    pub loss: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate: f64,
}

impl Default for LinkConditioner {
    fn default() -> Self {
        Self {
            latency_ms: 10,
            jitter_ms: 0,
            loss: 0.0,
            duplicate: 0.0,
        }
    }
}

impl LinkConditioner {
    /// Lossless link with no delay.
    #[must_use]
    pub const fn perfect() -> Self {
        Self {
            latency_ms: 0,
            jitter_ms: 0,
            loss: 0.0,
            duplicate: 0.0,
        }
    }
}

/// A datagram travelling through the simulated network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimPacket {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub payload: Vec<u8>,
}

/// Counters over the lifetime of a [`SimNetwork`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SimStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
}

type Filter = Box<dyn FnMut(&SimPacket) -> bool>;

struct SimState {
    rng: StdRng,
    start: Instant,
    elapsed: Duration,
    conditioner: LinkConditioner,
    in_flight: BTreeMap<(Duration, u64), SimPacket>,
    next_order: u64,
    drops: HashMap<(SocketAddr, SocketAddr), u32>,
    isolated: HashSet<SocketAddr>,
    filter: Option<Filter>,
    stats: SimStats,
}

impl SimState {
    fn enqueue(&mut self, delay: Duration, packet: SimPacket) {
        let order = self.next_order;
        self.next_order += 1;
        self.in_flight.insert((self.elapsed + delay, order), packet);
    }

    fn delay(&mut self) -> Duration {
        let jitter = if self.conditioner.jitter_ms == 0 {
            0
        } else {
            self.rng.gen_range(0..=self.conditioner.jitter_ms)
        };
        Duration::from_millis(self.conditioner.latency_ms + jitter)
    }

    fn chance(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen_bool(probability.min(1.0))
    }

    fn should_drop(&mut self, packet: &SimPacket) -> bool {
        if self.isolated.contains(&packet.from) || self.isolated.contains(&packet.to) {
            return true;
        }
        if let Some(remaining) = self.drops.get_mut(&(packet.from, packet.to)) {
            if *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        if let Some(filter) = self.filter.as_mut() {
            if !filter(packet) {
                return true;
            }
        }
        let loss = self.conditioner.loss;
        self.chance(loss)
    }

    fn send(&mut self, packet: SimPacket) {
        self.stats.sent += 1;
        if self.should_drop(&packet) {
            self.stats.dropped += 1;
            return;
        }
        let duplicate = self.conditioner.duplicate;
        if self.chance(duplicate) {
            self.stats.duplicated += 1;
            let delay = self.delay();
            self.enqueue(delay, packet.clone());
        }
        let delay = self.delay();
        self.enqueue(delay, packet);
    }

    fn next_arrival(&self, to: SocketAddr) -> Option<Duration> {
        self.in_flight
            .iter()
            .find(|(_, packet)| packet.to == to)
            .map(|((at, _), _)| *at)
    }

    fn deliver(&mut self, to: SocketAddr, out: &mut Vec<Datagram>) -> usize {
        let due: Vec<(Duration, u64)> = self
            .in_flight
            .range(..=(self.elapsed, u64::MAX))
            .filter(|(_, packet)| packet.to == to)
            .map(|(key, _)| *key)
            .collect();
        for key in &due {
            if let Some(packet) = self.in_flight.remove(key) {
                self.stats.delivered += 1;
                out.push(Datagram {
                    address: packet.from,
                    payload: packet.payload,
                });
            }
        }
        due.len()
    }
}

/// Shared handle to a simulated network.
#[derive(Clone)]
pub struct SimNetwork {
    state: Rc<RefCell<SimState>>,
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("SimNetwork")
            .field("elapsed", &state.elapsed)
            .field("in_flight", &state.in_flight.len())
            .field("stats", &state.stats)
            .finish_non_exhaustive()
    }
}

impl SimNetwork {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                start: Instant::now(),
                elapsed: Duration::ZERO,
                conditioner: LinkConditioner::default(),
                in_flight: BTreeMap::new(),
                next_order: 0,
                drops: HashMap::new(),
                isolated: HashSet::new(),
                filter: None,
                stats: SimStats::default(),
            })),
        }
    }

    pub fn set_conditioner(&self, conditioner: LinkConditioner) {
        self.state.borrow_mut().conditioner = conditioner;
    }

    /// Creates an endpoint bound to `address`.
    #[must_use]
    pub fn endpoint(&self, address: SocketAddr) -> SimTransport {
        SimTransport {
            address,
            network: self.clone(),
        }
    }

    /// Drops the next `count` datagrams sent from `from` to `to`.
    pub fn drop_next(&self, from: SocketAddr, to: SocketAddr, count: u32) {
        *self.state.borrow_mut().drops.entry((from, to)).or_default() += count;
    }

    /// Installs a predicate that sees every sent datagram; returning `false`
    /// drops it.
    pub fn set_filter(&self, filter: impl FnMut(&SimPacket) -> bool + 'static) {
        self.state.borrow_mut().filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&self) {
        self.state.borrow_mut().filter = None;
    }

    /// Drops all traffic to and from `address` while `isolated` is set.
    pub fn set_isolated(&self, address: SocketAddr, isolated: bool) {
        let mut state = self.state.borrow_mut();
        if isolated {
            state.isolated.insert(address);
        } else {
            state.isolated.remove(&address);
        }
    }

    /// Queues a datagram for immediate delivery, bypassing every fault.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, payload: Vec<u8>) {
        self.state
            .borrow_mut()
            .enqueue(Duration::ZERO, SimPacket { from, to, payload });
    }

    pub fn advance(&self, by: Duration) {
        self.state.borrow_mut().elapsed += by;
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        let state = self.state.borrow();
        state.start + state.elapsed
    }

    /// Virtual time since the network was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.state.borrow().elapsed
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight.len()
    }

    #[must_use]
    pub fn stats(&self) -> SimStats {
        self.state.borrow().stats
    }
}

/// One address on a [`SimNetwork`].
#[derive(Debug, Clone)]
pub struct SimTransport {
    address: SocketAddr,
    network: SimNetwork,
}

impl SimTransport {
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }
}

impl Transport for SimTransport {
    fn send(&mut self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        self.network.state.borrow_mut().send(SimPacket {
            from: self.address,
            to,
            payload: datagram.to_vec(),
        });
        Ok(())
    }

    /// Delivers due datagrams. With nothing due, moves the virtual clock to
    /// the next arrival for this address or by `timeout`, whichever is
    /// sooner. Simulated packets already own their payloads, so nothing is
    /// taken from the pool.
    fn poll_receive(
        &mut self,
        timeout: Duration,
        _pool: &mut BufferPool,
        out: &mut Vec<Datagram>,
    ) -> io::Result<()> {
        let mut state = self.network.state.borrow_mut();
        if state.deliver(self.address, out) > 0 || timeout.is_zero() {
            return Ok(());
        }
        let deadline = state.elapsed + timeout;
        let next = state.next_arrival(self.address);
        match next {
            Some(at) if at <= deadline => {
                state.elapsed = at;
                state.deliver(self.address, out);
            }
            _ => state.elapsed = deadline,
        }
        Ok(())
    }

    fn now(&self) -> Instant {
        self.network.now()
    }
}
