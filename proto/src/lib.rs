//! Connection-oriented, reliable, multi-channel transport over datagrams.
//!
//! A [`Host`] owns a fixed number of peer slots and one [`Transport`]. It
//! runs the connect and disconnect handshakes, sequences and acknowledges
//! commands per channel, retransmits lost reliable commands, fragments
//! large payloads and paces reliable data with a congestion window.
//!
//! # Features
//!
//! - Four delivery modes per payload, see [`Delivery`]
//! - Up to 255 independent channels per connection
//! - Round-trip estimation, packet loss tracking and unreliable throttling
//! - A deterministic in-memory network in [`sim`] for tests
//!
//! # Design Principles
//!
//! - **Single-threaded** - All work happens inside [`Host::service`]; the
//!   host spawns nothing and holds no locks.
//! - **Bounded** - Peers, channels, payloads and reassembly are limited by
//!   [`HostConfig`].
//! - **Hostile input is dropped** - Malformed or unexpected datagrams are
//!   logged and ignored, never surfaced as errors.
//! - **Stale handles fail loudly** - A [`PeerHandle`] outliving its
//!   connection returns [`HostError::StalePeer`].

mod channel;
mod config;
mod congestion;
mod error;
mod event;
mod fragment;
mod host;
mod peer;
mod reliability;
mod seq;
pub mod sim;
mod transport;

pub use config::{ConfigError, HostConfig};
pub use error::{HostError, HostResult};
pub use event::{Delivery, Event, ServiceEvents};
pub use host::Host;
pub use peer::{PeerHandle, PeerState, PeerStats};
pub use sim::{LinkConditioner, SimNetwork, SimPacket, SimStats, SimTransport};
pub use transport::{BufferPool, Datagram, Transport, UdpTransport};
