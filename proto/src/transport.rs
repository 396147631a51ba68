//! Datagram I/O seam between the host and the network.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use tracing::trace;

/// Most datagrams collected by one [`UdpTransport::poll_receive`] call.
const RECEIVE_BATCH: usize = 64;

/// A datagram received from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub address: SocketAddr,
    pub payload: Vec<u8>,
}

/// Payload buffers the host hands back after dispatch.
///
/// Transports that copy out of a receive buffer take from here instead of
/// allocating per datagram.
#[derive(Debug, Default)]
pub struct BufferPool {
    spare: Vec<Vec<u8>>,
}

impl BufferPool {
    /// Most spare buffers kept between polls.
    pub const MAX_SPARE: usize = RECEIVE_BATCH;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer holding a copy of `bytes`, reusing a spare one if any.
    pub fn take(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut buffer = self.spare.pop().unwrap_or_default();
        buffer.clear();
        buffer.extend_from_slice(bytes);
        buffer
    }

    pub fn recycle(&mut self, buffer: Vec<u8>) {
        if self.spare.len() < Self::MAX_SPARE && buffer.capacity() > 0 {
            self.spare.push(buffer);
        }
    }

    /// Spare buffers on hand.
    #[must_use]
    pub fn len(&self) -> usize {
        self.spare.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spare.is_empty()
    }
}

/// Unreliable, unordered datagram delivery.
///
/// The host never blocks anywhere except inside [`poll_receive`].
///
/// [`poll_receive`]: Transport::poll_receive
pub trait Transport {
    /// Sends one datagram. Delivery is best effort.
    fn send(&mut self, to: SocketAddr, datagram: &[u8]) -> io::Result<()>;

    /// Waits up to `timeout` for datagrams and appends every one available
    /// to `out`. A zero timeout only collects what is already queued.
    ///
    /// Payload buffers come from `pool` when the transport has to copy;
    /// the host recycles them once dispatched.
    fn poll_receive(
        &mut self,
        timeout: Duration,
        pool: &mut BufferPool,
        out: &mut Vec<Datagram>,
    ) -> io::Result<()>;

    /// Clock the host runs its timers on.
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// [`Transport`] over a [`UdpSocket`].
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

impl UdpTransport {
    pub fn bind(address: impl ToSocketAddrs) -> io::Result<Self> {
        let socket = UdpSocket::bind(address)?;
        Ok(Self {
            socket,
            buffer: vec![0u8; usize::from(u16::MAX)],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn receive_one(&mut self, pool: &mut BufferPool, out: &mut Vec<Datagram>) -> io::Result<bool> {
        match self.socket.recv_from(&mut self.buffer) {
            Ok((len, address)) => {
                out.push(Datagram {
                    address,
                    payload: pool.take(&self.buffer[..len]),
                });
                Ok(true)
            }
            Err(err) if is_empty_read(&err) => Ok(false),
            // ICMP port unreachable from an earlier send.
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                trace!("ignoring connection reset on receive");
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }
}

fn is_empty_read(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

impl Transport for UdpTransport {
    fn send(&mut self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, to)?;
        Ok(())
    }

    fn poll_receive(
        &mut self,
        timeout: Duration,
        pool: &mut BufferPool,
        out: &mut Vec<Datagram>,
    ) -> io::Result<()> {
        let start = out.len();
        if timeout.is_zero() {
            self.socket.set_nonblocking(true)?;
        } else {
            self.socket.set_nonblocking(false)?;
            self.socket.set_read_timeout(Some(timeout))?;
            if !self.receive_one(pool, out)? {
                return Ok(());
            }
            self.socket.set_nonblocking(true)?;
        }
        while out.len() - start < RECEIVE_BATCH {
            if !self.receive_one(pool, out)? {
                break;
            }
        }
        Ok(())
    }
}
