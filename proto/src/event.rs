//! Events surfaced by [`Host::service`](crate::Host::service).

use std::collections::VecDeque;

use crate::peer::PeerHandle;

/// Delivery guarantee requested for a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Delivery {
    /// Retransmitted until acknowledged, delivered in send order.
    ReliableOrdered,
    /// Retransmitted until acknowledged, delivered on arrival.
    ReliableUnordered,
    /// Sent once; older payloads arriving after newer ones are dropped.
    UnreliableSequenced,
    /// Sent once, delivered on arrival.
    UnreliableUnordered,
}

impl Delivery {
    #[must_use]
    pub const fn is_reliable(self) -> bool {
        matches!(self, Self::ReliableOrdered | Self::ReliableUnordered)
    }

    #[must_use]
    pub const fn is_ordered(self) -> bool {
        matches!(self, Self::ReliableOrdered | Self::UnreliableSequenced)
    }

    /// Mode used once a payload needs fragmenting; fragments always travel
    /// reliably.
    #[must_use]
    pub const fn fragmented(self) -> Self {
        if self.is_ordered() {
            Self::ReliableOrdered
        } else {
            Self::ReliableUnordered
        }
    }
}

/// Something that happened on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection completed its handshake.
    Connect { peer: PeerHandle, data: u32 },
    Receive {
        peer: PeerHandle,
        channel: u8,
        delivery: Delivery,
        payload: Vec<u8>,
    },
    /// The connection closed through the disconnect handshake.
    Disconnect { peer: PeerHandle, data: u32 },
    /// The remote stopped acknowledging reliable commands.
    Timeout { peer: PeerHandle },
    /// An outgoing connection attempt was refused or never answered.
    ConnectFailed { peer: PeerHandle },
}

impl Event {
    #[must_use]
    pub const fn peer(&self) -> PeerHandle {
        match self {
            Self::Connect { peer, .. }
            | Self::Receive { peer, .. }
            | Self::Disconnect { peer, .. }
            | Self::Timeout { peer }
            | Self::ConnectFailed { peer } => *peer,
        }
    }
}

/// Drains queued events. Events left undrained stay queued for the next
/// service call.
#[derive(Debug)]
pub struct ServiceEvents<'a> {
    queue: &'a mut VecDeque<Event>,
}

impl<'a> ServiceEvents<'a> {
    pub(crate) fn new(queue: &'a mut VecDeque<Event>) -> Self {
        Self { queue }
    }

    /// Number of events not yet drained.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Iterator for ServiceEvents<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.queue.len(), Some(self.queue.len()))
    }
}

impl ExactSizeIterator for ServiceEvents<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragmented_upgrades_to_reliable() {
        assert_eq!(
            Delivery::UnreliableUnordered.fragmented(),
            Delivery::ReliableUnordered
        );
        assert_eq!(
            Delivery::UnreliableSequenced.fragmented(),
            Delivery::ReliableOrdered
        );
        assert_eq!(Delivery::ReliableOrdered.fragmented(), Delivery::ReliableOrdered);
        assert_eq!(
            Delivery::ReliableUnordered.fragmented(),
            Delivery::ReliableUnordered
        );
    }

    #[test]
    fn undrained_events_stay_queued() {
        let peer = PeerHandle::new(0, 1);
        let mut queue: VecDeque<Event> = [
            Event::Connect { peer, data: 0 },
            Event::Timeout { peer },
        ]
        .into_iter()
        .collect();

        let mut events = ServiceEvents::new(&mut queue);
        assert_eq!(events.len(), 2);
        assert_eq!(events.next().map(|e| e.peer()), Some(peer));
        assert_eq!(events.pending(), 1);
        assert_eq!(queue.len(), 1);
    }
}
