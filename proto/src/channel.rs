//! Per-channel sequencing, duplicate suppression and reordering.

use std::collections::BTreeMap;

use wire::Acknowledge;

use crate::seq::seq_newer;

/// How far ahead of the last in-order sequence a reliable command may be
/// accepted, and how far ahead of the remote's acknowledgement a sender may
/// transmit.
pub(crate) const RELIABLE_WINDOW: u16 = 4096;

/// Groups tracked per unsequenced window.
const UNSEQUENCED_WINDOW_SIZE: u16 = 1024;
const UNSEQUENCED_FREE_WINDOWS: u32 = 32;

/// Classification of an incoming reliable sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acceptance {
    New,
    /// Already received; acknowledge again but do not deliver.
    Duplicate,
    /// Too far ahead to buffer; drop without acknowledging.
    OutOfWindow,
}

/// A reliable command waiting for the sequences before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Pending {
    /// Already delivered on arrival; only occupies the sequence.
    Marker,
    Payload(Vec<u8>),
    /// One fragment of the message starting at `start`; `last` marks the
    /// fragment with the highest number.
    Fragment { start: u16, last: bool },
}

/// Output of [`Channel::drain_ready`], in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Ready {
    Payload(Vec<u8>),
    /// Every fragment of the message starting at `start` is in order.
    Fragment { start: u16 },
}

/// Sequence state for one channel of one connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct Channel {
    outgoing_reliable: u16,
    outgoing_unreliable: u16,
    remote_cumulative: u16,
    incoming_reliable: u16,
    incoming_unreliable: u16,
    reorder: BTreeMap<u16, Pending>,
}

impl Channel {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Assigns the next outgoing reliable sequence.
    pub(crate) fn next_reliable(&mut self) -> u16 {
        self.outgoing_reliable = self.outgoing_reliable.wrapping_add(1);
        self.outgoing_reliable
    }

    /// Assigns the next outgoing unreliable sequence.
    pub(crate) fn next_unreliable(&mut self) -> u16 {
        self.outgoing_unreliable = self.outgoing_unreliable.wrapping_add(1);
        self.outgoing_unreliable
    }

    /// Returns `true` if `sequence` is close enough to the remote's
    /// cumulative acknowledgement to be transmitted.
    pub(crate) const fn can_transmit(&self, sequence: u16) -> bool {
        sequence.wrapping_sub(self.remote_cumulative) <= RELIABLE_WINDOW
    }

    pub(crate) fn note_remote_ack(&mut self, cumulative: u16) {
        if seq_newer(cumulative, self.remote_cumulative)
            && cumulative.wrapping_sub(self.remote_cumulative) <= RELIABLE_WINDOW
        {
            self.remote_cumulative = cumulative;
        }
    }

    /// Sequence the next in-order delivery starts at.
    pub(crate) const fn next_expected(&self) -> u16 {
        self.incoming_reliable.wrapping_add(1)
    }

    /// Classifies an incoming reliable sequence without recording it.
    pub(crate) fn accept_reliable(&self, sequence: u16) -> Acceptance {
        let ahead = sequence.wrapping_sub(self.incoming_reliable);
        if ahead == 0 || ahead >= 0x8000 {
            Acceptance::Duplicate
        } else if ahead > RELIABLE_WINDOW {
            Acceptance::OutOfWindow
        } else if self.reorder.contains_key(&sequence) {
            Acceptance::Duplicate
        } else {
            Acceptance::New
        }
    }

    /// Records a reliable sequence accepted as [`Acceptance::New`].
    pub(crate) fn insert(&mut self, sequence: u16, pending: Pending) {
        self.reorder.insert(sequence, pending);
    }

    /// Moves every in-order pending command to `out` and advances the
    /// cumulative sequence past them.
    pub(crate) fn drain_ready(&mut self, out: &mut Vec<Ready>) {
        loop {
            let next = self.incoming_reliable.wrapping_add(1);
            let Some(pending) = self.reorder.remove(&next) else {
                break;
            };
            self.incoming_reliable = next;
            match pending {
                Pending::Marker | Pending::Fragment { last: false, .. } => {}
                Pending::Payload(payload) => out.push(Ready::Payload(payload)),
                Pending::Fragment { start, last: true } => out.push(Ready::Fragment { start }),
            }
        }
    }

    /// Returns `true` and records `sequence` if it is newer than the last
    /// delivered unreliable sequence.
    pub(crate) fn accept_unreliable(&mut self, sequence: u16) -> bool {
        if seq_newer(sequence, self.incoming_unreliable) {
            self.incoming_unreliable = sequence;
            true
        } else {
            false
        }
    }

    /// Builds the acknowledgement for this channel's current receive state.
    pub(crate) fn ack(&self, received_sent_time: u32) -> Acknowledge {
        let mut selective = 0u32;
        for bit in 0..32u16 {
            let sequence = self.incoming_reliable.wrapping_add(1 + bit);
            if self.reorder.contains_key(&sequence) {
                selective |= 1 << bit;
            }
        }
        Acknowledge {
            cumulative: self.incoming_reliable,
            selective,
            received_sent_time,
        }
    }

    /// Drops buffered out-of-order commands, keeping sequence counters.
    pub(crate) fn clear_incoming(&mut self) {
        self.reorder.clear();
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.reorder.len()
    }
}

/// Duplicate filter for unsequenced groups.
#[derive(Debug, Clone, Default)]
pub(crate) struct UnsequencedWindow {
    base: u16,
    seen: [u32; UNSEQUENCED_WINDOW_SIZE as usize / 32],
}

impl UnsequencedWindow {
    /// Returns `true` the first time `group` is seen within the window.
    pub(crate) fn accept(&mut self, group: u16) -> bool {
        let index = group % UNSEQUENCED_WINDOW_SIZE;
        let base = u32::from(self.base);
        let mut unwrapped = u32::from(group);
        if unwrapped < base {
            unwrapped += 0x1_0000;
        }
        if unwrapped >= base + UNSEQUENCED_FREE_WINDOWS * u32::from(UNSEQUENCED_WINDOW_SIZE) {
            return false;
        }

        let window = group - index;
        let word = usize::from(index / 32);
        let bit = 1u32 << (index % 32);
        if window != self.base {
            self.base = window;
            self.seen = [0; UNSEQUENCED_WINDOW_SIZE as usize / 32];
        } else if self.seen[word] & bit != 0 {
            return false;
        }
        self.seen[word] |= bit;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(channel: &mut Channel) -> Vec<Ready> {
        let mut out = Vec::new();
        channel.drain_ready(&mut out);
        out
    }

    #[test]
    fn sequences_start_at_one_and_wrap() {
        let mut channel = Channel::new();
        assert_eq!(channel.next_reliable(), 1);
        assert_eq!(channel.next_unreliable(), 1);
        channel.outgoing_reliable = u16::MAX;
        assert_eq!(channel.next_reliable(), 0);
    }

    #[test]
    fn in_order_delivery_waits_for_gap() {
        let mut channel = Channel::new();
        assert_eq!(channel.accept_reliable(2), Acceptance::New);
        channel.insert(2, Pending::Payload(b"two".to_vec()));
        assert!(drain(&mut channel).is_empty());

        channel.insert(1, Pending::Payload(b"one".to_vec()));
        assert_eq!(
            drain(&mut channel),
            vec![
                Ready::Payload(b"one".to_vec()),
                Ready::Payload(b"two".to_vec())
            ]
        );
        assert_eq!(channel.accept_reliable(1), Acceptance::Duplicate);
        assert_eq!(channel.accept_reliable(2), Acceptance::Duplicate);
    }

    #[test]
    fn buffered_sequence_is_duplicate() {
        let mut channel = Channel::new();
        channel.insert(5, Pending::Marker);
        assert_eq!(channel.accept_reliable(5), Acceptance::Duplicate);
        assert_eq!(channel.accept_reliable(4), Acceptance::New);
    }

    #[test]
    fn far_ahead_is_out_of_window() {
        let channel = Channel::new();
        assert_eq!(channel.accept_reliable(RELIABLE_WINDOW), Acceptance::New);
        assert_eq!(
            channel.accept_reliable(RELIABLE_WINDOW + 1),
            Acceptance::OutOfWindow
        );
        assert_eq!(channel.accept_reliable(u16::MAX), Acceptance::Duplicate);
    }

    #[test]
    fn reordering_across_wrap() {
        let mut channel = Channel::new();
        channel.incoming_reliable = u16::MAX - 1;
        channel.insert(0, Pending::Payload(vec![0]));
        channel.insert(u16::MAX, Pending::Payload(vec![1]));
        assert_eq!(
            drain(&mut channel),
            vec![Ready::Payload(vec![1]), Ready::Payload(vec![0])]
        );
        assert_eq!(channel.ack(0).cumulative, 0);
    }

    #[test]
    fn fragments_release_on_last() {
        let mut channel = Channel::new();
        channel.insert(1, Pending::Fragment { start: 1, last: false });
        channel.insert(3, Pending::Marker);
        channel.insert(2, Pending::Fragment { start: 1, last: true });
        assert_eq!(drain(&mut channel), vec![Ready::Fragment { start: 1 }]);
        assert_eq!(channel.buffered(), 0);
    }

    #[test]
    fn ack_reports_selective_bits() {
        let mut channel = Channel::new();
        channel.insert(1, Pending::Marker);
        drain(&mut channel);
        channel.insert(3, Pending::Marker);
        channel.insert(33, Pending::Marker);
        channel.insert(40, Pending::Marker);
        let ack = channel.ack(77);
        assert_eq!(ack.cumulative, 1);
        assert_eq!(ack.selective, (1 << 1) | (1 << 31));
        assert_eq!(ack.received_sent_time, 77);
    }

    #[test]
    fn unreliable_keeps_newest() {
        let mut channel = Channel::new();
        assert!(channel.accept_unreliable(2));
        assert!(!channel.accept_unreliable(1));
        assert!(!channel.accept_unreliable(2));
        assert!(channel.accept_unreliable(3));
    }

    #[test]
    fn transmit_window_tracks_remote_ack() {
        let mut channel = Channel::new();
        assert!(channel.can_transmit(RELIABLE_WINDOW));
        assert!(!channel.can_transmit(RELIABLE_WINDOW + 1));
        channel.note_remote_ack(10);
        assert!(channel.can_transmit(RELIABLE_WINDOW + 10));
        channel.note_remote_ack(5);
        assert!(channel.can_transmit(RELIABLE_WINDOW + 10));
    }

    #[test]
    fn unsequenced_rejects_duplicates() {
        let mut window = UnsequencedWindow::default();
        assert!(window.accept(1));
        assert!(window.accept(2));
        assert!(!window.accept(1));
        assert!(window.accept(1025));
        assert!(!window.accept(3));
        assert!(!window.accept(1025));
        assert!(window.accept(1026));
    }

    #[test]
    fn unsequenced_rejects_far_future() {
        let mut window = UnsequencedWindow::default();
        assert!(!window.accept(32 * 1024));
        assert!(window.accept(31 * 1024));
    }
}
