//! Reassembly of fragmented messages.
//!
//! Every partially received message owns one buffer in a host-wide
//! [`FragmentArena`], keyed by peer slot, channel and the reliable sequence
//! of its first fragment. Buffers of abandoned sets go back to a small pool.

use std::collections::HashMap;

use wire::Fragment;

/// Most fragments a single message may be split into.
pub(crate) const MAX_FRAGMENT_COUNT: u32 = 32_768;

/// Recycled buffers kept around for future sets.
const POOL_CAPACITY: usize = 16;

/// Identifies one message under reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FragmentKey {
    pub slot: u16,
    pub channel: u8,
    pub start: u16,
}

/// Reassembly state of one message.
#[derive(Debug)]
pub(crate) struct FragmentSet {
    count: u32,
    total_length: u32,
    received: Vec<u32>,
    remaining: u32,
    buffer: Vec<u8>,
}

impl FragmentSet {
    fn has(&self, number: u32) -> bool {
        self.received[(number / 32) as usize] & (1 << (number % 32)) != 0
    }

    fn mark(&mut self, number: u32) {
        self.received[(number / 32) as usize] |= 1 << (number % 32);
        self.remaining -= 1;
    }

    const fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Result of storing one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Incomplete,
    Complete,
}

/// Reasons a fragment is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FragmentError {
    /// Count, length or offset disagrees with the rest of the set.
    Inconsistent,
    /// The peer already has the maximum number of sets in progress.
    TooManySets { limit: usize },
}

/// Host-owned storage for every message under reassembly.
#[derive(Debug, Default)]
pub(crate) struct FragmentArena {
    sets: HashMap<FragmentKey, FragmentSet>,
    pool: Vec<Vec<u8>>,
}

impl FragmentArena {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores `fragment` in the set identified by `key`, creating the set on
    /// its first fragment.
    ///
    /// Only unfinished sets count against `max_sets`; finished ones waiting
    /// for in-order delivery do not. A fragment whose number was already
    /// stored is accepted without copying.
    pub(crate) fn insert(
        &mut self,
        key: FragmentKey,
        fragment: &Fragment<'_>,
        max_sets: usize,
    ) -> Result<Progress, FragmentError> {
        if !self.sets.contains_key(&key) {
            let in_progress = self
                .sets
                .iter()
                .filter(|(k, set)| k.slot == key.slot && !set.is_complete())
                .count();
            if in_progress >= max_sets {
                return Err(FragmentError::TooManySets { limit: max_sets });
            }
            let set = self.new_set(fragment.fragment_count, fragment.total_length);
            self.sets.insert(key, set);
        }
        let Some(set) = self.sets.get_mut(&key) else {
            return Err(FragmentError::Inconsistent);
        };

        if set.count != fragment.fragment_count || set.total_length != fragment.total_length {
            return Err(FragmentError::Inconsistent);
        }
        let offset = fragment.fragment_offset as usize;
        let end = offset + fragment.data.len();
        if fragment.fragment_number >= set.count || end > set.buffer.len() {
            return Err(FragmentError::Inconsistent);
        }

        if !set.has(fragment.fragment_number) {
            set.buffer[offset..end].copy_from_slice(fragment.data);
            set.mark(fragment.fragment_number);
        }
        if set.is_complete() {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Incomplete)
        }
    }

    /// Removes a completed set and returns the reassembled message.
    pub(crate) fn take(&mut self, key: FragmentKey) -> Option<Vec<u8>> {
        if !self.sets.get(&key)?.is_complete() {
            return None;
        }
        self.sets.remove(&key).map(|set| set.buffer)
    }

    /// Discards every set belonging to `slot`.
    pub(crate) fn release_peer(&mut self, slot: u16) {
        let keys: Vec<FragmentKey> = self
            .sets
            .keys()
            .filter(|key| key.slot == slot)
            .copied()
            .collect();
        for key in keys {
            if let Some(set) = self.sets.remove(&key) {
                self.recycle(set.buffer);
            }
        }
    }

    /// Number of sets in progress across all peers.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sets.len()
    }

    fn new_set(&mut self, count: u32, total_length: u32) -> FragmentSet {
        let mut buffer = self.pool.pop().unwrap_or_default();
        buffer.clear();
        buffer.resize(total_length as usize, 0);
        FragmentSet {
            count,
            total_length,
            received: vec![0; count.div_ceil(32) as usize],
            remaining: count,
            buffer,
        }
    }

    fn recycle(&mut self, buffer: Vec<u8>) {
        if self.pool.len() < POOL_CAPACITY {
            self.pool.push(buffer);
        }
    }
}

/// Number of fragments needed to carry `len` bytes in pieces of `size`.
#[must_use]
pub(crate) const fn fragment_count(len: usize, size: usize) -> usize {
    if size == 0 {
        0
    } else {
        len.div_ceil(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(number: u32, count: u32, total: u32, offset: u32, data: &[u8]) -> Fragment<'_> {
        Fragment {
            start_sequence: 1,
            fragment_count: count,
            fragment_number: number,
            total_length: total,
            fragment_offset: offset,
            data,
        }
    }

    const KEY: FragmentKey = FragmentKey {
        slot: 0,
        channel: 0,
        start: 1,
    };

    #[test]
    fn reassembles_out_of_order() {
        let mut arena = FragmentArena::new();
        assert_eq!(
            arena.insert(KEY, &piece(2, 3, 7, 6, b"g"), 4),
            Ok(Progress::Incomplete)
        );
        assert_eq!(
            arena.insert(KEY, &piece(0, 3, 7, 0, b"abc"), 4),
            Ok(Progress::Incomplete)
        );
        assert!(arena.take(KEY).is_none());
        assert_eq!(
            arena.insert(KEY, &piece(1, 3, 7, 3, b"def"), 4),
            Ok(Progress::Complete)
        );
        assert_eq!(arena.take(KEY).unwrap(), b"abcdefg");
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn duplicate_fragment_is_idempotent() {
        let mut arena = FragmentArena::new();
        arena.insert(KEY, &piece(0, 2, 4, 0, b"ab"), 4).unwrap();
        assert_eq!(
            arena.insert(KEY, &piece(0, 2, 4, 0, b"ab"), 4),
            Ok(Progress::Incomplete)
        );
        assert_eq!(
            arena.insert(KEY, &piece(1, 2, 4, 2, b"cd"), 4),
            Ok(Progress::Complete)
        );
    }

    #[test]
    fn mismatched_count_rejected() {
        let mut arena = FragmentArena::new();
        arena.insert(KEY, &piece(0, 2, 4, 0, b"ab"), 4).unwrap();
        assert_eq!(
            arena.insert(KEY, &piece(1, 3, 4, 2, b"cd"), 4),
            Err(FragmentError::Inconsistent)
        );
        assert_eq!(
            arena.insert(KEY, &piece(1, 2, 5, 2, b"cd"), 4),
            Err(FragmentError::Inconsistent)
        );
    }

    #[test]
    fn set_limit_per_peer() {
        let mut arena = FragmentArena::new();
        for start in 0..2 {
            let key = FragmentKey { start, ..KEY };
            arena.insert(key, &piece(0, 2, 4, 0, b"ab"), 2).unwrap();
        }
        let third = FragmentKey { start: 9, ..KEY };
        assert_eq!(
            arena.insert(third, &piece(0, 2, 4, 0, b"ab"), 2),
            Err(FragmentError::TooManySets { limit: 2 })
        );
        let other_peer = FragmentKey { slot: 1, ..third };
        assert!(arena.insert(other_peer, &piece(0, 2, 4, 0, b"ab"), 2).is_ok());
    }

    #[test]
    fn finished_sets_leave_room() {
        let mut arena = FragmentArena::new();
        for start in 0..2 {
            let key = FragmentKey { start, ..KEY };
            arena.insert(key, &piece(0, 1, 2, 0, b"ab"), 2).unwrap();
        }
        assert_eq!(arena.len(), 2);

        let partial = FragmentKey { start: 5, ..KEY };
        assert_eq!(
            arena.insert(partial, &piece(0, 2, 4, 0, b"ab"), 2),
            Ok(Progress::Incomplete)
        );
        let another = FragmentKey { start: 7, ..KEY };
        assert!(arena.insert(another, &piece(0, 2, 4, 0, b"ab"), 2).is_ok());
        let refused = FragmentKey { start: 9, ..KEY };
        assert_eq!(
            arena.insert(refused, &piece(0, 2, 4, 0, b"ab"), 2),
            Err(FragmentError::TooManySets { limit: 2 })
        );
    }

    #[test]
    fn release_peer_recycles_buffers() {
        let mut arena = FragmentArena::new();
        arena.insert(KEY, &piece(0, 2, 4, 0, b"ab"), 4).unwrap();
        arena.release_peer(KEY.slot);
        assert_eq!(arena.len(), 0);
        assert_eq!(arena.pool.len(), 1);

        arena.insert(KEY, &piece(0, 2, 4, 0, b"zz"), 4).unwrap();
        arena.insert(KEY, &piece(1, 2, 4, 2, b"yy"), 4).unwrap();
        assert_eq!(arena.take(KEY).unwrap(), b"zzyy");
        assert!(arena.pool.is_empty());
    }

    #[test]
    fn fragment_count_rounds_up() {
        assert_eq!(fragment_count(10, 5), 2);
        assert_eq!(fragment_count(11, 5), 3);
        assert_eq!(fragment_count(0, 5), 0);
    }
}
