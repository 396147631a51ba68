//! Outgoing reliable commands, acknowledgement and retransmission.

use std::collections::VecDeque;

use wire::{encode_command, Acknowledge, Command, CommandKind, EncodeError};

use crate::seq::{seq_distance, time_difference, time_less};

/// A reliable command waiting to be sent or acknowledged.
#[derive(Debug, Clone)]
pub(crate) struct OutgoingCommand {
    pub channel: u8,
    pub sequence: u16,
    pub kind: CommandKind,
    /// The command exactly as it goes on the wire.
    pub bytes: Vec<u8>,
    /// Time of the most recent transmission.
    pub sent_time: Option<u32>,
    /// Retransmission timeout; fixed on first send, doubled on each expiry.
    pub rto: u32,
    pub retransmits: u32,
}

impl OutgoingCommand {
    pub(crate) fn encode(command: &Command<'_>) -> Result<Self, EncodeError> {
        let mut bytes = vec![0u8; command.encoded_len()];
        let written = encode_command(command, &mut bytes)?;
        bytes.truncate(written);
        Ok(Self {
            channel: command.channel,
            sequence: command.sequence,
            kind: command.kind(),
            bytes,
            sent_time: None,
            rto: 0,
            retransmits: 0,
        })
    }

    /// Encoded size, counted against the congestion window.
    pub(crate) fn len(&self) -> u32 {
        u32::try_from(self.bytes.len()).unwrap_or(u32::MAX)
    }

    fn acknowledged_by(&self, channel: u8, ack: &Acknowledge) -> bool {
        if self.channel != channel {
            return false;
        }
        if seq_distance(self.sequence, ack.cumulative) <= 0 {
            return true;
        }
        let bit = self.sequence.wrapping_sub(ack.cumulative).wrapping_sub(1);
        bit < 32 && ack.selective & (1 << bit) != 0
    }
}

/// When a peer with unacknowledged commands is declared dead.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeoutPolicy {
    pub minimum: u32,
    pub maximum: u32,
    pub max_retransmits: u32,
}

/// Result of [`ReliableQueue::check_timeouts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutOutcome {
    Idle,
    /// `commands` expired and went back to the front of the queue;
    /// `bytes` of them were in flight.
    Retransmit { commands: u32, bytes: u32 },
    Failed,
}

/// A command removed by an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Acked {
    pub kind: CommandKind,
    pub len: u32,
    /// `false` if the command was waiting for retransmission and no longer
    /// counted as in flight.
    pub in_flight: bool,
}

/// The outgoing and sent reliable queues of one peer.
#[derive(Debug, Default)]
pub(crate) struct ReliableQueue {
    outgoing: VecDeque<OutgoingCommand>,
    sent: VecDeque<OutgoingCommand>,
    earliest_timeout: Option<u32>,
}

impl ReliableQueue {
    pub(crate) fn push(&mut self, command: OutgoingCommand) {
        self.outgoing.push_back(command);
    }

    pub(crate) fn front(&self) -> Option<&OutgoingCommand> {
        self.outgoing.front()
    }

    pub(crate) fn pop_front(&mut self) -> Option<OutgoingCommand> {
        self.outgoing.pop_front()
    }

    /// Moves a transmitted command to the sent queue.
    pub(crate) fn record_sent(&mut self, mut command: OutgoingCommand, now: u32, rto: u32) {
        if command.rto == 0 {
            command.rto = rto.max(1);
        }
        command.sent_time = Some(now);
        self.sent.push_back(command);
    }

    pub(crate) fn queued(&self) -> usize {
        self.outgoing.len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.sent.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.outgoing.is_empty() && self.sent.is_empty()
    }

    /// Any acknowledgement proves the peer is alive.
    pub(crate) fn clear_earliest_timeout(&mut self) {
        self.earliest_timeout = None;
    }

    pub(crate) fn clear(&mut self) {
        self.outgoing.clear();
        self.sent.clear();
        self.earliest_timeout = None;
    }

    /// Requeues every sent command whose timeout expired, or reports that
    /// the peer should be dropped.
    pub(crate) fn check_timeouts(&mut self, now: u32, policy: TimeoutPolicy) -> TimeoutOutcome {
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.sent.len() {
            let command = &self.sent[index];
            let sent_time = command.sent_time.unwrap_or(now);
            if time_difference(now, sent_time) < command.rto {
                index += 1;
                continue;
            }

            let earliest = match self.earliest_timeout {
                Some(earliest) if !time_less(sent_time, earliest) => earliest,
                _ => sent_time,
            };
            self.earliest_timeout = Some(earliest);
            let waited = time_difference(now, earliest);
            if waited >= policy.maximum
                || (command.retransmits >= policy.max_retransmits && waited >= policy.minimum)
            {
                return TimeoutOutcome::Failed;
            }

            if let Some(mut command) = self.sent.remove(index) {
                command.retransmits += 1;
                command.rto = command.rto.saturating_mul(2).min(policy.maximum);
                expired.push(command);
            }
        }

        if expired.is_empty() {
            return TimeoutOutcome::Idle;
        }
        let commands = u32::try_from(expired.len()).unwrap_or(u32::MAX);
        let bytes = expired.iter().map(OutgoingCommand::len).sum();
        for command in expired.into_iter().rev() {
            self.outgoing.push_front(command);
        }
        TimeoutOutcome::Retransmit { commands, bytes }
    }

    /// Removes every command on `channel` covered by `ack`.
    pub(crate) fn acknowledge(&mut self, channel: u8, ack: &Acknowledge, out: &mut Vec<Acked>) {
        self.sent.retain(|command| {
            if command.acknowledged_by(channel, ack) {
                out.push(Acked {
                    kind: command.kind,
                    len: command.len(),
                    in_flight: true,
                });
                false
            } else {
                true
            }
        });
        self.outgoing.retain(|command| {
            if command.sent_time.is_some() && command.acknowledged_by(channel, ack) {
                out.push(Acked {
                    kind: command.kind,
                    len: command.len(),
                    in_flight: false,
                });
                false
            } else {
                true
            }
        });
    }

    /// Removes every command of `kind` from both queues.
    pub(crate) fn remove_kind(&mut self, kind: CommandKind, out: &mut Vec<Acked>) {
        for (queue, in_flight) in [(&mut self.sent, true), (&mut self.outgoing, false)] {
            queue.retain(|command| {
                if command.kind == kind {
                    out.push(Acked {
                        kind,
                        len: command.len(),
                        in_flight: in_flight && command.sent_time.is_some(),
                    });
                    false
                } else {
                    true
                }
            });
        }
    }
}
