//! Round-trip estimation, unreliable throttling and the reliable send window.

use wire::{MAX_WINDOW_SIZE, MIN_WINDOW_SIZE};

use crate::seq::time_difference;

/// Round-trip time assumed before the first sample.
pub(crate) const INITIAL_RTT_MS: u32 = 500;

/// Denominator of the unreliable throttle probability.
pub(crate) const THROTTLE_SCALE: u32 = 32;

const THROTTLE_COUNTER_STEP: u32 = 7;

/// Fixed-point scale of the packet loss estimate.
pub(crate) const PACKET_LOSS_SCALE: u32 = 1 << 16;

const PACKET_LOSS_INTERVAL_MS: u32 = 10_000;

/// Window size in bytes for a connection between two bandwidth limits.
///
/// `0` means unlimited. The result is a multiple of [`MIN_WINDOW_SIZE`]
/// within `MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE`.
#[must_use]
pub(crate) fn window_for_bandwidth(local: u32, remote: u32) -> u32 {
    let bandwidth = match (local, remote) {
        (0, 0) => return MAX_WINDOW_SIZE,
        (0, other) | (other, 0) => other,
        (a, b) => a.min(b),
    };
    let window = (bandwidth / 65_536).saturating_mul(MIN_WINDOW_SIZE);
    window.clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE)
}

/// Smoothed round-trip time and its variance, in milliseconds.
#[derive(Debug, Clone)]
pub(crate) struct RttEstimator {
    rtt: u32,
    variance: u32,
    lowest: u32,
    highest_variance: u32,
    last: u32,
    last_variance: u32,
    epoch: Option<u32>,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            rtt: INITIAL_RTT_MS,
            variance: 0,
            lowest: INITIAL_RTT_MS,
            highest_variance: 0,
            last: INITIAL_RTT_MS,
            last_variance: 0,
            epoch: None,
        }
    }
}

impl RttEstimator {
    pub(crate) const fn rtt(&self) -> u32 {
        self.rtt
    }

    pub(crate) const fn variance(&self) -> u32 {
        self.variance
    }

    /// Lowest round trip and highest variance of the previous epoch.
    pub(crate) const fn previous_epoch(&self) -> (u32, u32) {
        (self.last, self.last_variance)
    }

    /// Retransmission timeout for a command sent now.
    pub(crate) const fn rto(&self) -> u32 {
        self.rtt.saturating_add(self.variance.saturating_mul(4))
    }

    /// Returns `true` if `sample` is within two variances of the estimate.
    pub(crate) const fn is_timely(&self, sample: u32) -> bool {
        sample <= self.rtt.saturating_add(self.variance.saturating_mul(2))
    }

    /// Folds one sample into the estimate and rolls the epoch once
    /// `interval` has elapsed since it started.
    pub(crate) fn update(&mut self, sample: u32, now: u32, interval: u32) {
        self.variance -= self.variance / 4;
        if sample >= self.rtt {
            self.rtt += (sample - self.rtt) / 8;
            self.variance += (sample - self.rtt) / 4;
        } else {
            self.rtt -= (self.rtt - sample) / 8;
            self.variance += (self.rtt - sample) / 4;
        }

        self.lowest = self.lowest.min(self.rtt);
        self.highest_variance = self.highest_variance.max(self.variance);

        let roll = self
            .epoch
            .map_or(true, |epoch| time_difference(now, epoch) >= interval);
        if roll {
            self.last = self.lowest;
            self.last_variance = self.highest_variance;
            self.lowest = self.rtt;
            self.highest_variance = self.variance;
            self.epoch = Some(now);
        }
    }
}

/// Probability, out of [`THROTTLE_SCALE`], that an unreliable command is
/// sent rather than dropped.
#[derive(Debug, Clone)]
pub(crate) struct PacketThrottle {
    value: u32,
    counter: u32,
    pub interval: u32,
    pub acceleration: u32,
    pub deceleration: u32,
}

impl PacketThrottle {
    pub(crate) const fn new(interval: u32, acceleration: u32, deceleration: u32) -> Self {
        Self {
            value: THROTTLE_SCALE,
            counter: 0,
            interval,
            acceleration,
            deceleration,
        }
    }

    pub(crate) const fn value(&self) -> u32 {
        self.value
    }

    pub(crate) fn configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.interval = interval;
        self.acceleration = acceleration;
        self.deceleration = deceleration;
    }

    /// Advances the drop counter; returns `false` if the next unreliable
    /// command should be dropped.
    pub(crate) fn admit(&mut self) -> bool {
        self.counter = (self.counter + THROTTLE_COUNTER_STEP) % THROTTLE_SCALE;
        self.counter <= self.value
    }

    /// Adjusts the throttle for a new round-trip sample, comparing it with
    /// the previous epoch. Returns the direction of the change.
    pub(crate) fn adjust(&mut self, sample: u32, last_rtt: u32, last_variance: u32) -> i8 {
        if last_rtt <= last_variance {
            self.value = THROTTLE_SCALE;
            0
        } else if sample < last_rtt {
            self.value = (self.value + self.acceleration).min(THROTTLE_SCALE);
            1
        } else if sample > last_rtt.saturating_add(last_variance.saturating_mul(2)) {
            self.value = self.value.saturating_sub(self.deceleration);
            -1
        } else {
            0
        }
    }
}

/// Bytes of reliable data allowed in flight.
#[derive(Debug, Clone)]
pub(crate) struct CongestionWindow {
    window: u32,
    max: u32,
    mss: u32,
    in_flight: u32,
    acked: u32,
}

impl CongestionWindow {
    pub(crate) fn new(max: u32, mss: u16) -> Self {
        let max = max.clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE);
        Self {
            window: max,
            max,
            mss: u32::from(mss),
            in_flight: 0,
            acked: 0,
        }
    }

    pub(crate) const fn window(&self) -> u32 {
        self.window
    }

    pub(crate) const fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Returns `true` if `len` more bytes may be sent. A lone command is
    /// always admitted so an oversized window never stalls the connection.
    pub(crate) const fn admits(&self, len: u32) -> bool {
        self.in_flight == 0 || self.in_flight.saturating_add(len) <= self.window
    }

    pub(crate) fn on_send(&mut self, len: u32) {
        self.in_flight = self.in_flight.saturating_add(len);
    }

    /// A sent command timed out and went back to the outgoing queue.
    pub(crate) fn on_requeue(&mut self, len: u32) {
        self.in_flight = self.in_flight.saturating_sub(len);
    }

    /// A sent command was acknowledged. Timely acknowledgements grow the
    /// window by one segment per window of acknowledged bytes.
    pub(crate) fn on_ack(&mut self, len: u32, timely: bool) {
        self.in_flight = self.in_flight.saturating_sub(len);
        if !timely {
            return;
        }
        self.acked = self.acked.saturating_add(len);
        if self.acked >= self.window {
            self.acked -= self.window;
            self.window = (self.window + self.mss).min(self.max);
        }
    }

    pub(crate) fn clear_in_flight(&mut self) {
        self.in_flight = 0;
        self.acked = 0;
    }

    /// Halves the window after a retransmission timeout.
    pub(crate) fn on_loss(&mut self) {
        self.window = (self.window / 2).max(MIN_WINDOW_SIZE);
        self.acked = 0;
    }

    /// Applies a new upper bound. A shrinking bound also halves the window.
    pub(crate) fn set_max(&mut self, max: u32) {
        let max = max.clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE);
        if max < self.max {
            self.on_loss();
        }
        self.max = max;
        self.window = self.window.min(max);
    }
}

/// Smoothed fraction of reliable commands lost, out of
/// [`PACKET_LOSS_SCALE`].
#[derive(Debug, Clone, Default)]
pub(crate) struct LossEstimator {
    loss: u32,
    variance: u32,
    epoch: Option<u32>,
    sent: u32,
    lost: u32,
    total_sent: u64,
    total_lost: u64,
}

impl LossEstimator {
    pub(crate) fn record_sent(&mut self) {
        self.sent = self.sent.saturating_add(1);
        self.total_sent += 1;
    }

    pub(crate) fn record_lost(&mut self) {
        self.lost = self.lost.saturating_add(1);
        self.total_lost += 1;
    }

    pub(crate) const fn loss(&self) -> u32 {
        self.loss
    }

    pub(crate) const fn variance(&self) -> u32 {
        self.variance
    }

    pub(crate) const fn totals(&self) -> (u64, u64) {
        (self.total_sent, self.total_lost)
    }

    /// Folds the current epoch into the estimate once it is old enough.
    pub(crate) fn update(&mut self, now: u32) {
        let Some(epoch) = self.epoch else {
            self.epoch = Some(now);
            return;
        };
        if time_difference(now, epoch) < PACKET_LOSS_INTERVAL_MS || self.sent == 0 {
            return;
        }
        let sample =
            (u64::from(self.lost.min(self.sent)) * u64::from(PACKET_LOSS_SCALE)
                / u64::from(self.sent)) as u32;

        self.variance -= self.variance / 4;
        if sample >= self.loss {
            self.loss += (sample - self.loss) / 8;
            self.variance += (sample - self.loss) / 4;
        } else {
            self.loss -= (self.loss - sample) / 8;
            self.variance += (self.loss - sample) / 4;
        }

        self.epoch = Some(now);
        self.sent = 0;
        self.lost = 0;
    }
}
