//! Wrapping arithmetic for sequence numbers and millisecond timestamps.

/// Signed distance from `b` to `a` in the 16-bit sequence space.
#[must_use]
pub const fn seq_distance(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Returns `true` if `a` comes after `b`.
#[must_use]
pub const fn seq_newer(a: u16, b: u16) -> bool {
    seq_distance(a, b) > 0
}

const TIME_OVERFLOW: u32 = 0x8000_0000;

/// Returns `true` if timestamp `a` is earlier than `b`.
#[must_use]
pub const fn time_less(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) >= TIME_OVERFLOW
}

/// Absolute difference between two timestamps.
#[must_use]
pub const fn time_difference(a: u32, b: u32) -> u32 {
    if time_less(a, b) {
        b.wrapping_sub(a)
    } else {
        a.wrapping_sub(b)
    }
}
