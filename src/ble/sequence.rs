//! Circular sequence-number arithmetic.
//!
//! Every data fragment carries a one-byte sequence number that wraps after
//! [`SEQNUM_RANGE`] values. Comparing two sequence numbers therefore has to be
//! done on the circle: `3` comes *after* `254` when the counter has just
//! wrapped. [`SeqNum::distance`] gives the signed distance between two values
//! and is the only primitive the rest of the protocol uses for ordering.
//!
//! # Example
//!
//! ```
//! use ble_reliable_link::ble::SeqNum;
//!
//! let a = SeqNum::new(2);
//! let b = SeqNum::new(254);
//! assert_eq!(SeqNum::distance(a, b), 4);
//! assert!(a.is_after(b));
//! ```

use std::fmt;

/// Number of distinct sequence numbers (one header byte).
pub const SEQNUM_RANGE: u32 = 256;

/// Half of the sequence space; distances are folded into `[-HALF, HALF)`.
const HALF_RANGE: i32 = (SEQNUM_RANGE / 2) as i32;

/// A sequence number on the circular space `[0, SEQNUM_RANGE)`.
///
/// Deliberately not `Ord`: circular values have no total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeqNum(u8);

impl SeqNum {
    /// Sequence number both peers start from after a link reset.
    pub const ZERO: SeqNum = SeqNum(0);

    /// Wrap a raw header byte.
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// The raw value as carried on the wire.
    pub const fn value(self) -> u8 {
        self.0
    }

    /// The sequence number following this one.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Advance by `n` positions (modulo the range).
    pub const fn add(self, n: u8) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Signed circular distance `first - second`.
    ///
    /// Computes `((first - second + RANGE/2) mod RANGE) - RANGE/2`, so the
    /// result lies in `[-RANGE/2, RANGE/2)`. When the two values are exactly
    /// half the range apart both argument orders yield `-RANGE/2`.
    pub fn distance(first: SeqNum, second: SeqNum) -> i32 {
        let diff = i32::from(first.0) - i32::from(second.0) + HALF_RANGE;
        diff.rem_euclid(SEQNUM_RANGE as i32) - HALF_RANGE
    }

    /// True if `self` lies strictly after `other` on the circle.
    pub fn is_after(self, other: SeqNum) -> bool {
        Self::distance(self, other) > 0
    }

    /// True if `self` lies strictly before `other` on the circle.
    pub fn is_before(self, other: SeqNum) -> bool {
        Self::distance(self, other) < 0
    }
}

impl From<u8> for SeqNum {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
