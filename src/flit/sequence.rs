//! Sequence-number arithmetic modulo `M`.
//!
//! Sequence numbers wrap, so they have no total order. Comparisons are made
//! relative to a window base: a number belongs to the window `[base, base + len)`
//! when its forward distance from `base` is less than `len`. Windows are kept
//! below `M / 2`, which makes "ahead of" and "behind" unambiguous.

use std::fmt;

use crate::core::SEQUENCE_MODULUS;

/// Link-layer sequence number (8-bit, wraps at 256).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceNumber(u8);

impl SequenceNumber {
    /// Sequence number zero, the first number after reset or retrain.
    pub const ZERO: Self = Self(0);

    /// Create a sequence number from its wire value.
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Raw wire value.
    pub const fn value(self) -> u8 {
        self.0
    }

    /// The following sequence number.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// The preceding sequence number.
    pub fn prev(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }

    /// Advance by `n` positions.
    pub fn advance(self, n: usize) -> Self {
        Self(self.0.wrapping_add((n % SEQUENCE_MODULUS as usize) as u8))
    }

    /// Forward distance from `base` to `self`, in `0..M`.
    pub fn distance_from(self, base: SequenceNumber) -> usize {
        self.0.wrapping_sub(base.0) as usize
    }

    /// Whether `self` lies in `[base, base + len)`.
    pub fn in_window(self, base: SequenceNumber, len: usize) -> bool {
        self.distance_from(base) < len
    }

    /// Serial-number comparison: `self` is strictly ahead of `other` by less
    /// than half the sequence space.
    pub fn is_after(self, other: SequenceNumber) -> bool {
        let d = self.distance_from(other);
        d != 0 && d < (SEQUENCE_MODULUS / 2) as usize
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for SequenceNumber {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_wraps() {
        let s = SequenceNumber::new(255);
        assert_eq!(s.next(), SequenceNumber::ZERO);
        assert_eq!(SequenceNumber::ZERO.prev(), s);
    }

    #[test]
    fn test_monotonic_increments() {
        let mut s = SequenceNumber::new(250);
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(s.value());
            s = s.next();
        }
        assert_eq!(seen, vec![250, 251, 252, 253, 254, 255, 0, 1, 2, 3]);
    }

    #[test]
    fn test_distance_across_wrap() {
        let base = SequenceNumber::new(250);
        assert_eq!(SequenceNumber::new(250).distance_from(base), 0);
        assert_eq!(SequenceNumber::new(255).distance_from(base), 5);
        assert_eq!(SequenceNumber::new(3).distance_from(base), 9);
        assert_eq!(base.advance(9), SequenceNumber::new(3));
    }

    #[test]
    fn test_window_membership() {
        let base = SequenceNumber::new(254);
        assert!(SequenceNumber::new(254).in_window(base, 4));
        assert!(SequenceNumber::new(1).in_window(base, 4));
        assert!(!SequenceNumber::new(2).in_window(base, 4));
        assert!(!SequenceNumber::new(253).in_window(base, 4));
        assert!(!base.in_window(base, 0));
    }

    #[test]
    fn test_is_after() {
        assert!(SequenceNumber::new(1).is_after(SequenceNumber::new(255)));
        assert!(!SequenceNumber::new(255).is_after(SequenceNumber::new(1)));
        assert!(!SequenceNumber::new(7).is_after(SequenceNumber::new(7)));
        // Exactly half the space away is ambiguous and never "after"
        assert!(!SequenceNumber::new(128).is_after(SequenceNumber::ZERO));
    }
}
