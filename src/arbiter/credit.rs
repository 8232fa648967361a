//! Per-virtual-channel credit counters.
//!
//! A credit is one unit of receive buffer space at the peer. The sender
//! consumes one per data flit and gets it back through a credit-return
//! control flit once the peer's upper layer has drained the buffer.
//!
//! `available + consumed` always equals the nominal count advertised at link
//! bring-up.

use crate::arbiter::ChannelId;
use crate::core::CreditViolation;

/// Credit state for one (protocol, virtual channel) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditCounter {
    nominal: u16,
    available: u16,
    consumed: u16,
}

impl CreditCounter {
    /// Create a counter holding `nominal` credits.
    pub fn new(nominal: u16) -> Self {
        Self {
            nominal,
            available: nominal,
            consumed: 0,
        }
    }

    /// Credits configured at bring-up.
    pub fn nominal(&self) -> u16 {
        self.nominal
    }

    /// Credits currently available.
    pub fn available(&self) -> u16 {
        self.available
    }

    /// Credits consumed and not yet returned.
    pub fn consumed(&self) -> u16 {
        self.consumed
    }

    /// Whether at least one credit is available.
    pub fn has_credit(&self) -> bool {
        self.available > 0
    }

    /// Take one credit for a transmission on `channel`.
    ///
    /// Consuming with zero available credits is a scheduling bug and is
    /// reported rather than clamped.
    pub fn consume(&mut self, channel: ChannelId) -> Result<(), CreditViolation> {
        if self.available == 0 {
            return Err(CreditViolation::Underflow { channel });
        }
        self.available -= 1;
        self.consumed += 1;
        Ok(())
    }

    /// Return `count` credits. Anything beyond what is outstanding is
    /// dropped; the dropped amount is returned so the caller can record it.
    pub fn restore(&mut self, count: u16) -> u16 {
        let accepted = count.min(self.consumed);
        self.consumed -= accepted;
        self.available += accepted;
        count - accepted
    }

    /// Move one outstanding credit back to available without a credit
    /// return from the peer. Returns `false` if nothing is outstanding.
    pub fn force_grant(&mut self) -> bool {
        if self.consumed == 0 {
            return false;
        }
        self.consumed -= 1;
        self.available += 1;
        true
    }

    /// Restore the nominal count (link reset or retrain).
    pub fn reset(&mut self) {
        self.available = self.nominal;
        self.consumed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_until_empty() {
        let mut credit = CreditCounter::new(2);
        credit.consume(ChannelId(0)).unwrap();
        credit.consume(ChannelId(0)).unwrap();
        assert!(!credit.has_credit());
        assert_eq!(credit.consumed(), 2);

        assert_eq!(
            credit.consume(ChannelId(0)).unwrap_err(),
            CreditViolation::Underflow {
                channel: ChannelId(0)
            }
        );
        // A failed consume leaves the counter untouched
        assert_eq!(credit.available(), 0);
        assert_eq!(credit.consumed(), 2);
    }

    #[test]
    fn test_restore_clamps_over_return() {
        let mut credit = CreditCounter::new(4);
        credit.consume(ChannelId(1)).unwrap();

        assert_eq!(credit.restore(3), 2);
        assert_eq!(credit.available(), 4);
        assert_eq!(credit.consumed(), 0);
    }

    #[test]
    fn test_force_grant() {
        let mut credit = CreditCounter::new(1);
        assert!(!credit.force_grant());

        credit.consume(ChannelId(0)).unwrap();
        assert!(credit.force_grant());
        assert_eq!(credit.available() + credit.consumed(), credit.nominal());

        // Late return of the credit that was force-granted is an over-return
        assert_eq!(credit.restore(1), 1);
    }

    #[test]
    fn test_reset() {
        let mut credit = CreditCounter::new(3);
        credit.consume(ChannelId(0)).unwrap();
        credit.reset();
        assert_eq!(credit, CreditCounter::new(3));
    }
}
