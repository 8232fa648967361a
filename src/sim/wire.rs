//! One direction of a lossy physical channel.

use std::collections::{BTreeSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::core::Cycle;

/// Wire counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WireStats {
    /// Flits offered to the wire.
    pub sent: u64,
    /// Flits with at least one bit flipped.
    pub corrupted: u64,
    /// Flits dropped entirely.
    pub dropped: u64,
}

/// A unidirectional wire with fixed latency, random single-bit errors, and
/// scripted corruption or loss of specific flits.
///
/// Randomness comes from a seeded RNG, so a run is reproducible.
#[derive(Debug)]
pub struct LossyWire {
    rng: StdRng,
    bit_error_rate: f64,
    latency: Cycle,
    corrupt: BTreeSet<u64>,
    drop: BTreeSet<u64>,
    in_flight: VecDeque<(Cycle, Vec<u8>)>,
    stats: WireStats,
}

impl LossyWire {
    /// Create a wire with the given per-flit error probability.
    pub fn new(seed: u64, bit_error_rate: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            bit_error_rate: bit_error_rate.clamp(0.0, 1.0),
            latency: 1,
            corrupt: BTreeSet::new(),
            drop: BTreeSet::new(),
            in_flight: VecDeque::new(),
            stats: WireStats::default(),
        }
    }

    /// An error-free wire.
    pub fn perfect() -> Self {
        Self::new(0, 0.0)
    }

    /// Set the delivery latency in cycles.
    pub fn with_latency(mut self, latency: Cycle) -> Self {
        self.latency = latency;
        self
    }

    /// Flip one bit of the `n`th flit sent (zero based).
    pub fn corrupt_nth(&mut self, n: u64) {
        self.corrupt.insert(n);
    }

    /// Drop the `n`th flit sent (zero based).
    pub fn drop_nth(&mut self, n: u64) {
        self.drop.insert(n);
    }

    /// Put a flit on the wire at cycle `now`.
    pub fn send(&mut self, mut bytes: Vec<u8>, now: Cycle) {
        let index = self.stats.sent;
        self.stats.sent += 1;

        if self.drop.remove(&index) {
            self.stats.dropped += 1;
            trace!(index, "flit dropped on wire");
            return;
        }

        let scripted = self.corrupt.remove(&index);
        let random = self.bit_error_rate > 0.0 && self.rng.gen_bool(self.bit_error_rate);
        if (scripted || random) && !bytes.is_empty() {
            let bit = self.rng.gen_range(0..bytes.len() * 8);
            bytes[bit / 8] ^= 1 << (bit % 8);
            self.stats.corrupted += 1;
            trace!(index, bit, "bit flipped on wire");
        }

        self.in_flight.push_back((now + self.latency, bytes));
    }

    /// Take every flit that has arrived by cycle `now`.
    pub fn deliver(&mut self, now: Cycle) -> Vec<Vec<u8>> {
        let mut arrived = Vec::new();
        while let Some((due, _)) = self.in_flight.front() {
            if *due > now {
                break;
            }
            if let Some((_, bytes)) = self.in_flight.pop_front() {
                arrived.push(bytes);
            }
        }
        arrived
    }

    /// Flits still in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Counters.
    pub fn stats(&self) -> WireStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flit::{FlitCodec, FlitHeader, FlitType, ProtocolId, crc};

    #[test]
    fn test_latency() {
        let mut wire = LossyWire::perfect().with_latency(3);
        wire.send(vec![1, 2, 3], 10);
        assert!(wire.deliver(12).is_empty());
        assert_eq!(wire.deliver(13), vec![vec![1, 2, 3]]);
        assert_eq!(wire.in_flight(), 0);
    }

    #[test]
    fn test_scripted_corruption_breaks_crc() {
        let codec = FlitCodec::default();
        let bytes = codec
            .encode(FlitHeader::new(ProtocolId::Pcie, 0, FlitType::Single), b"abc")
            .unwrap();

        let mut wire = LossyWire::new(7, 0.0);
        wire.corrupt_nth(1);
        for t in 0..3 {
            wire.send(bytes.clone(), t);
        }

        let arrived = wire.deliver(10);
        let valid: Vec<_> = arrived.iter().map(|b| crc::verify(b)).collect();
        assert_eq!(valid, vec![true, false, true]);
        assert_eq!(wire.stats().corrupted, 1);
    }

    #[test]
    fn test_drop() {
        let mut wire = LossyWire::perfect();
        wire.drop_nth(0);
        wire.send(vec![1], 0);
        wire.send(vec![2], 0);
        assert_eq!(wire.deliver(5), vec![vec![2]]);
        assert_eq!(wire.stats().dropped, 1);
    }

    #[test]
    fn test_seeded_errors_reproducible() {
        let run = |seed| {
            let mut wire = LossyWire::new(seed, 0.3);
            for t in 0..100 {
                wire.send(vec![0u8; 8], t);
            }
            wire.deliver(1000)
        };
        assert_eq!(run(42), run(42));

        let corrupted = run(42).iter().filter(|b| b.iter().any(|&x| x != 0)).count();
        assert!(corrupted > 10 && corrupted < 60, "{corrupted}");
    }
}
