//! Receive-side flit processing.
//!
//! Verifies the CRC of every incoming flit before looking at any field,
//! separates control flits from data flits, and releases data flits strictly
//! in sequence order. Flits that arrive ahead of a gap are parked in a
//! reorder window bounded by the retry depth; duplicates are dropped.
//!
//! The receiver also decides what to tell the sender: a coalesced cumulative
//! ACK for the highest in-order sequence number, and at most one outstanding
//! NAK per missing sequence number.
//!
//! Every flit carries the sender's link session. A retrain ends the session
//! the receiver was in; flits stamped with an ended or older session are
//! dropped, so nothing still in flight from before the retrain can be
//! mistaken for a flit of the restarted sequence space.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::core::{Cycle, ReceiveError, RetryConfig, SEQUENCE_MODULUS, SESSION_MODULUS};
use crate::flit::{ControlFlit, Flit, FlitCodec, FlitType, SequenceNumber, crc};

/// Outcome of accepting a flit that passed CRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptedFlit {
    /// Data flits released in order (the received flit plus any parked
    /// flits it unblocked).
    Delivered(Vec<Flit>),
    /// Data flit parked ahead of a gap; `missing` is the first absent number.
    Buffered {
        /// Received sequence number.
        sequence: SequenceNumber,
        /// Next in-order sequence number, not yet received.
        missing: SequenceNumber,
    },
    /// Already delivered or already parked; dropped.
    Duplicate {
        /// Received sequence number.
        sequence: SequenceNumber,
    },
    /// Link-layer control flit.
    Control(ControlFlit),
}

/// Receive path counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    /// Data flits delivered in order.
    pub delivered: u64,
    /// Data flits parked out of order.
    pub reordered: u64,
    /// Duplicate data flits dropped.
    pub duplicates: u64,
    /// Control flits received.
    pub control: u64,
    /// Flits that failed CRC.
    pub crc_failures: u64,
    /// Flits that passed CRC but failed to decode.
    pub codec_errors: u64,
    /// Flits outside the receive window.
    pub outside_window: u64,
    /// Flits from an ended link session.
    pub stale_session: u64,
}

/// Receive-side reorder buffer and ACK/NAK generator.
#[derive(Debug)]
pub struct ReorderBuffer {
    codec: FlitCodec,
    window: usize,
    /// Next in-order sequence number.
    expected: SequenceNumber,
    /// Slot `i` holds sequence `expected + i`.
    slots: VecDeque<Option<Flit>>,
    /// Highest in-order sequence number not yet acknowledged.
    ack_pending: Option<SequenceNumber>,
    /// Sequence number most recently NAKed without progress since.
    nak_outstanding: Option<SequenceNumber>,
    /// Session of the peer's transmitter.
    peer_session: u8,
    /// Set by `reset`: `peer_session` has ended and only a newer one is
    /// accepted.
    session_ended: bool,
    /// Cycles of recent CRC failures, for the link-quality alarm.
    crc_failures: VecDeque<Cycle>,
    alarm_threshold: u32,
    alarm_window: Cycle,
    last_alarm: Option<Cycle>,
    alarm_pending: bool,
    stats: ReceiveStats,
}

impl ReorderBuffer {
    /// Create a receiver whose reorder window equals the retry depth.
    pub fn new(codec: FlitCodec, config: &RetryConfig) -> Self {
        let window = config.depth;
        Self {
            codec,
            window,
            expected: SequenceNumber::ZERO,
            slots: (0..window).map(|_| None).collect(),
            ack_pending: None,
            nak_outstanding: None,
            peer_session: 0,
            session_ended: false,
            crc_failures: VecDeque::new(),
            alarm_threshold: config.crc_alarm_threshold,
            alarm_window: config.crc_alarm_window,
            last_alarm: None,
            alarm_pending: false,
            stats: ReceiveStats::default(),
        }
    }

    /// Process one flit from the physical layer.
    ///
    /// Order of checks: length, CRC, header decode, session, sequence
    /// window. A flit that fails an earlier check is never examined further.
    pub fn on_receive(&mut self, bytes: &[u8], now: Cycle) -> Result<AcceptedFlit, ReceiveError> {
        let expected_len = self.codec.flit_size();
        if bytes.len() != expected_len {
            self.stats.codec_errors += 1;
            return Err(crate::core::CodecError::Malformed {
                expected: expected_len,
                actual: bytes.len(),
            }
            .into());
        }

        if !crc::verify(bytes) {
            self.record_crc_failure(now);
            trace!(expected = %self.expected, "crc failure");
            return Err(ReceiveError::CrcFailure {
                expected: self.expected,
            });
        }

        let flit = self.codec.decode(bytes).inspect_err(|_| {
            self.stats.codec_errors += 1;
        })?;

        self.check_session(flit.header.session)?;

        if flit.header.flit_type == FlitType::Control {
            let control = ControlFlit::from_flit(&flit).inspect_err(|_| {
                self.stats.codec_errors += 1;
            })?;
            self.stats.control += 1;
            return Ok(AcceptedFlit::Control(control));
        }

        self.accept_data(flit)
    }

    fn check_session(&mut self, session: u8) -> Result<(), ReceiveError> {
        let current = self.peer_session;
        let ahead = session.wrapping_sub(current) % SESSION_MODULUS;

        if ahead == 0 && !self.session_ended {
            return Ok(());
        }
        if ahead > 0 && ahead < SESSION_MODULUS / 2 {
            if !self.session_ended {
                // The peer retrained without us; its numbering restarted.
                let parked = self.reset_window();
                debug!(session, current, parked, "peer started a new session");
            }
            self.peer_session = session;
            self.session_ended = false;
            return Ok(());
        }

        self.stats.stale_session += 1;
        trace!(session, current, "flit from ended session dropped");
        Err(ReceiveError::StaleSession { session, current })
    }

    fn accept_data(&mut self, flit: Flit) -> Result<AcceptedFlit, ReceiveError> {
        let sequence = flit.header.sequence;
        let offset = sequence.distance_from(self.expected);

        if offset == 0 {
            return Ok(AcceptedFlit::Delivered(self.release(flit)));
        }

        if offset < self.window {
            if self.slots[offset].is_some() {
                self.stats.duplicates += 1;
                return Ok(AcceptedFlit::Duplicate { sequence });
            }
            self.slots[offset] = Some(flit);
            self.stats.reordered += 1;
            trace!(%sequence, missing = %self.expected, "flit parked out of order");
            return Ok(AcceptedFlit::Buffered {
                sequence,
                missing: self.expected,
            });
        }

        if offset >= SEQUENCE_MODULUS as usize - self.window {
            // Behind the window: already delivered. Re-acknowledge in case
            // the first ACK was lost.
            self.stats.duplicates += 1;
            self.ack_pending = Some(self.expected.prev());
            return Ok(AcceptedFlit::Duplicate { sequence });
        }

        self.stats.outside_window += 1;
        warn!(%sequence, expected = %self.expected, "flit outside receive window");
        Err(ReceiveError::OutsideWindow {
            sequence,
            expected: self.expected,
        })
    }

    /// Deliver `flit` (which is at `expected`) and every parked flit it
    /// unblocks.
    fn release(&mut self, flit: Flit) -> Vec<Flit> {
        let mut delivered = vec![flit];
        self.advance();

        while let Some(Some(_)) = self.slots.front() {
            if let Some(Some(parked)) = self.slots.pop_front() {
                self.slots.push_back(None);
                // `advance` already rotated once for the head flit; parked
                // flits rotate here.
                self.expected = self.expected.next();
                delivered.push(parked);
            }
        }

        self.stats.delivered += delivered.len() as u64;
        self.ack_pending = Some(self.expected.prev());
        self.nak_outstanding = None;
        delivered
    }

    fn advance(&mut self) {
        self.slots.pop_front();
        self.slots.push_back(None);
        self.expected = self.expected.next();
    }

    fn record_crc_failure(&mut self, now: Cycle) {
        self.stats.crc_failures += 1;
        self.crc_failures.push_back(now);
        while let Some(&oldest) = self.crc_failures.front() {
            if now.saturating_sub(oldest) >= self.alarm_window {
                self.crc_failures.pop_front();
            } else {
                break;
            }
        }

        let recent = self.crc_failures.len() as u32;
        let rearmed = self
            .last_alarm
            .is_none_or(|at| now.saturating_sub(at) >= self.alarm_window);
        if self.alarm_threshold > 0 && recent >= self.alarm_threshold && rearmed {
            self.last_alarm = Some(now);
            self.alarm_pending = true;
            warn!(recent, window = self.alarm_window, "link quality alarm");
        }
    }

    /// Decide whether to NAK `sequence`. Returns `false` if a NAK for the
    /// same number is already outstanding.
    pub fn request_nak(&mut self, sequence: SequenceNumber) -> bool {
        if self.nak_outstanding == Some(sequence) {
            return false;
        }
        self.nak_outstanding = Some(sequence);
        true
    }

    /// Take the pending cumulative ACK, if any.
    pub fn take_ack(&mut self) -> Option<SequenceNumber> {
        self.ack_pending.take()
    }

    /// Take the pending link-quality alarm, returning the number of CRC
    /// failures in the current window.
    pub fn take_quality_alarm(&mut self) -> Option<u32> {
        if std::mem::take(&mut self.alarm_pending) {
            Some(self.crc_failures.len() as u32)
        } else {
            None
        }
    }

    /// Drop parked flits, restart at sequence zero and end the current peer
    /// session. Returns the number of parked flits discarded.
    pub fn reset(&mut self) -> usize {
        self.session_ended = true;
        self.reset_window()
    }

    fn reset_window(&mut self) -> usize {
        let discarded = self.slots.iter().filter(|s| s.is_some()).count();
        self.slots.iter_mut().for_each(|s| *s = None);
        self.expected = SequenceNumber::ZERO;
        self.ack_pending = None;
        self.nak_outstanding = None;
        discarded
    }

    /// Next in-order sequence number.
    pub fn expected(&self) -> SequenceNumber {
        self.expected
    }

    /// Session of the peer's transmitter, and whether it has ended.
    pub fn peer_session(&self) -> (u8, bool) {
        (self.peer_session, self.session_ended)
    }

    /// Number of flits parked out of order.
    pub fn parked(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Counters.
    pub fn stats(&self) -> ReceiveStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flit::{FlitHeader, ProtocolId};

    fn config(depth: usize) -> RetryConfig {
        RetryConfig {
            depth,
            crc_alarm_threshold: 3,
            crc_alarm_window: 100,
            ..RetryConfig::default()
        }
    }

    fn wire(codec: &FlitCodec, seq: u8) -> Vec<u8> {
        wire_in(codec, seq, 0)
    }

    fn wire_in(codec: &FlitCodec, seq: u8, session: u8) -> Vec<u8> {
        let mut header =
            FlitHeader::new(ProtocolId::Pcie, 0, FlitType::Single).with_session(session);
        header.sequence = SequenceNumber::new(seq);
        codec.encode(header, &[seq]).unwrap()
    }

    fn delivered_seqs(result: AcceptedFlit) -> Vec<u8> {
        match result {
            AcceptedFlit::Delivered(flits) => {
                flits.iter().map(|f| f.header.sequence.value()).collect()
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn test_in_order_delivery() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));

        for seq in 0..3 {
            let result = rx.on_receive(&wire(&codec, seq), 0).unwrap();
            assert_eq!(delivered_seqs(result), vec![seq]);
        }
        assert_eq!(rx.expected(), SequenceNumber::new(3));
        assert_eq!(rx.take_ack(), Some(SequenceNumber::new(2)));
        assert_eq!(rx.take_ack(), None);
    }

    #[test]
    fn test_reorder_releases_in_order() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));

        rx.on_receive(&wire(&codec, 0), 0).unwrap();
        assert_eq!(
            rx.on_receive(&wire(&codec, 2), 0).unwrap(),
            AcceptedFlit::Buffered {
                sequence: SequenceNumber::new(2),
                missing: SequenceNumber::new(1),
            }
        );
        rx.on_receive(&wire(&codec, 3), 0).unwrap();
        assert_eq!(rx.parked(), 2);

        let result = rx.on_receive(&wire(&codec, 1), 0).unwrap();
        assert_eq!(delivered_seqs(result), vec![1, 2, 3]);
        assert_eq!(rx.expected(), SequenceNumber::new(4));
        assert_eq!(rx.parked(), 0);
        assert_eq!(rx.take_ack(), Some(SequenceNumber::new(3)));
    }

    #[test]
    fn test_duplicates_dropped() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));

        rx.on_receive(&wire(&codec, 0), 0).unwrap();
        rx.take_ack();
        assert_eq!(
            rx.on_receive(&wire(&codec, 0), 0).unwrap(),
            AcceptedFlit::Duplicate {
                sequence: SequenceNumber::new(0)
            }
        );
        // Late duplicate triggers a re-ACK
        assert_eq!(rx.take_ack(), Some(SequenceNumber::new(0)));

        rx.on_receive(&wire(&codec, 2), 0).unwrap();
        assert!(matches!(
            rx.on_receive(&wire(&codec, 2), 0).unwrap(),
            AcceptedFlit::Duplicate { .. }
        ));
        assert_eq!(rx.stats().duplicates, 2);
    }

    #[test]
    fn test_outside_window() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(4));
        assert_eq!(
            rx.on_receive(&wire(&codec, 60), 0).unwrap_err(),
            ReceiveError::OutsideWindow {
                sequence: SequenceNumber::new(60),
                expected: SequenceNumber::ZERO,
            }
        );
    }

    #[test]
    fn test_crc_failure_reports_expected() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));
        rx.on_receive(&wire(&codec, 0), 0).unwrap();

        let mut bad = wire(&codec, 1);
        bad[2] ^= 0x40;
        assert_eq!(
            rx.on_receive(&bad, 0).unwrap_err(),
            ReceiveError::CrcFailure {
                expected: SequenceNumber::new(1)
            }
        );
        assert_eq!(rx.expected(), SequenceNumber::new(1));
        assert_eq!(rx.stats().crc_failures, 1);
    }

    #[test]
    fn test_nak_suppression() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));

        assert!(rx.request_nak(SequenceNumber::new(0)));
        assert!(!rx.request_nak(SequenceNumber::new(0)));

        // Progress clears the outstanding NAK
        rx.on_receive(&wire(&codec, 0), 0).unwrap();
        assert!(rx.request_nak(SequenceNumber::new(1)));
    }

    #[test]
    fn test_malformed_length() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));
        assert!(matches!(
            rx.on_receive(&[0u8; 5], 0),
            Err(ReceiveError::Codec(_))
        ));
        assert_eq!(rx.stats().codec_errors, 1);
    }

    #[test]
    fn test_control_flit_passthrough() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));
        let bytes = ControlFlit::Ack(SequenceNumber::new(9)).encode(&codec, 0).unwrap();
        assert_eq!(
            rx.on_receive(&bytes, 0).unwrap(),
            AcceptedFlit::Control(ControlFlit::Ack(SequenceNumber::new(9)))
        );
        assert_eq!(rx.expected(), SequenceNumber::ZERO);
    }

    #[test]
    fn test_quality_alarm_once_per_window() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));
        let mut bad = wire(&codec, 0);
        bad[5] ^= 0xFF;

        for t in 0..2 {
            let _ = rx.on_receive(&bad, t);
        }
        assert_eq!(rx.take_quality_alarm(), None);

        let _ = rx.on_receive(&bad, 2);
        assert_eq!(rx.take_quality_alarm(), Some(3));

        // Still inside the window: no second alarm
        let _ = rx.on_receive(&bad, 3);
        assert_eq!(rx.take_quality_alarm(), None);

        // Failures spread beyond the window do not accumulate
        let _ = rx.on_receive(&bad, 500);
        assert_eq!(rx.take_quality_alarm(), None);
    }

    #[test]
    fn test_sequence_wraps() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));
        for seq in 0..=255u8 {
            rx.on_receive(&wire(&codec, seq), 0).unwrap();
        }
        assert_eq!(rx.expected(), SequenceNumber::ZERO);
        assert_eq!(delivered_seqs(rx.on_receive(&wire(&codec, 0), 0).unwrap()), vec![0]);
    }

    #[test]
    fn test_reset() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));
        rx.on_receive(&wire(&codec, 0), 0).unwrap();
        rx.on_receive(&wire(&codec, 3), 0).unwrap();

        assert_eq!(rx.reset(), 1);
        assert_eq!(rx.expected(), SequenceNumber::ZERO);
        assert_eq!(rx.take_ack(), None);
    }

    #[test]
    fn test_reset_rejects_flits_from_ended_session() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));
        rx.on_receive(&wire(&codec, 0), 0).unwrap();
        rx.reset();

        // Old-session flits still on the wire: sequence 1 would otherwise be
        // parked and sequence 0 delivered as fresh data.
        for seq in [1, 0] {
            assert_eq!(
                rx.on_receive(&wire(&codec, seq), 0).unwrap_err(),
                ReceiveError::StaleSession {
                    session: 0,
                    current: 0
                }
            );
        }
        let ack = ControlFlit::Ack(SequenceNumber::new(4)).encode(&codec, 0).unwrap();
        assert!(matches!(
            rx.on_receive(&ack, 0),
            Err(ReceiveError::StaleSession { .. })
        ));
        assert_eq!(rx.expected(), SequenceNumber::ZERO);
        assert_eq!(rx.stats().stale_session, 3);

        // The first flit of the next session is accepted and pins it
        let result = rx.on_receive(&wire_in(&codec, 0, 1), 0).unwrap();
        assert_eq!(delivered_seqs(result), vec![0]);
        assert_eq!(rx.peer_session(), (1, false));
        assert!(matches!(
            rx.on_receive(&wire(&codec, 1), 0),
            Err(ReceiveError::StaleSession { .. })
        ));
    }

    #[test]
    fn test_newer_session_restarts_window() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));
        for seq in 0..3 {
            rx.on_receive(&wire(&codec, seq), 0).unwrap();
        }
        rx.on_receive(&wire(&codec, 5), 0).unwrap();
        assert_eq!(rx.parked(), 1);

        // Peer retrained on its own and restarted at zero
        let result = rx.on_receive(&wire_in(&codec, 0, 2), 0).unwrap();
        assert_eq!(delivered_seqs(result), vec![0]);
        assert_eq!(rx.parked(), 0);
        assert_eq!(rx.expected(), SequenceNumber::new(1));
    }

    #[test]
    fn test_session_wraps() {
        let codec = FlitCodec::new(4).unwrap();
        let mut rx = ReorderBuffer::new(codec, &config(8));
        for session in 1..=17u8 {
            rx.reset();
            let result = rx.on_receive(&wire_in(&codec, 0, session), 0).unwrap();
            assert_eq!(delivered_seqs(result), vec![0]);
        }
        assert_eq!(rx.peer_session(), (1, false));
        // Eight or more behind counts as older
        assert!(rx.on_receive(&wire_in(&codec, 1, 9), 0).is_err());
    }
}
