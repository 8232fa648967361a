//! Transmit-side retry buffer.
//!
//! Holds a copy of every transmitted data flit until a cumulative ACK covers
//! it. Retransmits on NAK (selective repeat) or when the entry's age reaches
//! the retry timeout; drops the entry and reports
//! [`RetryError::RetryExhausted`] once it has been retransmitted
//! `max_retries` times.

use std::collections::VecDeque;

use tracing::{debug, error, trace};

use crate::core::{Cycle, RetryConfig, RetryError};
use crate::flit::{Flit, FlitCodec, SequenceNumber};

/// A transmitted, unacknowledged flit.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    /// Assigned sequence number.
    pub sequence: SequenceNumber,
    /// Copy of the flit as transmitted.
    pub flit: Flit,
    /// Cycle of the most recent (re)transmission.
    pub sent_at: Cycle,
    /// Retransmissions performed so far.
    pub retry_count: u32,
}

impl RetryEntry {
    /// Check if the retry timeout has elapsed.
    pub fn is_expired(&self, now: Cycle, timeout: Cycle) -> bool {
        now.saturating_sub(self.sent_at) >= timeout
    }
}

/// Retry buffer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// First transmissions.
    pub transmitted: u64,
    /// Retransmissions (NAK and timeout).
    pub retransmissions: u64,
    /// Entries released by ACKs.
    pub acknowledged: u64,
    /// ACKs that covered nothing (duplicate or stale).
    pub stale_acks: u64,
    /// NAKs for sequence numbers no longer buffered.
    pub stale_naks: u64,
    /// Entries dropped after exhausting retries.
    pub exhausted: u64,
}

/// Transmit-side retry buffer.
///
/// Entries are kept in a bounded ring ordered by sequence number; the front
/// is always the oldest unacknowledged flit.
#[derive(Debug)]
pub struct RetryBuffer {
    codec: FlitCodec,
    config: RetryConfig,
    entries: VecDeque<RetryEntry>,
    next_sequence: SequenceNumber,
    /// Link session stamped on every submitted flit.
    session: u8,
    /// Encoded flits waiting for the physical layer.
    outbound: VecDeque<Vec<u8>>,
    accepting: bool,
    stats: RetryStats,
}

impl RetryBuffer {
    /// Create an empty buffer. New buffers accept submissions.
    pub fn new(codec: FlitCodec, config: &RetryConfig) -> Self {
        Self {
            codec,
            config: *config,
            entries: VecDeque::with_capacity(config.depth),
            next_sequence: SequenceNumber::ZERO,
            session: 0,
            outbound: VecDeque::new(),
            accepting: true,
            stats: RetryStats::default(),
        }
    }

    /// Assign the next sequence number and the current session, seal the
    /// flit, store a copy, and queue it for transmission.
    pub fn submit(&mut self, mut flit: Flit, now: Cycle) -> Result<SequenceNumber, RetryError> {
        if !self.accepting {
            return Err(RetryError::Paused);
        }
        if self.entries.len() >= self.config.depth {
            return Err(RetryError::BufferFull {
                depth: self.config.depth,
            });
        }

        let sequence = self.next_sequence;
        flit.header.sequence = sequence;
        flit.header = flit.header.with_session(self.session);
        flit.crc = flit.compute_crc()?;
        let bytes = flit.to_bytes()?;

        self.entries.push_back(RetryEntry {
            sequence,
            flit,
            sent_at: now,
            retry_count: 0,
        });
        self.outbound.push_back(bytes);
        self.next_sequence = sequence.next();
        self.stats.transmitted += 1;

        trace!(%sequence, "flit submitted");
        Ok(sequence)
    }

    /// Process a cumulative ACK: release every entry up to and including
    /// `sequence`. ACKs outside the outstanding window are ignored, so a
    /// repeated ACK has no further effect.
    ///
    /// Returns the number of entries released.
    pub fn on_ack(&mut self, sequence: SequenceNumber) -> usize {
        let Some(front) = self.entries.front() else {
            self.stats.stale_acks += 1;
            return 0;
        };

        let offset = sequence.distance_from(front.sequence);
        if offset >= self.entries.len() {
            self.stats.stale_acks += 1;
            trace!(%sequence, oldest = %front.sequence, "stale ack ignored");
            return 0;
        }

        let released = offset + 1;
        self.entries.drain(..released);
        self.stats.acknowledged += released as u64;
        trace!(%sequence, released, "ack");
        released
    }

    /// Process a NAK: retransmit exactly `sequence` and restart its timer.
    ///
    /// Returns `Ok(true)` if a retransmission was queued, `Ok(false)` if the
    /// sequence number is no longer buffered.
    pub fn on_nak(&mut self, sequence: SequenceNumber, now: Cycle) -> Result<bool, RetryError> {
        let Some(front) = self.entries.front() else {
            self.stats.stale_naks += 1;
            return Ok(false);
        };

        let index = sequence.distance_from(front.sequence);
        if index >= self.entries.len() {
            self.stats.stale_naks += 1;
            trace!(%sequence, "nak for unbuffered sequence ignored");
            return Ok(false);
        }

        debug!(%sequence, "nak received, retransmitting");
        self.retransmit(index, now)?;
        Ok(true)
    }

    /// Retransmit every entry whose age reached the retry timeout.
    ///
    /// Returns the number of retransmissions, or `RetryExhausted` for the
    /// first entry that ran out of retries (that entry is dropped).
    pub fn tick(&mut self, now: Cycle) -> Result<usize, RetryError> {
        let timeout = self.config.timeout_cycles;
        let mut retransmitted = 0;

        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].is_expired(now, timeout) {
                let sequence = self.entries[index].sequence;
                debug!(%sequence, "retry timeout");
                self.retransmit(index, now)?;
                retransmitted += 1;
            }
            index += 1;
        }

        Ok(retransmitted)
    }

    /// Retransmit the entry at `index`, or drop it if retries are exhausted.
    fn retransmit(&mut self, index: usize, now: Cycle) -> Result<(), RetryError> {
        let max_retries = self.config.max_retries;
        let entry = &mut self.entries[index];

        if entry.retry_count >= max_retries {
            let sequence = entry.sequence;
            let attempts = entry.retry_count;
            self.entries.remove(index);
            self.stats.exhausted += 1;
            error!(%sequence, attempts, "retry exhausted, flit dropped");
            return Err(RetryError::RetryExhausted { sequence, attempts });
        }

        entry.retry_count += 1;
        entry.sent_at = now;
        let bytes = entry.flit.to_bytes()?;
        self.outbound.push_back(bytes);
        self.stats.retransmissions += 1;
        Ok(())
    }

    /// Next encoded flit for the physical layer.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop_front()
    }

    /// Check whether another flit can be submitted right now.
    pub fn has_capacity(&self) -> bool {
        self.accepting && self.entries.len() < self.config.depth
    }

    /// Stop accepting new submissions. Retransmissions continue.
    pub fn pause(&mut self) {
        self.accepting = false;
    }

    /// Accept new submissions again.
    pub fn resume(&mut self) {
        self.accepting = true;
    }

    /// Whether new submissions are accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Session stamped on flits submitted from now on.
    pub fn set_session(&mut self, session: u8) {
        self.session = session;
    }

    /// Discard all entries and queued bytes, and restart sequence numbering
    /// at zero. Returns the number of unacknowledged flits discarded; those
    /// flits are lost.
    pub fn reset(&mut self) -> usize {
        let discarded = self.entries.len();
        self.entries.clear();
        self.outbound.clear();
        self.next_sequence = SequenceNumber::ZERO;
        discarded
    }

    /// Number of unacknowledged flits.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether every transmitted flit has been acknowledged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether encoded flits are waiting for the physical layer.
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Sequence number the next submission will receive.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.next_sequence
    }

    /// Oldest unacknowledged entry.
    pub fn oldest(&self) -> Option<&RetryEntry> {
        self.entries.front()
    }

    /// Counters.
    pub fn stats(&self) -> RetryStats {
        self.stats
    }
}
