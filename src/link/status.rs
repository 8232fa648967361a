//! Read-only status outputs and link events.

use crate::arbiter::ChannelId;
use crate::core::{CreditViolation, Cycle};
use crate::flit::{ProtocolId, SequenceNumber};

use super::state::LinkState;

/// Something the collaborator should know about. Drained with
/// `LinkController::poll_event`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Link state changed.
    StateChanged {
        /// Previous state.
        from: LinkState,
        /// New state.
        to: LinkState,
    },
    /// A flit exceeded the retry limit and was dropped.
    RetryExhausted {
        /// Dropped sequence number.
        sequence: SequenceNumber,
        /// Retransmissions performed.
        attempts: u32,
    },
    /// Flits discarded by a retrain or reset; recovery is up to the
    /// protocol layers above.
    DataLoss {
        /// Number of flits discarded.
        flits: usize,
    },
    /// CRC failure rate crossed the alarm threshold.
    LinkQualityAlarm {
        /// CRC failures in the current window.
        crc_failures: u32,
    },
    /// The arbiter force-granted a credit.
    EmergencyCreditGrant {
        /// Channel that received the credit.
        channel: ChannelId,
    },
    /// Credit invariant breach; the link moved to ERROR.
    CreditViolation(CreditViolation),
    /// A training handshake timed out; the link moved to ERROR.
    TrainingTimeout {
        /// State that timed out.
        state: LinkState,
    },
}

/// Cumulative error counters. Never reset, not even by a retrain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    /// Received flits that failed CRC.
    pub crc_failures: u64,
    /// Received flits that passed CRC but failed to decode.
    pub codec_errors: u64,
    /// Received data flits outside the reorder window.
    pub out_of_window: u64,
    /// Received flits from a link session ended by a retrain.
    pub stale_session: u64,
    /// Retransmissions on NAK or timeout.
    pub retransmissions: u64,
    /// Flits dropped after the retry limit.
    pub retry_exhausted: u64,
    /// Grants forced by the starvation threshold.
    pub starvation_events: u64,
    /// Emergency credit grants.
    pub emergency_grants: u64,
    /// Flits discarded by retrain or reset.
    pub flits_lost: u64,
    /// Delivered flits or credit returns for an unconfigured channel.
    pub misrouted: u64,
    /// Delivered flits that arrived beyond the advertised receive credits.
    pub rx_overflows: u64,
    /// Credits returned beyond what was outstanding.
    pub credit_overflows: u64,
    /// Link-quality alarms raised.
    pub quality_alarms: u64,
    /// Training handshake timeouts.
    pub state_timeouts: u64,
}

/// Per-channel credit and utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Channel id.
    pub channel: ChannelId,
    /// Protocol carried.
    pub protocol: ProtocolId,
    /// Virtual channel.
    pub virtual_channel: u8,
    /// Credits available for transmit.
    pub available: u16,
    /// Credits consumed and not yet returned.
    pub consumed: u16,
    /// Transmit slots granted.
    pub grants: u64,
    /// Flits waiting in the submit queue.
    pub queued: usize,
    /// Received flits waiting for `recv`.
    pub received: usize,
}

/// Status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    /// Current state.
    pub state: LinkState,
    /// Current cycle.
    pub cycle: Cycle,
    /// Unacknowledged flits in the retry buffer.
    pub retry_occupancy: usize,
    /// Whether the link is draining toward a low-power state.
    pub draining: bool,
    /// Per-channel status, in channel order.
    pub channels: Vec<ChannelStatus>,
    /// Cumulative error counters.
    pub counters: ErrorCounters,
}

impl LinkStatus {
    /// Status of one channel.
    pub fn channel(&self, id: ChannelId) -> Option<&ChannelStatus> {
        self.channels.get(id.index())
    }
}
