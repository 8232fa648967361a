//! Link-layer constants.
//!
//! Wire sizes are fixed by the flit format and MUST NOT be changed without
//! changing both ends of the link. Timing defaults are in link cycles and can
//! be overridden through [`LinkConfig`](super::LinkConfig).

/// Logical time, in link cycles.
pub type Cycle = u64;

// =============================================================================
// FLIT WIRE FORMAT
// =============================================================================

/// Flit header size (protocol id + VC + sequence number + type).
pub const FLIT_HEADER_SIZE: usize = 4;

/// Trailing CRC size.
pub const FLIT_CRC_SIZE: usize = 4;

/// Default payload width in bytes (256 bits).
pub const DEFAULT_PAYLOAD_SIZE: usize = 32;

/// Largest payload width accepted by the codec.
pub const MAX_PAYLOAD_SIZE: usize = 255;

/// Smallest payload width; control flits need four payload bytes.
pub const MIN_PAYLOAD_SIZE: usize = 4;

/// Number of virtual channels per protocol (4-bit field).
pub const MAX_VIRTUAL_CHANNELS: u8 = 16;

// =============================================================================
// SEQUENCE SPACE
// =============================================================================

/// Sequence number width in bits.
pub const SEQUENCE_BITS: u32 = 8;

/// Sequence modulus `M`.
pub const SEQUENCE_MODULUS: u32 = 1 << SEQUENCE_BITS;

/// Largest retry/reorder window that still disambiguates wrapped numbers
/// (strictly less than `M / 2`).
pub const MAX_RETRY_WINDOW: usize = (SEQUENCE_MODULUS / 2) as usize - 1;

/// Link session modulus (4-bit field in the upper half of header byte 1).
pub const SESSION_MODULUS: u8 = 16;

// =============================================================================
// CONTROL FLIT KINDS
// =============================================================================

/// Cumulative acknowledgment.
pub const CONTROL_ACK: u8 = 0x01;

/// Negative acknowledgment (selective retransmit request).
pub const CONTROL_NAK: u8 = 0x02;

/// Credit return for one (protocol, VC) pair.
pub const CONTROL_CREDIT_RETURN: u8 = 0x03;

// =============================================================================
// RETRY DEFAULTS
// =============================================================================

/// Default retry buffer depth.
pub const DEFAULT_RETRY_DEPTH: usize = 32;

/// Default retransmission timeout.
pub const DEFAULT_RETRY_TIMEOUT: Cycle = 64;

/// Default maximum retransmissions per flit.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Default CRC failures per window that raise a link-quality alarm.
pub const DEFAULT_CRC_ALARM_THRESHOLD: u32 = 8;

/// Default CRC alarm window.
pub const DEFAULT_CRC_ALARM_WINDOW: Cycle = 1024;

// =============================================================================
// ARBITRATION DEFAULTS
// =============================================================================

/// Default starvation threshold.
pub const DEFAULT_STARVATION_THRESHOLD: Cycle = 32;

/// Default priority boost per waited cycle.
pub const DEFAULT_AGING_STEP: u32 = 1;

/// Bound on the bias a [`PriorityAdjuster`](super::PriorityAdjuster) may apply.
pub const MAX_PRIORITY_BIAS: i32 = 64;

/// Default upper-channel submit queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

// =============================================================================
// TRAINING DEFAULTS
// =============================================================================

/// Default handshake timeout for SBINIT, MBINIT and LINKINIT states.
pub const DEFAULT_STATE_TIMEOUT: Cycle = 1000;

/// Default timeout for each MBTRAIN / RETRAIN sub-phase.
pub const DEFAULT_TRAIN_TIMEOUT: Cycle = 4000;
