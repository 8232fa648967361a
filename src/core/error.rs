//! Error types for the link controller.

use thiserror::Error;

use crate::arbiter::ChannelId;
use crate::flit::SequenceNumber;
use crate::link::LinkState;

/// Errors produced while decoding a flit.
///
/// A flit that fails to decode is rejected locally and never forwarded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Byte length does not match the fixed flit size.
    #[error("malformed flit: expected {expected} bytes, got {actual}")]
    Malformed {
        /// Expected flit size.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// Flit type field is outside the enumerated set.
    #[error("unknown flit type: {0:#04x}")]
    UnknownType(u8),

    /// Protocol id field is outside the enumerated set.
    #[error("unknown protocol id: {0:#04x}")]
    UnknownProtocol(u8),

    /// Virtual channel does not fit the 4-bit field.
    #[error("virtual channel {0} out of range")]
    InvalidVirtualChannel(u8),

    /// Payload longer than the configured payload width.
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Offered payload length.
        len: usize,
        /// Configured payload width.
        max: usize,
    },

    /// Payload width outside the range the wire format supports.
    #[error("payload size {size} outside {min}..={max}")]
    InvalidPayloadSize {
        /// Requested width.
        size: usize,
        /// Smallest supported width.
        min: usize,
        /// Largest supported width.
        max: usize,
    },

    /// Control flit kind byte is not recognized.
    #[error("unknown control kind: {0:#04x}")]
    UnknownControl(u8),
}

/// Errors from the transmit-side retry buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Buffer reached its configured depth. Transient; retry later.
    #[error("retry buffer full ({depth} entries)")]
    BufferFull {
        /// Configured depth.
        depth: usize,
    },

    /// A flit exceeded the maximum retransmission count and was dropped.
    /// This is a data-loss boundary and forces a retrain.
    #[error("retry exhausted for sequence {sequence} after {attempts} retransmissions")]
    RetryExhausted {
        /// Sequence number of the dropped flit.
        sequence: SequenceNumber,
        /// Retransmissions performed.
        attempts: u32,
    },

    /// Buffer is not accepting new transmissions (link not active).
    #[error("retry buffer paused")]
    Paused,

    /// The flit could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors from the receive path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    /// CRC mismatch. The caller NAKs `expected`, since the sequence field of
    /// a corrupted flit cannot be trusted.
    #[error("crc failure (expected sequence {expected})")]
    CrcFailure {
        /// Next in-order sequence number the receiver is waiting for.
        expected: SequenceNumber,
    },

    /// Flit passed CRC but could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Flit stamped with a link session that has already ended.
    #[error("stale flit from session {session} (current {current})")]
    StaleSession {
        /// Session carried by the flit.
        session: u8,
        /// Session the receiver is in.
        current: u8,
    },

    /// Sequence number lies outside the reorder window.
    #[error("sequence {sequence} outside receive window (expected {expected})")]
    OutsideWindow {
        /// Received sequence number.
        sequence: SequenceNumber,
        /// Next in-order sequence number.
        expected: SequenceNumber,
    },
}

/// Credit accounting invariant breaches.
///
/// These indicate a scheduling bug and are always fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CreditViolation {
    /// Attempt to consume a credit that is not available.
    #[error("credit underflow on channel {channel}")]
    Underflow {
        /// Offending channel.
        channel: ChannelId,
    },

    /// Channel id not known to the arbiter.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// TOML parse failure.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level link errors.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Flit codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Retry buffer error.
    #[error("retry error: {0}")]
    Retry(#[from] RetryError),

    /// Receive path error.
    #[error("receive error: {0}")]
    Receive(#[from] ReceiveError),

    /// Credit invariant breach.
    #[error("credit violation: {0}")]
    Credit(#[from] CreditViolation),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Operation requires the link to be ACTIVE.
    #[error("link not active (state {state})")]
    NotActive {
        /// Current link state.
        state: LinkState,
    },

    /// Upper-channel submit queue is full.
    #[error("channel {channel} queue full")]
    ChannelFull {
        /// Channel whose queue is full.
        channel: ChannelId,
    },

    /// Channel id not configured on this link.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// Training handshake not observed before the state timeout.
    #[error("state timeout in {state}")]
    StateTimeout {
        /// State that timed out.
        state: LinkState,
    },

    /// Link task has shut down.
    #[error("link task closed")]
    Closed,
}

impl LinkError {
    /// Check if the caller can recover by retrying later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::Retry(RetryError::BufferFull { .. })
                | LinkError::Retry(RetryError::Paused)
                | LinkError::Receive(ReceiveError::CrcFailure { .. })
                | LinkError::ChannelFull { .. }
                | LinkError::NotActive { .. }
        )
    }

    /// Check if this error forces a retrain, error state, or shutdown.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::Retry(RetryError::RetryExhausted { .. })
                | LinkError::Credit(_)
                | LinkError::StateTimeout { .. }
                | LinkError::Closed
        )
    }
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(LinkError::Retry(RetryError::BufferFull { depth: 4 }).is_recoverable());
        assert!(LinkError::ChannelFull { channel: ChannelId(0) }.is_recoverable());
        assert!(
            LinkError::Receive(ReceiveError::CrcFailure {
                expected: SequenceNumber::new(3)
            })
            .is_recoverable()
        );

        assert!(!LinkError::Credit(CreditViolation::UnknownChannel(ChannelId(9))).is_recoverable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(
            LinkError::Retry(RetryError::RetryExhausted {
                sequence: SequenceNumber::new(7),
                attempts: 4,
            })
            .is_fatal()
        );
        assert!(
            LinkError::Credit(CreditViolation::Underflow {
                channel: ChannelId(1)
            })
            .is_fatal()
        );
        assert!(LinkError::StateTimeout { state: LinkState::SbInit }.is_fatal());

        assert!(!LinkError::Retry(RetryError::BufferFull { depth: 4 }).is_fatal());
        assert!(!LinkError::Codec(CodecError::UnknownType(9)).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = CodecError::Malformed {
            expected: 40,
            actual: 12,
        };
        assert_eq!(err.to_string(), "malformed flit: expected 40 bytes, got 12");

        let err = LinkError::from(RetryError::BufferFull { depth: 32 });
        assert_eq!(err.to_string(), "retry error: retry buffer full (32 entries)");
    }
}
