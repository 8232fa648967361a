//! Link-layer control flits.
//!
//! Control flits are CRC-protected like data flits but carry no sequence
//! number and are never stored for retry. A lost ACK is covered by the next
//! cumulative ACK, a lost NAK by the sender's retry timeout, and a lost credit
//! return by the arbiter's emergency credit grant.
//!
//! Payload layout (first four bytes, rest zero):
//!
//! ```text
//! ACK / NAK:       [kind, sequence, 0, 0]
//! CREDIT_RETURN:   [kind, protocol, vc, count]
//! ```

use super::codec::{Flit, FlitCodec, FlitHeader, FlitType, ProtocolId};
use super::sequence::SequenceNumber;
use crate::core::{CONTROL_ACK, CONTROL_CREDIT_RETURN, CONTROL_NAK, CodecError};

/// A decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlit {
    /// Cumulative acknowledgment up to and including the sequence number.
    Ack(SequenceNumber),
    /// Request to retransmit one sequence number.
    Nak(SequenceNumber),
    /// Receiver freed `count` buffers on (protocol, vc).
    CreditReturn {
        /// Protocol of the freed buffers.
        protocol: ProtocolId,
        /// Virtual channel of the freed buffers.
        virtual_channel: u8,
        /// Number of credits returned.
        count: u8,
    },
}

impl ControlFlit {
    /// Encode as a 4-byte control payload.
    pub fn to_payload(&self) -> [u8; 4] {
        match *self {
            Self::Ack(seq) => [CONTROL_ACK, seq.value(), 0, 0],
            Self::Nak(seq) => [CONTROL_NAK, seq.value(), 0, 0],
            Self::CreditReturn {
                protocol,
                virtual_channel,
                count,
            } => [CONTROL_CREDIT_RETURN, protocol.as_byte(), virtual_channel, count],
        }
    }

    /// Decode a control payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, CodecError> {
        if payload.len() < 4 {
            return Err(CodecError::Malformed {
                expected: 4,
                actual: payload.len(),
            });
        }

        match payload[0] {
            CONTROL_ACK => Ok(Self::Ack(SequenceNumber::new(payload[1]))),
            CONTROL_NAK => Ok(Self::Nak(SequenceNumber::new(payload[1]))),
            CONTROL_CREDIT_RETURN => {
                let protocol =
                    ProtocolId::from_byte(payload[1]).ok_or(CodecError::UnknownProtocol(payload[1]))?;
                Ok(Self::CreditReturn {
                    protocol,
                    virtual_channel: payload[2],
                    count: payload[3],
                })
            }
            other => Err(CodecError::UnknownControl(other)),
        }
    }

    /// Build the sealed control flit for link session `session`.
    pub fn to_flit(&self, codec: &FlitCodec, session: u8) -> Result<Flit, CodecError> {
        let header =
            FlitHeader::new(ProtocolId::Management, 0, FlitType::Control).with_session(session);
        codec.seal(header, &self.to_payload())
    }

    /// Encode straight to wire bytes.
    pub fn encode(&self, codec: &FlitCodec, session: u8) -> Result<Vec<u8>, CodecError> {
        self.to_flit(codec, session)?.to_bytes()
    }

    /// Extract the control message from a decoded control flit.
    pub fn from_flit(flit: &Flit) -> Result<Self, CodecError> {
        if flit.header.flit_type != FlitType::Control {
            return Err(CodecError::UnknownControl(flit.header.flit_type.as_byte()));
        }
        Self::from_payload(&flit.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_wire_bytes() {
        let codec = FlitCodec::new(4).unwrap();
        let bytes = ControlFlit::Nak(SequenceNumber::new(3)).encode(&codec, 0).unwrap();
        assert_eq!(hex::encode(&bytes[..8]), "0400000402030000");
        assert!(codec.verify(&bytes));

        let bytes = ControlFlit::Ack(SequenceNumber::new(7)).encode(&codec, 5).unwrap();
        assert_eq!(hex::encode(&bytes[..8]), "0450000401070000");
    }

    #[test]
    fn test_control_through_codec() {
        let codec = FlitCodec::default();
        let msg = ControlFlit::CreditReturn {
            protocol: ProtocolId::CxlIo,
            virtual_channel: 2,
            count: 5,
        };
        let flit = codec.decode(&msg.encode(&codec, 3).unwrap()).unwrap();
        assert_eq!(flit.header.flit_type, FlitType::Control);
        assert_eq!(ControlFlit::from_flit(&flit).unwrap(), msg);
    }

    #[test]
    fn test_unknown_control_kind() {
        assert_eq!(
            ControlFlit::from_payload(&[0x7F, 0, 0, 0]).unwrap_err(),
            CodecError::UnknownControl(0x7F)
        );
    }

    #[test]
    fn test_data_flit_is_not_control() {
        let codec = FlitCodec::new(4).unwrap();
        let flit = codec
            .seal(FlitHeader::new(ProtocolId::Pcie, 0, FlitType::Single), &[CONTROL_ACK, 1])
            .unwrap();
        assert!(ControlFlit::from_flit(&flit).is_err());
    }
}
