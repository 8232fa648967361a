//! Flit encoding and decoding.
//!
//! Wire format (`4 + payload_size + 4` bytes, 40 with the default 256-bit
//! payload):
//!
//! ```text
//! +----------+-----------+----------+--------+-------------------+-----------+
//! | Protocol | Sess | VC | Sequence | Type   | Payload           | CRC-32    |
//! | 1 byte   | 4b   | 4b | 1 byte   | 1 byte | payload_size bytes| 4 (LE32)  |
//! +----------+-----------+----------+--------+-------------------+-----------+
//! ```
//!
//! The CRC covers header and payload. The session nibble counts link
//! retrains modulo 16 so that flits still in flight from before a retrain can
//! be told apart from the restarted sequence space. The codec is stateless
//! apart from the payload width and can be shared between threads.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::crc::{self, Crc32};
use super::sequence::SequenceNumber;
use crate::core::{
    CodecError, DEFAULT_PAYLOAD_SIZE, FLIT_CRC_SIZE, FLIT_HEADER_SIZE, MAX_PAYLOAD_SIZE,
    MAX_VIRTUAL_CHANNELS, MIN_PAYLOAD_SIZE, SESSION_MODULUS,
};

/// Logical protocol carried in a flit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProtocolId {
    /// PCIe-style streaming I/O.
    Pcie = 0x00,
    /// CXL.io.
    CxlIo = 0x01,
    /// CXL.cache / CXL.mem coherency traffic.
    CxlCacheMem = 0x02,
    /// Raw streaming protocol.
    Streaming = 0x03,
    /// Link management; also used for link-layer control flits.
    Management = 0x04,
}

impl ProtocolId {
    /// Parse a protocol id from its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Pcie),
            0x01 => Some(Self::CxlIo),
            0x02 => Some(Self::CxlCacheMem),
            0x03 => Some(Self::Streaming),
            0x04 => Some(Self::Management),
            _ => None,
        }
    }

    /// Wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pcie => "pcie",
            Self::CxlIo => "cxl.io",
            Self::CxlCacheMem => "cxl.cachemem",
            Self::Streaming => "streaming",
            Self::Management => "management",
        };
        f.write_str(name)
    }
}

/// Position of a flit within a message, or a link-layer control flit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FlitType {
    /// First flit of a multi-flit message.
    Header = 0x00,
    /// Middle flit of a multi-flit message.
    Data = 0x01,
    /// Last flit of a multi-flit message.
    Tail = 0x02,
    /// Complete single-flit message.
    Single = 0x03,
    /// Link-layer control (ACK, NAK, credit return). Never retried.
    Control = 0x04,
}

impl FlitType {
    /// Parse a flit type from its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Header),
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Tail),
            0x03 => Some(Self::Single),
            0x04 => Some(Self::Control),
            _ => None,
        }
    }

    /// Wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether this flit carries upper-layer data.
    pub fn is_data(self) -> bool {
        !matches!(self, Self::Control)
    }
}

/// Flit header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlitHeader {
    /// Logical protocol.
    pub protocol: ProtocolId,
    /// Virtual channel within the protocol (0-15).
    pub virtual_channel: u8,
    /// Link sequence number, assigned by the retry buffer.
    pub sequence: SequenceNumber,
    /// Flit type.
    pub flit_type: FlitType,
    /// Link session (0-15) the flit was sent in.
    pub session: u8,
}

impl FlitHeader {
    /// Create a data header; the sequence number is assigned on submit.
    pub fn new(protocol: ProtocolId, virtual_channel: u8, flit_type: FlitType) -> Self {
        Self {
            protocol,
            virtual_channel,
            sequence: SequenceNumber::ZERO,
            flit_type,
            session: 0,
        }
    }

    /// Same header, stamped with `session` (reduced modulo 16).
    pub fn with_session(mut self, session: u8) -> Self {
        self.session = session % SESSION_MODULUS;
        self
    }

    /// Serialize to the 4-byte wire header.
    pub fn to_bytes(&self) -> Result<[u8; FLIT_HEADER_SIZE], CodecError> {
        if self.virtual_channel >= MAX_VIRTUAL_CHANNELS {
            return Err(CodecError::InvalidVirtualChannel(self.virtual_channel));
        }
        Ok([
            self.protocol.as_byte(),
            ((self.session % SESSION_MODULUS) << 4) | (self.virtual_channel & 0x0F),
            self.sequence.value(),
            self.flit_type.as_byte(),
        ])
    }

    /// Parse the 4-byte wire header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < FLIT_HEADER_SIZE {
            return Err(CodecError::Malformed {
                expected: FLIT_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let protocol = ProtocolId::from_byte(bytes[0]).ok_or(CodecError::UnknownProtocol(bytes[0]))?;
        let flit_type = FlitType::from_byte(bytes[3]).ok_or(CodecError::UnknownType(bytes[3]))?;

        Ok(Self {
            protocol,
            virtual_channel: bytes[1] & 0x0F,
            sequence: SequenceNumber::new(bytes[2]),
            flit_type,
            session: bytes[1] >> 4,
        })
    }
}

/// A complete flit: header, fixed-width payload, and CRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flit {
    /// Header fields.
    pub header: FlitHeader,
    /// Payload, exactly `payload_size` bytes.
    pub payload: Vec<u8>,
    /// CRC-32 over header and payload.
    pub crc: u32,
}

impl Flit {
    /// Recompute the CRC over header and payload.
    pub fn compute_crc(&self) -> Result<u32, CodecError> {
        Ok(Crc32::new()
            .update(&self.header.to_bytes()?)
            .update(&self.payload)
            .finalize())
    }

    /// Whether the stored CRC matches the header and payload.
    pub fn crc_is_valid(&self) -> bool {
        self.compute_crc().is_ok_and(|crc| crc == self.crc)
    }

    /// Serialize to wire bytes, carrying the stored CRC unchanged.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(FLIT_HEADER_SIZE + self.payload.len() + FLIT_CRC_SIZE);
        buf.extend_from_slice(&self.header.to_bytes()?);
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.crc.to_le_bytes());
        Ok(buf)
    }
}

/// Fixed-width flit codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlitCodec {
    payload_size: usize,
}

impl Default for FlitCodec {
    fn default() -> Self {
        Self {
            payload_size: DEFAULT_PAYLOAD_SIZE,
        }
    }
}

impl FlitCodec {
    /// Create a codec for the given payload width.
    ///
    /// Widths below four bytes cannot carry a control flit and widths above
    /// 255 bytes are beyond the wire format; both are rejected.
    pub fn new(payload_size: usize) -> Result<Self, CodecError> {
        if !(MIN_PAYLOAD_SIZE..=MAX_PAYLOAD_SIZE).contains(&payload_size) {
            return Err(CodecError::InvalidPayloadSize {
                size: payload_size,
                min: MIN_PAYLOAD_SIZE,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self { payload_size })
    }

    /// Payload width in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Total flit size on the wire.
    pub fn flit_size(&self) -> usize {
        FLIT_HEADER_SIZE + self.payload_size + FLIT_CRC_SIZE
    }

    /// Build a flit with a zero-padded payload and a fresh CRC.
    pub fn seal(&self, header: FlitHeader, payload: &[u8]) -> Result<Flit, CodecError> {
        if payload.len() > self.payload_size {
            return Err(CodecError::PayloadTooLarge {
                len: payload.len(),
                max: self.payload_size,
            });
        }

        let mut padded = vec![0u8; self.payload_size];
        padded[..payload.len()].copy_from_slice(payload);

        let mut flit = Flit {
            header,
            payload: padded,
            crc: 0,
        };
        flit.crc = flit.compute_crc()?;
        Ok(flit)
    }

    /// Encode header fields and payload to wire bytes.
    pub fn encode(&self, header: FlitHeader, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.seal(header, payload)?.to_bytes()
    }

    /// Decode wire bytes. The CRC is extracted but not checked; use
    /// [`FlitCodec::verify`] or [`Flit::crc_is_valid`] for that.
    pub fn decode(&self, bytes: &[u8]) -> Result<Flit, CodecError> {
        let expected = self.flit_size();
        if bytes.len() != expected {
            return Err(CodecError::Malformed {
                expected,
                actual: bytes.len(),
            });
        }

        let header = FlitHeader::from_bytes(&bytes[..FLIT_HEADER_SIZE])?;
        let payload_end = FLIT_HEADER_SIZE + self.payload_size;
        let payload = bytes[FLIT_HEADER_SIZE..payload_end].to_vec();
        let crc = u32::from_le_bytes([
            bytes[payload_end],
            bytes[payload_end + 1],
            bytes[payload_end + 2],
            bytes[payload_end + 3],
        ]);

        Ok(Flit {
            header,
            payload,
            crc,
        })
    }

    /// Check length and CRC of raw wire bytes without decoding fields.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        bytes.len() == self.flit_size() && crc::verify(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u8) -> FlitHeader {
        FlitHeader {
            protocol: ProtocolId::CxlCacheMem,
            virtual_channel: 3,
            sequence: SequenceNumber::new(seq),
            flit_type: FlitType::Single,
            session: 0,
        }
    }

    #[test]
    fn test_encode_layout() {
        let codec = FlitCodec::new(4).unwrap();
        let bytes = codec.encode(header(0x2A), &[0xDE, 0xAD]).unwrap();

        assert_eq!(bytes.len(), 12);
        assert_eq!(hex::encode(&bytes[..8]), "02032a03dead0000");
        assert!(crc::verify(&bytes));
    }

    #[test]
    fn test_decode_roundtrip() {
        let codec = FlitCodec::default();
        let payload: Vec<u8> = (0..32).collect();
        let bytes = codec.encode(header(200), &payload).unwrap();

        let flit = codec.decode(&bytes).unwrap();
        assert_eq!(flit.header, header(200));
        assert_eq!(flit.payload, payload);
        assert!(flit.crc_is_valid());
        assert_eq!(flit.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_decode_wrong_length() {
        let codec = FlitCodec::default();
        let err = codec.decode(&[0u8; 39]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Malformed {
                expected: 40,
                actual: 39
            }
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        let codec = FlitCodec::new(4).unwrap();
        let mut bytes = codec.encode(header(1), &[]).unwrap();
        bytes[3] = 0x07;
        assert_eq!(codec.decode(&bytes).unwrap_err(), CodecError::UnknownType(0x07));
    }

    #[test]
    fn test_decode_unknown_protocol() {
        let codec = FlitCodec::new(4).unwrap();
        let mut bytes = codec.encode(header(1), &[]).unwrap();
        bytes[0] = 0x10;
        assert_eq!(codec.decode(&bytes).unwrap_err(), CodecError::UnknownProtocol(0x10));
    }

    #[test]
    fn test_session_shares_byte_with_vc() {
        let codec = FlitCodec::new(4).unwrap();
        let bytes = codec.encode(header(1).with_session(0xA), &[]).unwrap();
        assert_eq!(bytes[1], 0xA3);

        let decoded = codec.decode(&bytes).unwrap().header;
        assert_eq!(decoded.virtual_channel, 3);
        assert_eq!(decoded.session, 0xA);
        assert_eq!(header(1).with_session(17).session, 1);
    }

    #[test]
    fn test_payload_width_rejected_outside_wire_limits() {
        for size in [0, 3, 256, 1024] {
            assert_eq!(
                FlitCodec::new(size).unwrap_err(),
                CodecError::InvalidPayloadSize {
                    size,
                    min: MIN_PAYLOAD_SIZE,
                    max: MAX_PAYLOAD_SIZE,
                }
            );
        }
        assert_eq!(FlitCodec::new(MAX_PAYLOAD_SIZE).unwrap().payload_size(), 255);
        assert_eq!(FlitCodec::default().flit_size(), 40);
    }

    #[test]
    fn test_payload_too_large() {
        let codec = FlitCodec::new(4).unwrap();
        assert_eq!(
            codec.encode(header(0), &[0u8; 5]).unwrap_err(),
            CodecError::PayloadTooLarge { len: 5, max: 4 }
        );
    }

    #[test]
    fn test_invalid_virtual_channel() {
        let codec = FlitCodec::new(4).unwrap();
        let mut h = header(0);
        h.virtual_channel = 16;
        assert_eq!(
            codec.encode(h, &[]).unwrap_err(),
            CodecError::InvalidVirtualChannel(16)
        );
    }

    #[test]
    fn test_verify_detects_corruption() {
        let codec = FlitCodec::default();
        let mut bytes = codec.encode(header(9), b"payload").unwrap();
        assert!(codec.verify(&bytes));

        bytes[10] ^= 0x01;
        assert!(!codec.verify(&bytes));
        assert!(!codec.decode(&bytes).unwrap().crc_is_valid());
    }

    #[test]
    fn test_protocol_byte_roundtrip() {
        for p in [
            ProtocolId::Pcie,
            ProtocolId::CxlIo,
            ProtocolId::CxlCacheMem,
            ProtocolId::Streaming,
            ProtocolId::Management,
        ] {
            assert_eq!(ProtocolId::from_byte(p.as_byte()), Some(p));
        }
        assert_eq!(ProtocolId::from_byte(5), None);
    }
}
