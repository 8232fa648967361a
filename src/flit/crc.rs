//! CRC-32 engine.
//!
//! Reflected CRC-32 with the Ethernet polynomial (`0x04C11DB7`, reflected
//! `0xEDB88320`), initial value `0xFFFFFFFF`, final XOR `0xFFFFFFFF`. The CRC
//! is appended to the flit little-endian, so the check value of
//! `"123456789"` is `0xCBF43926` and every implementation of the link must
//! produce the same bytes.

use std::fmt;

/// Incremental CRC-32 state, for computing over non-contiguous slices.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl fmt::Debug for Crc32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crc32").finish_non_exhaustive()
    }
}

impl Crc32 {
    /// Start a new computation.
    pub fn new() -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
        }
    }

    /// Feed bytes.
    pub fn update(mut self, bytes: &[u8]) -> Self {
        self.hasher.update(bytes);
        self
    }

    /// Finish and return the CRC.
    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

/// Compute the CRC-32 of `bytes`.
pub fn compute(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Verify a buffer whose last four bytes are the little-endian CRC of the
/// preceding bytes.
pub fn verify(bytes_with_trailing_crc: &[u8]) -> bool {
    let Some(split) = bytes_with_trailing_crc.len().checked_sub(4) else {
        return false;
    };
    let (body, trailer) = bytes_with_trailing_crc.split_at(split);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    compute(body) == expected
}

/// Append the CRC of `bytes` to it.
pub fn append(bytes: &mut Vec<u8>) {
    let crc = compute(bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
}
