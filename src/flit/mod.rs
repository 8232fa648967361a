//! Flit layer: wire format, CRC engine, sequence numbers, control flits.
//!
//! Everything here is pure and stateless per call.

mod codec;
mod control;
pub mod crc;
mod sequence;

pub use codec::*;
pub use control::*;
pub use sequence::*;
