//! Link-level reliability: transmit-side retry buffer and receive-side
//! reorder window.

mod buffer;
mod reorder;

pub use buffer::*;
pub use reorder::*;
