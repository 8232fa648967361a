//! Simulation collaborators: a lossy physical wire, a scripted sideband
//! partner, and a back-to-back harness built from them.

mod loopback;
mod partner;
mod wire;

pub use loopback::*;
pub use partner::*;
pub use wire::*;
