//! Credit-based arbitration across logical channels.

mod credit;
mod scheduler;

pub use credit::*;
pub use scheduler::*;
