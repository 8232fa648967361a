//! Link state management and the top-level per-link controller.

mod controller;
mod state;
mod status;

pub use controller::*;
pub use state::*;
pub use status::*;
