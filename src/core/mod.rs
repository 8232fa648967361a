//! Core constants, configuration, error types, and extension traits.
//!
//! This module has no I/O beyond config file loading and is shared by every
//! other layer.

mod config;
mod constants;
mod error;
mod traits;

pub use config::*;
pub use constants::*;
pub use error::*;
pub use traits::*;
