//! # d2d-link
//!
//! Die-to-die chiplet link controller.
//!
//! Two chiplets exchange fixed-size flits over a narrow, error-prone channel.
//! This crate implements the link-layer engine that makes that channel
//! usable:
//!
//! - **Link training**: a state machine from RESET through sideband and
//!   mainband initialization and training to ACTIVE, with low-power states,
//!   retrain on unrecoverable errors, and per-state handshake timeouts
//! - **Reliability**: CRC-32 on every flit, a sequence-numbered retry buffer
//!   with cumulative ACK, selective-repeat NAK and timeout retransmission,
//!   and an in-order reorder window on receive
//! - **Scheduling**: credit-based arbitration across logical protocols with
//!   aging, a hard starvation bound, and an emergency credit valve
//!
//! Each link is a single-threaded, tick-driven [`LinkController`]. The
//! physical layer and sideband collaborator talk to it only through queues.
//!
//! ## Feature Flags
//!
//! - `runtime` (default): run each link in its own tokio task
//! - `sim` (default): lossy wire model and scripted sideband partner
//!
//! ## Modules
//!
//! - [`core`]: constants, configuration, errors, extension traits
//! - [`flit`]: flit codec, CRC engine, sequence numbers, control flits
//! - [`retry`]: retry buffer and reorder window
//! - [`arbiter`]: credit counters and the arbiter
//! - [`link`]: link state machine and the per-link controller
//! - [`runtime`]: tokio task per link (requires `runtime` feature)
//! - [`sim`]: simulation collaborators (requires `sim` feature)
//!
//! ## Example
//!
//! ```rust
//! use d2d_link::prelude::*;
//!
//! let mut link = LinkController::new(LinkConfig::default())?;
//!
//! // Bring the link up against a partner that answers every handshake
//! link.tick();
//! while let Some(request) = link.poll_sideband() {
//!     if let Some(response) = request.expected_response() {
//!         link.handle_sideband(response);
//!     }
//! }
//! assert_eq!(link.state(), LinkState::Active);
//!
//! let pcie = link.channel(ProtocolId::Pcie, 0).unwrap();
//! link.submit(pcie, FlitType::Single, b"hello")?;
//! link.tick();
//!
//! let wire_bytes = link.poll_transmit().unwrap();
//! assert_eq!(wire_bytes.len(), link.config().flit_size());
//! # Ok::<(), d2d_link::core::LinkError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;

pub mod flit;

pub mod retry;

pub mod arbiter;

pub mod link;

// Async runtime (feature-gated)
#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub mod runtime;

// Simulation collaborators (feature-gated)
#[cfg(feature = "sim")]
#[cfg_attr(docsrs, doc(cfg(feature = "sim")))]
pub mod sim;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::flit::{
        ControlFlit, Flit, FlitCodec, FlitHeader, FlitType, ProtocolId, SequenceNumber,
    };

    pub use crate::retry::{AcceptedFlit, ReorderBuffer, RetryBuffer};

    pub use crate::arbiter::{Arbiter, ChannelId, CreditCounter};

    pub use crate::link::{
        ChannelStatus, ErrorCounters, LinkController, LinkEvent, LinkState, LinkStatus,
        LowPowerState, SidebandMessage, SidebandRequest,
    };

    #[cfg(feature = "runtime")]
    pub use crate::runtime::{LinkHandle, LinkOutput, spawn_link, spawn_link_with_capacity};

    #[cfg(feature = "sim")]
    pub use crate::sim::{LossyWire, Loopback, SidebandPartner};
}

// Re-export commonly used items at crate root
pub use crate::core::{LinkConfig, LinkError, LinkResult};
pub use crate::link::{LinkController, LinkEvent, LinkState};
