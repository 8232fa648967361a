//! Extension points for the link controller.

use crate::arbiter::ChannelId;

use super::constants::Cycle;

/// Pluggable priority heuristic consulted by the arbiter.
///
/// The returned bias is clamped to `±MAX_PRIORITY_BIAS` and added to a
/// channel's base weight before aging and starvation forcing are applied.
/// Credit checks and the starvation bound therefore hold for any
/// implementation, including one that returns arbitrary values.
///
/// # Example
///
/// ```
/// use d2d_link::prelude::*;
///
/// /// Favor channel 0 slightly.
/// struct PreferFirst;
///
/// impl PriorityAdjuster for PreferFirst {
///     fn bias(&mut self, channel: ChannelId, _base_weight: u8, _waited: Cycle) -> i32 {
///         if channel == ChannelId(0) { 8 } else { 0 }
///     }
/// }
/// ```
pub trait PriorityAdjuster: Send {
    /// Bias for `channel` this cycle.
    fn bias(&mut self, channel: ChannelId, base_weight: u8, waited: Cycle) -> i32;

    /// Called after `channel` is granted a transmit slot.
    fn on_grant(&mut self, channel: ChannelId) {
        let _ = channel;
    }
}

/// Adjuster that leaves every priority unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdjustment;

impl PriorityAdjuster for NoAdjustment {
    fn bias(&mut self, _channel: ChannelId, _base_weight: u8, _waited: Cycle) -> i32 {
        0
    }
}

