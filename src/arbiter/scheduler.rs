//! Credit-based weighted arbitration with aging.
//!
//! Called once per transmit opportunity. Each ready channel that holds a
//! credit competes with
//!
//! ```text
//! effective = weight + clamp(adjuster bias) + waited * aging_step
//! ```
//!
//! and is forced to the maximum priority once `waited` reaches the starvation
//! threshold. Ties go to the first channel after the last one served. A
//! ready channel that has been without credit for longer than the threshold
//! receives one emergency credit.

use std::fmt;

use tracing::{error, trace, warn};

use super::credit::CreditCounter;
use crate::core::{
    ArbiterConfig, ChannelConfig, CreditViolation, Cycle, MAX_PRIORITY_BIAS, NoAdjustment,
    PriorityAdjuster,
};
use crate::flit::ProtocolId;

/// Index of a logical channel, in configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// Position in the channel table.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arbiter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    /// Transmit slots granted.
    pub grants: u64,
    /// Cycles with ready channels but nothing eligible.
    pub idle_cycles: u64,
    /// Grants made because a channel hit the starvation threshold.
    pub starvation_events: u64,
    /// Credits force-granted to break a credit deadlock.
    pub emergency_grants: u64,
}

#[derive(Debug)]
struct ChannelSlot {
    config: ChannelConfig,
    credit: CreditCounter,
    /// Cycles spent ready and credited without being served.
    waited: Cycle,
    /// Cycles spent ready without credit.
    credit_wait: Cycle,
    grants: u64,
}

/// Credit-based arbiter over a fixed channel table.
pub struct Arbiter {
    channels: Vec<ChannelSlot>,
    config: ArbiterConfig,
    last_served: Option<usize>,
    adjuster: Box<dyn PriorityAdjuster>,
    emergency: Vec<ChannelId>,
    stats: ArbiterStats,
}

impl fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arbiter")
            .field("channels", &self.channels)
            .field("config", &self.config)
            .field("last_served", &self.last_served)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Arbiter {
    /// Create an arbiter with no priority adjustment.
    pub fn new(config: ArbiterConfig, channels: &[ChannelConfig]) -> Self {
        Self::with_adjuster(config, channels, Box::new(NoAdjustment))
    }

    /// Create an arbiter that consults `adjuster` every selection.
    pub fn with_adjuster(
        config: ArbiterConfig,
        channels: &[ChannelConfig],
        adjuster: Box<dyn PriorityAdjuster>,
    ) -> Self {
        let channels = channels
            .iter()
            .map(|c| ChannelSlot {
                config: *c,
                credit: CreditCounter::new(c.credits),
                waited: 0,
                credit_wait: 0,
                grants: 0,
            })
            .collect();

        Self {
            channels,
            config,
            last_served: None,
            adjuster,
            emergency: Vec::new(),
            stats: ArbiterStats::default(),
        }
    }

    /// Replace the priority adjuster.
    pub fn set_adjuster(&mut self, adjuster: Box<dyn PriorityAdjuster>) {
        self.adjuster = adjuster;
    }

    /// Pick the channel to transmit next and consume one of its credits.
    ///
    /// `ready` lists channels with a pending flit. Returns `None` when no
    /// ready channel holds a credit.
    pub fn select_next(&mut self, ready: &[ChannelId]) -> Result<Option<ChannelId>, CreditViolation> {
        let mut is_ready = vec![false; self.channels.len()];
        for &id in ready {
            let Some(flag) = is_ready.get_mut(id.index()) else {
                return Err(CreditViolation::UnknownChannel(id));
            };
            *flag = true;
        }

        self.update_credit_waits(&is_ready);

        let n = self.channels.len();
        let mut best: Option<(u32, usize, usize)> = None;
        let mut forced = false;

        for (idx, slot) in self.channels.iter().enumerate() {
            if !is_ready[idx] || !slot.credit.has_credit() {
                continue;
            }

            let starving = slot.waited >= self.config.starvation_threshold;
            let priority = if starving {
                u32::MAX
            } else {
                let bias = self
                    .adjuster
                    .bias(ChannelId(idx as u8), slot.config.weight, slot.waited)
                    .clamp(-MAX_PRIORITY_BIAS, MAX_PRIORITY_BIAS);
                let aged = slot.waited.saturating_mul(self.config.aging_step as u64);
                let base = (slot.config.weight as i64 + bias as i64).max(0) as u64;
                base.saturating_add(aged).min(u32::MAX as u64 - 1) as u32
            };

            // Rotation distance after the last served channel breaks ties
            let rotation = match self.last_served {
                Some(last) => (idx + n - last - 1) % n,
                None => idx,
            };

            let better = match best {
                None => true,
                Some((p, r, _)) => priority > p || (priority == p && rotation < r),
            };
            if better {
                best = Some((priority, rotation, idx));
                forced = starving;
            }
        }

        let Some((_, _, winner)) = best else {
            if !ready.is_empty() {
                self.stats.idle_cycles += 1;
            }
            self.age(&is_ready, None);
            return Ok(None);
        };

        let id = ChannelId(winner as u8);
        if let Err(violation) = self.channels[winner].credit.consume(id) {
            error!(channel = %id, "credit underflow on selected channel");
            return Err(violation);
        }

        if forced {
            self.stats.starvation_events += 1;
            warn!(channel = %id, waited = self.channels[winner].waited, "starvation threshold reached");
        }

        self.age(&is_ready, Some(winner));
        let slot = &mut self.channels[winner];
        slot.grants += 1;
        self.stats.grants += 1;
        self.last_served = Some(winner);
        self.adjuster.on_grant(id);

        trace!(channel = %id, available = slot.credit.available(), "granted");
        Ok(Some(id))
    }

    /// Advance wait counters: unready channels reset, ready and credited
    /// losers age, the winner restarts at zero.
    fn age(&mut self, is_ready: &[bool], winner: Option<usize>) {
        for (idx, slot) in self.channels.iter_mut().enumerate() {
            if Some(idx) == winner || !is_ready[idx] {
                slot.waited = 0;
            } else if slot.credit.has_credit() {
                slot.waited += 1;
            }
        }
    }

    fn update_credit_waits(&mut self, is_ready: &[bool]) {
        let threshold = self.config.starvation_threshold;
        for (idx, slot) in self.channels.iter_mut().enumerate() {
            if !is_ready[idx] || slot.credit.has_credit() {
                slot.credit_wait = 0;
                continue;
            }

            slot.credit_wait += 1;
            if slot.credit_wait > threshold && slot.credit.nominal() > 0 && slot.credit.force_grant()
            {
                slot.credit_wait = 0;
                self.stats.emergency_grants += 1;
                self.emergency.push(ChannelId(idx as u8));
                warn!(
                    channel = idx,
                    protocol = %slot.config.protocol,
                    vc = slot.config.virtual_channel,
                    "emergency credit grant after credit starvation"
                );
            }
        }
    }

    /// Apply a credit return from the peer. Returns the number of credits
    /// beyond what was outstanding, or `None` if no channel carries
    /// (`protocol`, `virtual_channel`).
    pub fn on_credit_return(
        &mut self,
        protocol: ProtocolId,
        virtual_channel: u8,
        count: u16,
    ) -> Option<u16> {
        let id = self.channel_for(protocol, virtual_channel)?;
        let overflow = self.channels[id.index()].credit.restore(count);
        if overflow > 0 {
            warn!(channel = %id, overflow, "credit over-return clamped");
        }
        Some(overflow)
    }

    /// Look up the channel carrying (`protocol`, `virtual_channel`).
    pub fn channel_for(&self, protocol: ProtocolId, virtual_channel: u8) -> Option<ChannelId> {
        self.channels
            .iter()
            .position(|s| s.config.protocol == protocol && s.config.virtual_channel == virtual_channel)
            .map(|idx| ChannelId(idx as u8))
    }

    /// Channel configuration.
    pub fn channel_config(&self, id: ChannelId) -> Option<&ChannelConfig> {
        self.channels.get(id.index()).map(|s| &s.config)
    }

    /// Credit counter of a channel.
    pub fn credit(&self, id: ChannelId) -> Option<&CreditCounter> {
        self.channels.get(id.index()).map(|s| &s.credit)
    }

    /// Grants made to a channel.
    pub fn grants(&self, id: ChannelId) -> u64 {
        self.channels.get(id.index()).map_or(0, |s| s.grants)
    }

    /// Number of configured channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drain channels that received an emergency credit since the last call.
    pub fn take_emergency_grants(&mut self) -> Vec<ChannelId> {
        std::mem::take(&mut self.emergency)
    }

    /// Restore nominal credits and clear wait state.
    pub fn reset(&mut self) {
        for slot in &mut self.channels {
            slot.credit.reset();
            slot.waited = 0;
            slot.credit_wait = 0;
        }
        self.last_served = None;
        self.emergency.clear();
    }

    /// Counters.
    pub fn stats(&self) -> ArbiterStats {
        self.stats
    }
}
