//! Two link controllers joined by a pair of lossy wires.

use tracing::debug;

use super::partner::SidebandPartner;
use super::wire::LossyWire;
use crate::core::{Cycle, LinkConfig, LinkResult};
use crate::link::{LinkController, LinkState, SidebandMessage, SidebandRequest};

/// Which end of the loopback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Near die.
    A,
    /// Far die.
    B,
}

/// Back-to-back link harness. Each die has its own sideband partner. Low-power
/// entry requests, wakes and retrains are relayed to the other die.
#[derive(Debug)]
pub struct Loopback {
    /// Near controller.
    pub a: LinkController,
    /// Far controller.
    pub b: LinkController,
    /// A to B wire.
    pub wire_ab: LossyWire,
    /// B to A wire.
    pub wire_ba: LossyWire,
    /// Sideband partner of A.
    pub partner_a: SidebandPartner,
    /// Sideband partner of B.
    pub partner_b: SidebandPartner,
    now: Cycle,
}

impl Loopback {
    /// Build both ends from the same configuration over perfect wires.
    pub fn new(config: LinkConfig) -> LinkResult<Self> {
        Self::with_wires(config, LossyWire::perfect(), LossyWire::perfect())
    }

    /// Build both ends over the given wires.
    pub fn with_wires(config: LinkConfig, wire_ab: LossyWire, wire_ba: LossyWire) -> LinkResult<Self> {
        Ok(Self {
            a: LinkController::new(config.clone())?,
            b: LinkController::new(config)?,
            wire_ab,
            wire_ba,
            partner_a: SidebandPartner::default(),
            partner_b: SidebandPartner::default(),
            now: 0,
        })
    }

    /// Current harness cycle.
    pub fn cycle(&self) -> Cycle {
        self.now
    }

    /// Controller on `side`.
    pub fn side(&mut self, side: Side) -> &mut LinkController {
        match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        }
    }

    /// Advance both dies by one cycle.
    pub fn step(&mut self) {
        self.now += 1;
        let now = self.now;

        for bytes in self.wire_ab.deliver(now) {
            self.b.push_received(bytes);
        }
        for bytes in self.wire_ba.deliver(now) {
            self.a.push_received(bytes);
        }

        self.a.tick();
        self.b.tick();

        while let Some(bytes) = self.a.poll_transmit() {
            self.wire_ab.send(bytes, now);
        }
        while let Some(bytes) = self.b.poll_transmit() {
            self.wire_ba.send(bytes, now);
        }

        let a_retrains = Self::sideband(&mut self.a, &mut self.partner_a, now);
        let b_retrains = Self::sideband(&mut self.b, &mut self.partner_b, now);

        // Both dies restart sequence numbering together
        if a_retrains && self.b.state().is_active() {
            self.b.signal_error();
        }
        if b_retrains && self.a.state().is_active() {
            self.a.signal_error();
        }

        let to_b: Vec<_> = std::iter::from_fn(|| self.partner_a.take_notification()).collect();
        let to_a: Vec<_> = std::iter::from_fn(|| self.partner_b.take_notification()).collect();
        Self::relay(&mut self.b, to_b);
        Self::relay(&mut self.a, to_a);
    }

    /// Exchange sideband traffic between a die and its partner. Returns
    /// whether the die asked to retrain.
    fn sideband(link: &mut LinkController, partner: &mut SidebandPartner, now: Cycle) -> bool {
        let mut retrain = false;
        while let Some(request) = link.poll_sideband() {
            retrain |= request == SidebandRequest::Retrain;
            partner.observe(request, now);
        }
        while let Some(msg) = partner.poll(now) {
            link.handle_sideband(msg);
        }
        retrain
    }

    fn relay(link: &mut LinkController, requests: Vec<SidebandRequest>) {
        for request in requests {
            let msg = match request {
                SidebandRequest::LowPowerEntryRequest(target) => {
                    SidebandMessage::LowPowerEntryRequest(target)
                }
                SidebandRequest::LowPowerExit => SidebandMessage::LowPowerExit,
                _ => continue,
            };
            debug!(?msg, "relaying sideband message to peer");
            link.handle_sideband(msg);
        }
    }

    /// Step until `done` holds or `max_cycles` elapse. Returns whether `done`
    /// held.
    pub fn run_until(&mut self, max_cycles: Cycle, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..max_cycles {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Step until both ends are ACTIVE.
    pub fn train(&mut self, max_cycles: Cycle) -> bool {
        self.run_until(max_cycles, |l| {
            l.a.state() == LinkState::Active && l.b.state() == LinkState::Active
        })
    }
}
