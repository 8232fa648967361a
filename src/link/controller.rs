//! Top-level per-link controller.
//!
//! Owns every piece of per-link state and composes the components into one
//! cycle:
//!
//! 1. link state machine timers
//! 2. arbitration (ACTIVE only, and only when the retry buffer has room)
//! 3. retry buffer timeout scan
//! 4. receive processing: CRC, ACK/NAK/credit control, in-order delivery
//! 5. ACK, NAK and credit-return generation
//!
//! The physical layer and sideband collaborator exchange data with the
//! controller only through its queues (`push_received` / `poll_transmit`,
//! `handle_sideband` / `poll_sideband`), which stand in for the clock-domain
//! crossings of the hardware.

use std::collections::VecDeque;

use tracing::{debug, error, trace, warn};

use super::state::{
    LinkState, LinkStateMachine, LowPowerState, SidebandMessage, SidebandRequest, Transition,
    TransitionCause,
};
use super::status::{ChannelStatus, ErrorCounters, LinkEvent, LinkStatus};
use crate::arbiter::{Arbiter, ChannelId};
use crate::core::{
    CodecError, Cycle, LinkConfig, LinkError, LinkResult, PriorityAdjuster, ReceiveError,
    RetryError, SESSION_MODULUS,
};
use crate::flit::{ControlFlit, Flit, FlitCodec, FlitHeader, FlitType, ProtocolId, SequenceNumber};
use crate::retry::{AcceptedFlit, ReorderBuffer, RetryBuffer};

/// A delivered flit waiting for the upper layer. `epoch` ties its credit to
/// the link incarnation that consumed it.
#[derive(Debug)]
struct Received {
    flit: Flit,
    epoch: u64,
}

/// Controller for one die-to-die link.
#[derive(Debug)]
pub struct LinkController {
    config: LinkConfig,
    codec: FlitCodec,
    machine: LinkStateMachine,
    arbiter: Arbiter,
    retry: RetryBuffer,
    rx: ReorderBuffer,

    /// Upper-layer submit queues, one per channel.
    tx_queues: Vec<VecDeque<Flit>>,
    /// Delivered flits, one queue per channel.
    rx_queues: Vec<VecDeque<Received>>,
    /// Credits freed by `recv` and not yet returned to the peer.
    pending_returns: Vec<u16>,

    wire_in: VecDeque<Vec<u8>>,
    control_out: VecDeque<Vec<u8>>,
    events: VecDeque<LinkEvent>,

    counters: ErrorCounters,
    /// Flits dropped by retry exhaustion, reported with the next discard.
    lost_pending: usize,
    epoch: u64,
    now: Cycle,
}

impl LinkController {
    /// Create a controller in RESET.
    pub fn new(config: LinkConfig) -> LinkResult<Self> {
        config.validate()?;

        let codec = FlitCodec::new(config.payload_size)?;
        let channels = config.channels.len();

        Ok(Self {
            codec,
            machine: LinkStateMachine::new(config.training),
            arbiter: Arbiter::new(config.arbiter, &config.channels),
            retry: RetryBuffer::new(codec, &config.retry),
            rx: ReorderBuffer::new(codec, &config.retry),
            tx_queues: (0..channels).map(|_| VecDeque::new()).collect(),
            rx_queues: (0..channels).map(|_| VecDeque::new()).collect(),
            pending_returns: vec![0; channels],
            wire_in: VecDeque::new(),
            control_out: VecDeque::new(),
            events: VecDeque::new(),
            counters: ErrorCounters::default(),
            lost_pending: 0,
            epoch: 0,
            now: 0,
            config,
        })
    }

    /// Create a controller whose arbiter consults `adjuster`.
    pub fn with_adjuster(
        config: LinkConfig,
        adjuster: Box<dyn PriorityAdjuster>,
    ) -> LinkResult<Self> {
        let mut controller = Self::new(config)?;
        controller.arbiter.set_adjuster(adjuster);
        Ok(controller)
    }

    /// Configuration in use.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Flit codec in use.
    pub fn codec(&self) -> FlitCodec {
        self.codec
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        self.machine.state()
    }

    /// Current cycle.
    pub fn cycle(&self) -> Cycle {
        self.now
    }

    /// Link session stamped on outgoing flits. Advances with every retrain,
    /// error or reset.
    pub fn session(&self) -> u8 {
        (self.epoch % SESSION_MODULUS as u64) as u8
    }

    /// Channel carrying (`protocol`, `virtual_channel`).
    pub fn channel(&self, protocol: ProtocolId, virtual_channel: u8) -> Option<ChannelId> {
        self.arbiter.channel_for(protocol, virtual_channel)
    }

    /// Queue a flit for transmission on `channel`.
    ///
    /// Only accepted while the link is ACTIVE and not draining toward a
    /// low-power state.
    pub fn submit(&mut self, channel: ChannelId, flit_type: FlitType, payload: &[u8]) -> LinkResult<()> {
        if !self.machine.is_accepting() {
            return Err(LinkError::NotActive {
                state: self.machine.state(),
            });
        }
        if !flit_type.is_data() {
            return Err(CodecError::UnknownType(flit_type.as_byte()).into());
        }

        let cfg = *self
            .config
            .channels
            .get(channel.index())
            .ok_or(LinkError::UnknownChannel(channel))?;
        if self.tx_queues[channel.index()].len() >= cfg.queue_depth {
            return Err(LinkError::ChannelFull { channel });
        }

        let header = FlitHeader::new(cfg.protocol, cfg.virtual_channel, flit_type);
        let flit = self.codec.seal(header, payload)?;
        self.tx_queues[channel.index()].push_back(flit);
        Ok(())
    }

    /// Hand bytes received from the physical layer to the controller. They
    /// are processed on the next tick.
    pub fn push_received(&mut self, bytes: Vec<u8>) {
        self.wire_in.push_back(bytes);
    }

    /// Next flit for the physical layer. Control flits go first.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.control_out
            .pop_front()
            .or_else(|| self.retry.poll_transmit())
    }

    /// Pull the next delivered flit on `channel`. Each pull frees one receive
    /// buffer and returns its credit to the peer.
    pub fn recv(&mut self, channel: ChannelId) -> LinkResult<Option<Flit>> {
        let idx = channel.index();
        let queue = self
            .rx_queues
            .get_mut(idx)
            .ok_or(LinkError::UnknownChannel(channel))?;

        let Some(received) = queue.pop_front() else {
            return Ok(None);
        };
        if received.epoch == self.epoch {
            self.pending_returns[idx] = self.pending_returns[idx].saturating_add(1);
        }
        Ok(Some(received.flit))
    }

    /// Number of delivered flits waiting on `channel`.
    pub fn pending(&self, channel: ChannelId) -> usize {
        self.rx_queues.get(channel.index()).map_or(0, VecDeque::len)
    }

    /// Apply a sideband primitive from the collaborator.
    pub fn handle_sideband(&mut self, msg: SidebandMessage) {
        if let Some(t) = self.machine.on_sideband(msg, self.now) {
            self.apply(t);
        }
    }

    /// Report a physical-layer error. Equivalent to an `ErrorAlert`.
    pub fn signal_error(&mut self) {
        self.handle_sideband(SidebandMessage::ErrorAlert);
    }

    /// Next sideband request for the collaborator.
    pub fn poll_sideband(&mut self) -> Option<SidebandRequest> {
        self.machine.poll_outbound()
    }

    /// Start draining toward a low-power state. The state is entered once
    /// every transmitted flit has been acknowledged.
    pub fn request_low_power(&mut self, target: LowPowerState) -> LinkResult<()> {
        self.machine.request_low_power(target)
    }

    /// Wake from a low-power state.
    pub fn exit_low_power(&mut self) -> LinkResult<()> {
        let t = self.machine.exit_low_power(self.now)?;
        self.apply(t);
        Ok(())
    }

    /// Next pending event.
    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// Advance one cycle.
    pub fn tick(&mut self) {
        self.now += 1;
        let now = self.now;

        if let Some(t) = self.machine.on_tick(now) {
            self.apply(t);
        }

        if self.machine.is_accepting() && self.retry.has_capacity() {
            self.arbitrate();
        }

        if self.machine.state().is_active() {
            if let Err(err) = self.retry.tick(now) {
                self.on_retry_error(err);
            }
        }

        while let Some(bytes) = self.wire_in.pop_front() {
            if !self.machine.state().receives() {
                trace!(state = %self.machine.state(), "flit dropped, receive path down");
                continue;
            }
            self.process_received(&bytes);
        }

        if self.machine.state().receives() {
            self.emit_control();
        }

        if let Some(crc_failures) = self.rx.take_quality_alarm() {
            self.counters.quality_alarms += 1;
            self.events.push_back(LinkEvent::LinkQualityAlarm { crc_failures });
        }

        if self.machine.draining().is_some() && self.retry.is_empty() && !self.retry.has_outbound() {
            if let Some(t) = self.machine.complete_low_power(now) {
                self.apply(t);
            }
        }
    }

    fn arbitrate(&mut self) {
        let ready: Vec<ChannelId> = self
            .tx_queues
            .iter()
            .enumerate()
            .filter(|(_, q)| !q.is_empty())
            .map(|(idx, _)| ChannelId(idx as u8))
            .collect();

        let selected = self.arbiter.select_next(&ready);
        for channel in self.arbiter.take_emergency_grants() {
            self.events.push_back(LinkEvent::EmergencyCreditGrant { channel });
        }

        match selected {
            Ok(Some(channel)) => {
                let Some(flit) = self.tx_queues[channel.index()].pop_front() else {
                    return;
                };
                if let Err(err) = self.retry.submit(flit, self.now) {
                    self.on_retry_error(err);
                }
            }
            Ok(None) => {}
            Err(violation) => {
                error!(%violation, "credit invariant breached");
                self.events.push_back(LinkEvent::CreditViolation(violation));
                let t = self.machine.fail(self.now);
                self.apply(t);
            }
        }
    }

    fn process_received(&mut self, bytes: &[u8]) {
        match self.rx.on_receive(bytes, self.now) {
            Ok(AcceptedFlit::Control(control)) => self.on_control(control),
            Ok(AcceptedFlit::Delivered(flits)) => {
                for flit in flits {
                    self.deliver(flit);
                }
            }
            Ok(AcceptedFlit::Buffered { missing, .. }) => self.nak(missing),
            Ok(AcceptedFlit::Duplicate { sequence }) => {
                trace!(%sequence, "duplicate flit dropped");
            }
            Err(ReceiveError::CrcFailure { expected }) => self.nak(expected),
            Err(ReceiveError::Codec(err)) => {
                debug!(%err, "undecodable flit dropped");
            }
            Err(err @ ReceiveError::OutsideWindow { .. }) => {
                debug!(%err, "flit dropped");
            }
            Err(err @ ReceiveError::StaleSession { .. }) => {
                trace!(%err, "flit dropped");
            }
        }
    }

    fn on_control(&mut self, control: ControlFlit) {
        match control {
            ControlFlit::Ack(sequence) => {
                self.retry.on_ack(sequence);
            }
            ControlFlit::Nak(sequence) => {
                if let Err(err) = self.retry.on_nak(sequence, self.now) {
                    self.on_retry_error(err);
                }
            }
            ControlFlit::CreditReturn {
                protocol,
                virtual_channel,
                count,
            } => match self
                .arbiter
                .on_credit_return(protocol, virtual_channel, count as u16)
            {
                Some(overflow) => self.counters.credit_overflows += overflow as u64,
                None => {
                    self.counters.misrouted += 1;
                    warn!(%protocol, vc = virtual_channel, "credit return for unknown channel");
                }
            },
        }
    }

    fn deliver(&mut self, flit: Flit) {
        let header = flit.header;
        let Some(channel) = self.arbiter.channel_for(header.protocol, header.virtual_channel) else {
            self.counters.misrouted += 1;
            warn!(protocol = %header.protocol, vc = header.virtual_channel, "flit for unknown channel");
            return;
        };

        // Only an emergency credit grant at the peer can push the queue past
        // the advertised credits. The flit is kept; the excess credit comes
        // back as an over-return.
        let advertised = self.config.channels[channel.index()].credits as usize;
        let queue = &mut self.rx_queues[channel.index()];
        if queue.len() >= advertised {
            self.counters.rx_overflows += 1;
            warn!(%channel, sequence = %header.sequence, "receive queue beyond advertised credits");
        }

        queue.push_back(Received {
            flit,
            epoch: self.epoch,
        });
    }

    fn nak(&mut self, sequence: SequenceNumber) {
        if self.rx.request_nak(sequence) {
            debug!(%sequence, "sending nak");
            self.send_control(ControlFlit::Nak(sequence));
        }
    }

    fn emit_control(&mut self) {
        if let Some(sequence) = self.rx.take_ack() {
            self.send_control(ControlFlit::Ack(sequence));
        }

        for idx in 0..self.pending_returns.len() {
            let mut count = std::mem::take(&mut self.pending_returns[idx]);
            let cfg = self.config.channels[idx];
            while count > 0 {
                let chunk = count.min(u8::MAX as u16);
                count -= chunk;
                self.send_control(ControlFlit::CreditReturn {
                    protocol: cfg.protocol,
                    virtual_channel: cfg.virtual_channel,
                    count: chunk as u8,
                });
            }
        }
    }

    fn send_control(&mut self, control: ControlFlit) {
        match control.encode(&self.codec, self.session()) {
            Ok(bytes) => self.control_out.push_back(bytes),
            Err(err) => error!(%err, ?control, "failed to encode control flit"),
        }
    }

    fn on_retry_error(&mut self, err: RetryError) {
        match err {
            RetryError::RetryExhausted { sequence, attempts } => {
                self.counters.retry_exhausted += 1;
                self.lost_pending += 1;
                self.events
                    .push_back(LinkEvent::RetryExhausted { sequence, attempts });
                let t = self.machine.retrain(TransitionCause::RetryExhausted, self.now);
                self.apply(t);
            }
            other => {
                self.counters.flits_lost += 1;
                error!(err = %other, "flit lost on submit to retry buffer");
            }
        }
    }

    /// Side effects of a state transition.
    fn apply(&mut self, t: Transition) {
        self.events.push_back(LinkEvent::StateChanged {
            from: t.from,
            to: t.to,
        });

        if t.cause == TransitionCause::Timeout {
            self.counters.state_timeouts += 1;
            self.events
                .push_back(LinkEvent::TrainingTimeout { state: t.from });
        }

        if t.to.is_active() {
            self.retry.resume();
        } else {
            self.retry.pause();
        }

        if matches!(t.to, LinkState::Retrain | LinkState::Error | LinkState::Reset) {
            self.discard_in_flight();
        }
    }

    /// Cancel everything in flight: retry entries, reorder window, credit
    /// and arbitration state. Submit queues are kept.
    fn discard_in_flight(&mut self) {
        let discarded = self.retry.reset() + std::mem::take(&mut self.lost_pending);
        let parked = self.rx.reset();
        self.arbiter.reset();
        self.control_out.clear();
        self.wire_in.clear();
        self.pending_returns.iter_mut().for_each(|c| *c = 0);
        self.epoch += 1;
        self.retry.set_session(self.session());

        if parked > 0 {
            debug!(parked, "out-of-order receive flits discarded");
        }
        if discarded > 0 {
            self.counters.flits_lost += discarded as u64;
            warn!(flits = discarded, "unacknowledged flits discarded");
            self.events.push_back(LinkEvent::DataLoss { flits: discarded });
        }
    }

    /// Status snapshot.
    pub fn status(&self) -> LinkStatus {
        let channels = self
            .config
            .channels
            .iter()
            .enumerate()
            .map(|(idx, cfg)| {
                let id = ChannelId(idx as u8);
                let (available, consumed) = self
                    .arbiter
                    .credit(id)
                    .map_or((0, 0), |c| (c.available(), c.consumed()));
                ChannelStatus {
                    channel: id,
                    protocol: cfg.protocol,
                    virtual_channel: cfg.virtual_channel,
                    available,
                    consumed,
                    grants: self.arbiter.grants(id),
                    queued: self.tx_queues[idx].len(),
                    received: self.rx_queues[idx].len(),
                }
            })
            .collect();

        let rx = self.rx.stats();
        let arbiter = self.arbiter.stats();
        let counters = ErrorCounters {
            crc_failures: rx.crc_failures,
            codec_errors: rx.codec_errors,
            out_of_window: rx.outside_window,
            stale_session: rx.stale_session,
            retransmissions: self.retry.stats().retransmissions,
            starvation_events: arbiter.starvation_events,
            emergency_grants: arbiter.emergency_grants,
            ..self.counters
        };

        LinkStatus {
            state: self.machine.state(),
            cycle: self.now,
            retry_occupancy: self.retry.len(),
            draining: self.machine.draining().is_some(),
            channels,
            counters,
        }
    }
}
