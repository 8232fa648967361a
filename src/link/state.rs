//! Link training and power state machine.
//!
//! ```text
//! RESET -> SBINIT -> MBINIT{PARAM,CAL,REPAIR} -> MBTRAIN{..} -> LINKINIT -> ACTIVE
//!                                                                 ^  |  ^ |
//!                                                                 |  v  | v
//!                                                            RETRAIN  L1/L2
//! any -> ERROR -> RESET (on reset acknowledgement)
//! ```
//!
//! Every training state waits for one sideband handshake and fails to
//! ERROR if it is not observed before the state's timeout. The machine only
//! decides transitions and queues outbound sideband requests; the controller
//! applies the side effects on the retry buffer and arbiter.

use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, error, info};

use crate::core::{Cycle, LinkError, TrainingConfig};

/// MBINIT sub-phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MbInitPhase {
    /// Mainband parameter exchange.
    Param,
    /// Calibration.
    Cal,
    /// Lane repair.
    Repair,
}

/// MBTRAIN sub-phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MbTrainPhase {
    /// Valid-lane reference voltage.
    ValVref,
    /// Data-lane reference voltage.
    DataVref,
    /// Data eye centering.
    DataTrainCenter,
    /// Final link speed check.
    LinkSpeed,
}

impl MbTrainPhase {
    /// First training phase.
    pub const FIRST: Self = Self::ValVref;

    /// The phase after this one, or `None` after the last.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::ValVref => Some(Self::DataVref),
            Self::DataVref => Some(Self::DataTrainCenter),
            Self::DataTrainCenter => Some(Self::LinkSpeed),
            Self::LinkSpeed => None,
        }
    }
}

/// Low-power targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LowPowerState {
    /// Light sleep.
    L1,
    /// Deep sleep.
    L2,
}

/// Link state. Exactly one is current at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    /// Power-on or post-error reset.
    #[default]
    Reset,
    /// Sideband initialization.
    SbInit,
    /// Mainband initialization.
    MbInit(MbInitPhase),
    /// Mainband training.
    MbTrain(MbTrainPhase),
    /// Link-layer initialization.
    LinkInit,
    /// Operational; the only state that carries data.
    Active,
    /// Low-power state L1.
    L1,
    /// Low-power state L2.
    L2,
    /// Recovery after retry exhaustion or a physical-layer error.
    Retrain,
    /// Failed; waits for an external reset acknowledgement.
    Error,
}

impl LinkState {
    /// Whether data may flow.
    pub fn is_active(self) -> bool {
        self == Self::Active
    }

    /// Whether the link is in a low-power state.
    pub fn is_low_power(self) -> bool {
        matches!(self, Self::L1 | Self::L2)
    }

    /// Whether the receive path is up. It stays up in L1/L2 so a peer that is
    /// still draining gets its acknowledgments.
    pub fn receives(self) -> bool {
        self.is_active() || self.is_low_power()
    }

    /// Whether the state is part of bring-up or recovery.
    pub fn is_training(self) -> bool {
        matches!(
            self,
            Self::SbInit | Self::MbInit(_) | Self::MbTrain(_) | Self::LinkInit | Self::Retrain
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => f.write_str("RESET"),
            Self::SbInit => f.write_str("SBINIT"),
            Self::MbInit(phase) => write!(f, "MBINIT.{}", format!("{phase:?}").to_uppercase()),
            Self::MbTrain(phase) => write!(f, "MBTRAIN.{}", format!("{phase:?}").to_uppercase()),
            Self::LinkInit => f.write_str("LINKINIT"),
            Self::Active => f.write_str("ACTIVE"),
            Self::L1 => f.write_str("L1"),
            Self::L2 => f.write_str("L2"),
            Self::Retrain => f.write_str("RETRAIN"),
            Self::Error => f.write_str("ERROR"),
        }
    }
}

/// Sideband primitive received from the physical layer or the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SidebandMessage {
    /// Sideband detected by the partner.
    SbDetected,
    /// Response to the parameter-exchange request.
    ParamExchangeResponse,
    /// Calibration complete.
    CalibrationDone,
    /// Lane repair complete.
    RepairDone,
    /// Training pattern locked for the current phase.
    TrainingPatternLock,
    /// Link-layer init complete.
    LinkInitDone,
    /// Peer asks to enter a low-power state.
    LowPowerEntryRequest(LowPowerState),
    /// Leave the low-power state.
    LowPowerExit,
    /// Physical-layer error.
    ErrorAlert,
    /// External reset acknowledged.
    ResetAck,
}

/// Sideband primitive sent to the physical layer or the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SidebandRequest {
    /// Start sideband detection.
    SbDetect,
    /// Parameter-exchange request.
    ParamExchange,
    /// Start calibration.
    Calibrate,
    /// Start lane repair.
    Repair,
    /// Send the training pattern for a phase.
    TrainPattern(MbTrainPhase),
    /// Retrain the mainband.
    Retrain,
    /// Start link-layer init.
    LinkInit,
    /// Ask to enter a low-power state.
    LowPowerEntryRequest(LowPowerState),
    /// Retry buffer drained; the low-power state is entered.
    LowPowerEntryAck(LowPowerState),
    /// Wake from low power.
    LowPowerExit,
    /// Ask for an external reset.
    ResetRequest,
}

impl SidebandRequest {
    /// The completion primitive a compliant partner answers with, if any.
    pub fn expected_response(self) -> Option<SidebandMessage> {
        match self {
            Self::SbDetect => Some(SidebandMessage::SbDetected),
            Self::ParamExchange => Some(SidebandMessage::ParamExchangeResponse),
            Self::Calibrate => Some(SidebandMessage::CalibrationDone),
            Self::Repair => Some(SidebandMessage::RepairDone),
            Self::TrainPattern(_) | Self::Retrain => Some(SidebandMessage::TrainingPatternLock),
            Self::LinkInit => Some(SidebandMessage::LinkInitDone),
            Self::ResetRequest => Some(SidebandMessage::ResetAck),
            Self::LowPowerEntryRequest(_) | Self::LowPowerEntryAck(_) | Self::LowPowerExit => None,
        }
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// Automatic start from RESET.
    Start,
    /// Expected handshake observed.
    Handshake,
    /// Handshake not observed before the state timeout.
    Timeout,
    /// A flit exceeded the maximum retry count.
    RetryExhausted,
    /// Physical-layer error alert.
    ErrorAlert,
    /// Internal invariant breach.
    Fatal,
    /// Low-power entry or exit.
    Power,
    /// External reset acknowledged.
    ResetAck,
}

/// A state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous state.
    pub from: LinkState,
    /// New state.
    pub to: LinkState,
    /// Cause.
    pub cause: TransitionCause,
}

/// The link state machine.
#[derive(Debug)]
pub struct LinkStateMachine {
    state: LinkState,
    entered_at: Cycle,
    config: TrainingConfig,
    draining: Option<LowPowerState>,
    outbound: VecDeque<SidebandRequest>,
}

impl LinkStateMachine {
    /// Create a machine in RESET.
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            state: LinkState::Reset,
            entered_at: 0,
            config,
            draining: None,
            outbound: VecDeque::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Cycle the current state was entered.
    pub fn entered_at(&self) -> Cycle {
        self.entered_at
    }

    /// Low-power target while draining toward it.
    pub fn draining(&self) -> Option<LowPowerState> {
        self.draining
    }

    /// Whether new flits may be submitted and arbitrated.
    pub fn is_accepting(&self) -> bool {
        self.state.is_active() && self.draining.is_none()
    }

    fn timeout(&self) -> Option<Cycle> {
        match self.state {
            LinkState::SbInit | LinkState::MbInit(_) | LinkState::LinkInit => {
                Some(self.config.state_timeout)
            }
            LinkState::MbTrain(_) | LinkState::Retrain => Some(self.config.train_timeout),
            _ => None,
        }
    }

    /// Advance timers. RESET starts training on the first tick; a training
    /// state past its timeout fails to ERROR.
    pub fn on_tick(&mut self, now: Cycle) -> Option<Transition> {
        if self.state == LinkState::Reset {
            return Some(self.transition(LinkState::SbInit, TransitionCause::Start, now));
        }

        let timeout = self.timeout()?;
        if now.saturating_sub(self.entered_at) >= timeout {
            error!(state = %self.state, waited = now - self.entered_at, "training handshake timed out");
            return Some(self.transition(LinkState::Error, TransitionCause::Timeout, now));
        }
        None
    }

    /// Apply a sideband primitive. Primitives that do not match the current
    /// state are ignored.
    pub fn on_sideband(&mut self, msg: SidebandMessage, now: Cycle) -> Option<Transition> {
        use LinkState as S;
        use SidebandMessage as M;

        let next = match (self.state, msg) {
            (S::Error, M::ResetAck) => {
                return Some(self.transition(S::Reset, TransitionCause::ResetAck, now));
            }
            (S::Error, _) => None,
            (S::Active, M::ErrorAlert) => {
                return Some(self.transition(S::Retrain, TransitionCause::ErrorAlert, now));
            }
            (_, M::ErrorAlert) => {
                return Some(self.transition(S::Error, TransitionCause::ErrorAlert, now));
            }
            (S::SbInit, M::SbDetected) => Some(S::MbInit(MbInitPhase::Param)),
            (S::MbInit(MbInitPhase::Param), M::ParamExchangeResponse) => {
                Some(S::MbInit(MbInitPhase::Cal))
            }
            (S::MbInit(MbInitPhase::Cal), M::CalibrationDone) => Some(S::MbInit(MbInitPhase::Repair)),
            (S::MbInit(MbInitPhase::Repair), M::RepairDone) => Some(S::MbTrain(MbTrainPhase::FIRST)),
            (S::MbTrain(phase), M::TrainingPatternLock) => {
                Some(phase.next().map_or(S::LinkInit, S::MbTrain))
            }
            (S::Retrain, M::TrainingPatternLock) => Some(S::LinkInit),
            (S::LinkInit, M::LinkInitDone) => Some(S::Active),
            (S::Active, M::LowPowerEntryRequest(target)) => {
                self.begin_drain(target);
                return None;
            }
            (S::L1 | S::L2, M::LowPowerExit) => {
                return Some(self.transition(S::Active, TransitionCause::Power, now));
            }
            _ => None,
        };

        match next {
            Some(to) => Some(self.transition(to, TransitionCause::Handshake, now)),
            None => {
                debug!(state = %self.state, ?msg, "sideband message ignored");
                None
            }
        }
    }

    fn begin_drain(&mut self, target: LowPowerState) {
        if self.draining.is_none() {
            info!(?target, "draining for low-power entry");
            self.draining = Some(target);
        }
    }

    /// Start a locally requested low-power entry. The peer is asked to enter
    /// the same state.
    pub fn request_low_power(&mut self, target: LowPowerState) -> Result<(), LinkError> {
        if !self.state.is_active() {
            return Err(LinkError::NotActive { state: self.state });
        }
        if self.draining.is_none() {
            self.outbound.push_back(SidebandRequest::LowPowerEntryRequest(target));
            self.begin_drain(target);
        }
        Ok(())
    }

    /// Finish draining: acknowledge and enter the low-power state.
    pub fn complete_low_power(&mut self, now: Cycle) -> Option<Transition> {
        let target = self.draining.take()?;
        self.outbound.push_back(SidebandRequest::LowPowerEntryAck(target));
        let to = match target {
            LowPowerState::L1 => LinkState::L1,
            LowPowerState::L2 => LinkState::L2,
        };
        Some(self.transition(to, TransitionCause::Power, now))
    }

    /// Wake from a low-power state on local request.
    pub fn exit_low_power(&mut self, now: Cycle) -> Result<Transition, LinkError> {
        if !self.state.is_low_power() {
            return Err(LinkError::NotActive { state: self.state });
        }
        self.outbound.push_back(SidebandRequest::LowPowerExit);
        Ok(self.transition(LinkState::Active, TransitionCause::Power, now))
    }

    /// Enter RETRAIN from ACTIVE; anywhere else this fails to ERROR.
    pub fn retrain(&mut self, cause: TransitionCause, now: Cycle) -> Transition {
        let to = if self.state.is_active() {
            LinkState::Retrain
        } else {
            LinkState::Error
        };
        self.transition(to, cause, now)
    }

    /// Enter ERROR.
    pub fn fail(&mut self, now: Cycle) -> Transition {
        self.transition(LinkState::Error, TransitionCause::Fatal, now)
    }

    /// Next outbound sideband request.
    pub fn poll_outbound(&mut self) -> Option<SidebandRequest> {
        self.outbound.pop_front()
    }

    fn transition(&mut self, to: LinkState, cause: TransitionCause, now: Cycle) -> Transition {
        let from = self.state;
        self.state = to;
        self.entered_at = now;
        self.draining = None;

        let request = match to {
            LinkState::SbInit => Some(SidebandRequest::SbDetect),
            LinkState::MbInit(MbInitPhase::Param) => Some(SidebandRequest::ParamExchange),
            LinkState::MbInit(MbInitPhase::Cal) => Some(SidebandRequest::Calibrate),
            LinkState::MbInit(MbInitPhase::Repair) => Some(SidebandRequest::Repair),
            LinkState::MbTrain(phase) => Some(SidebandRequest::TrainPattern(phase)),
            LinkState::Retrain => Some(SidebandRequest::Retrain),
            LinkState::LinkInit => Some(SidebandRequest::LinkInit),
            LinkState::Error => Some(SidebandRequest::ResetRequest),
            _ => None,
        };
        if let Some(request) = request {
            self.outbound.push_back(request);
        }

        info!(%from, %to, ?cause, "link state transition");
        Transition { from, to, cause }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> LinkStateMachine {
        LinkStateMachine::new(TrainingConfig {
            state_timeout: 10,
            train_timeout: 20,
        })
    }

    const BRING_UP: [SidebandMessage; 9] = [
        SidebandMessage::SbDetected,
        SidebandMessage::ParamExchangeResponse,
        SidebandMessage::CalibrationDone,
        SidebandMessage::RepairDone,
        SidebandMessage::TrainingPatternLock,
        SidebandMessage::TrainingPatternLock,
        SidebandMessage::TrainingPatternLock,
        SidebandMessage::TrainingPatternLock,
        SidebandMessage::LinkInitDone,
    ];

    fn bring_up(sm: &mut LinkStateMachine) {
        sm.on_tick(1);
        for msg in BRING_UP {
            assert!(sm.on_sideband(msg, 2).is_some(), "{msg:?} in {}", sm.state());
        }
    }

    #[test]
    fn test_full_bring_up() {
        let mut sm = machine();
        assert_eq!(sm.state(), LinkState::Reset);
        bring_up(&mut sm);
        assert_eq!(sm.state(), LinkState::Active);
        assert!(sm.is_accepting());

        let requests: Vec<_> = std::iter::from_fn(|| sm.poll_outbound()).collect();
        assert_eq!(requests.first(), Some(&SidebandRequest::SbDetect));
        assert_eq!(requests.last(), Some(&SidebandRequest::LinkInit));
        assert_eq!(requests.len(), 9);
    }

    #[test]
    fn test_training_timeout() {
        let mut sm = machine();
        sm.on_tick(0);
        assert_eq!(sm.state(), LinkState::SbInit);
        assert!(sm.on_tick(9).is_none());

        let t = sm.on_tick(10).unwrap();
        assert_eq!(t.to, LinkState::Error);
        assert_eq!(t.cause, TransitionCause::Timeout);
    }

    #[test]
    fn test_train_phase_uses_train_timeout() {
        let mut sm = machine();
        sm.on_tick(0);
        for msg in &BRING_UP[..4] {
            sm.on_sideband(*msg, 0);
        }
        assert_eq!(sm.state(), LinkState::MbTrain(MbTrainPhase::ValVref));
        assert!(sm.on_tick(15).is_none());
        assert_eq!(sm.on_tick(20).unwrap().to, LinkState::Error);
    }

    #[test]
    fn test_error_recovery_via_reset_ack() {
        let mut sm = machine();
        sm.on_tick(0);
        sm.on_sideband(SidebandMessage::ErrorAlert, 1);
        assert_eq!(sm.state(), LinkState::Error);

        // Only the reset acknowledgement leaves ERROR
        assert!(sm.on_sideband(SidebandMessage::SbDetected, 2).is_none());
        assert!(sm.on_tick(5000).is_none());
        assert_eq!(sm.on_sideband(SidebandMessage::ResetAck, 3).unwrap().to, LinkState::Reset);
        assert_eq!(sm.on_tick(4).unwrap().to, LinkState::SbInit);
    }

    #[test]
    fn test_error_alert_in_active_retrains() {
        let mut sm = machine();
        bring_up(&mut sm);
        let t = sm.on_sideband(SidebandMessage::ErrorAlert, 10).unwrap();
        assert_eq!((t.from, t.to), (LinkState::Active, LinkState::Retrain));

        assert_eq!(
            sm.on_sideband(SidebandMessage::TrainingPatternLock, 11).unwrap().to,
            LinkState::LinkInit
        );
    }

    #[test]
    fn test_retrain_timeout() {
        let mut sm = machine();
        bring_up(&mut sm);
        sm.retrain(TransitionCause::RetryExhausted, 100);
        assert_eq!(sm.state(), LinkState::Retrain);
        assert_eq!(sm.on_tick(120).unwrap().to, LinkState::Error);
    }

    #[test]
    fn test_retrain_outside_active_fails() {
        let mut sm = machine();
        sm.on_tick(0);
        assert_eq!(sm.retrain(TransitionCause::RetryExhausted, 1).to, LinkState::Error);
    }

    #[test]
    fn test_low_power_drain() {
        let mut sm = machine();
        bring_up(&mut sm);
        while sm.poll_outbound().is_some() {}

        sm.request_low_power(LowPowerState::L1).unwrap();
        assert_eq!(sm.state(), LinkState::Active);
        assert!(!sm.is_accepting());

        let t = sm.complete_low_power(50).unwrap();
        assert_eq!(t.to, LinkState::L1);
        assert_eq!(
            std::iter::from_fn(|| sm.poll_outbound()).collect::<Vec<_>>(),
            vec![
                SidebandRequest::LowPowerEntryRequest(LowPowerState::L1),
                SidebandRequest::LowPowerEntryAck(LowPowerState::L1),
            ]
        );

        // No timeout while asleep
        assert!(sm.on_tick(1_000_000).is_none());
        assert_eq!(sm.on_sideband(SidebandMessage::LowPowerExit, 60).unwrap().to, LinkState::Active);
    }

    #[test]
    fn test_peer_low_power_request() {
        let mut sm = machine();
        bring_up(&mut sm);
        assert!(sm
            .on_sideband(SidebandMessage::LowPowerEntryRequest(LowPowerState::L2), 5)
            .is_none());
        assert_eq!(sm.draining(), Some(LowPowerState::L2));
        assert_eq!(sm.complete_low_power(6).unwrap().to, LinkState::L2);
        assert!(sm.exit_low_power(7).is_ok());
        assert!(sm.is_accepting());
    }

    #[test]
    fn test_low_power_requires_active() {
        let mut sm = machine();
        assert!(matches!(
            sm.request_low_power(LowPowerState::L1),
            Err(LinkError::NotActive { .. })
        ));
        assert!(sm.exit_low_power(0).is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LinkState::MbInit(MbInitPhase::Cal).to_string(), "MBINIT.CAL");
        assert_eq!(LinkState::MbTrain(MbTrainPhase::ValVref).to_string(), "MBTRAIN.VALVREF");
        assert_eq!(LinkState::Active.to_string(), "ACTIVE");
    }
}
