//! Scripted sideband collaborator.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::core::Cycle;
use crate::link::{SidebandMessage, SidebandRequest};

/// Answers each training request with its completion primitive after a fixed
/// delay. Individual requests can be silenced to provoke state timeouts.
#[derive(Debug)]
pub struct SidebandPartner {
    delay: Cycle,
    auto_reset: bool,
    silenced: HashSet<SidebandRequest>,
    pending: VecDeque<(Cycle, SidebandMessage)>,
    /// Requests seen that carry no response (low-power handshakes).
    notifications: VecDeque<SidebandRequest>,
}

impl Default for SidebandPartner {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SidebandPartner {
    /// Create a partner that answers after `delay` cycles.
    pub fn new(delay: Cycle) -> Self {
        Self {
            delay,
            auto_reset: true,
            silenced: HashSet::new(),
            pending: VecDeque::new(),
            notifications: VecDeque::new(),
        }
    }

    /// Whether reset requests are acknowledged automatically (default on).
    pub fn with_auto_reset(mut self, enabled: bool) -> Self {
        self.auto_reset = enabled;
        self
    }

    /// Never answer `request`.
    pub fn silence(&mut self, request: SidebandRequest) {
        self.silenced.insert(request);
    }

    /// Answer `request` again.
    pub fn unsilence(&mut self, request: SidebandRequest) {
        self.silenced.remove(&request);
    }

    /// Record a request from the controller.
    pub fn observe(&mut self, request: SidebandRequest, now: Cycle) {
        if self.silenced.contains(&request) {
            debug!(?request, "sideband request silenced");
            return;
        }
        if request == SidebandRequest::ResetRequest && !self.auto_reset {
            self.notifications.push_back(request);
            return;
        }

        match request.expected_response() {
            Some(response) => self.pending.push_back((now + self.delay, response)),
            None => self.notifications.push_back(request),
        }
    }

    /// Next response due by cycle `now`.
    pub fn poll(&mut self, now: Cycle) -> Option<SidebandMessage> {
        match self.pending.front() {
            Some((due, _)) if *due <= now => self.pending.pop_front().map(|(_, msg)| msg),
            _ => None,
        }
    }

    /// Next request that needed no response, e.g. a low-power entry request
    /// to forward to the other die.
    pub fn take_notification(&mut self) -> Option<SidebandRequest> {
        self.notifications.pop_front()
    }
}
