//! TOML-based link configuration.
//!
//! Every component takes the section it needs by reference at construction
//! time; nothing here is global.
//!
//! ```toml
//! payload_size = 32
//!
//! [retry]
//! depth = 32
//! timeout_cycles = 64
//! max_retries = 4
//!
//! [arbiter]
//! starvation_threshold = 32
//!
//! [[channels]]
//! protocol = "pcie"
//! virtual_channel = 0
//! weight = 128
//! credits = 8
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::constants::*;
use super::error::ConfigError;
use crate::flit::ProtocolId;

/// Top-level link configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Payload width in bytes.
    pub payload_size: usize,
    /// Retry buffer and receive-window settings.
    pub retry: RetryConfig,
    /// Arbitration settings.
    pub arbiter: ArbiterConfig,
    /// Link-training timeouts.
    pub training: TrainingConfig,
    /// Logical channels multiplexed over the link, in `ChannelId` order.
    pub channels: Vec<ChannelConfig>,
}

/// The `[retry]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum unacknowledged flits (also the reorder window).
    pub depth: usize,
    /// Cycles before an unacknowledged flit is retransmitted.
    pub timeout_cycles: Cycle,
    /// Retransmissions allowed before the flit is dropped.
    pub max_retries: u32,
    /// CRC failures within `crc_alarm_window` that raise a link-quality alarm.
    pub crc_alarm_threshold: u32,
    /// Sliding window for the CRC alarm.
    pub crc_alarm_window: Cycle,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_RETRY_DEPTH,
            timeout_cycles: DEFAULT_RETRY_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            crc_alarm_threshold: DEFAULT_CRC_ALARM_THRESHOLD,
            crc_alarm_window: DEFAULT_CRC_ALARM_WINDOW,
        }
    }
}

/// The `[arbiter]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Wait after which a ready channel is forced to maximum priority, and
    /// after which a credit-starved channel receives an emergency credit.
    pub starvation_threshold: Cycle,
    /// Priority boost per cycle waited.
    pub aging_step: u32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            starvation_threshold: DEFAULT_STARVATION_THRESHOLD,
            aging_step: DEFAULT_AGING_STEP,
        }
    }
}

/// The `[training]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Handshake timeout for SBINIT, MBINIT and LINKINIT.
    pub state_timeout: Cycle,
    /// Timeout for each MBTRAIN / RETRAIN sub-phase.
    pub train_timeout: Cycle,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            state_timeout: DEFAULT_STATE_TIMEOUT,
            train_timeout: DEFAULT_TRAIN_TIMEOUT,
        }
    }
}

/// A `[[channels]]` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Protocol carried on this channel.
    pub protocol: ProtocolId,
    /// Target virtual channel within the protocol.
    pub virtual_channel: u8,
    /// Base arbitration weight (0-255).
    pub weight: u8,
    /// Initial credit count advertised by the receiver for this VC.
    pub credits: u16,
    /// Upper-channel submit queue depth.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

impl ChannelConfig {
    /// Create a channel entry with the default queue depth.
    pub fn new(protocol: ProtocolId, virtual_channel: u8, weight: u8, credits: u16) -> Self {
        Self {
            protocol,
            virtual_channel,
            weight,
            credits,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            payload_size: DEFAULT_PAYLOAD_SIZE,
            retry: RetryConfig::default(),
            arbiter: ArbiterConfig::default(),
            training: TrainingConfig::default(),
            channels: vec![
                ChannelConfig::new(ProtocolId::Pcie, 0, 128, 8),
                ChannelConfig::new(ProtocolId::CxlCacheMem, 0, 128, 8),
            ],
        }
    }
}

impl LinkConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Total flit size on the wire.
    pub fn flit_size(&self) -> usize {
        FLIT_HEADER_SIZE + self.payload_size + FLIT_CRC_SIZE
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_PAYLOAD_SIZE..=MAX_PAYLOAD_SIZE).contains(&self.payload_size) {
            return Err(invalid(format!(
                "payload_size {} outside {}..={}",
                self.payload_size, MIN_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE
            )));
        }
        if self.retry.depth == 0 || self.retry.depth > MAX_RETRY_WINDOW {
            return Err(invalid(format!(
                "retry depth {} must be in 1..={} (below half the sequence space)",
                self.retry.depth, MAX_RETRY_WINDOW
            )));
        }
        if self.retry.timeout_cycles == 0 {
            return Err(invalid("retry timeout_cycles must be nonzero".into()));
        }
        if self.retry.crc_alarm_window == 0 {
            return Err(invalid("crc_alarm_window must be nonzero".into()));
        }
        if self.arbiter.starvation_threshold == 0 {
            return Err(invalid("starvation_threshold must be nonzero".into()));
        }
        if self.training.state_timeout == 0 || self.training.train_timeout == 0 {
            return Err(invalid("training timeouts must be nonzero".into()));
        }
        if self.channels.is_empty() {
            return Err(invalid("at least one channel is required".into()));
        }
        if self.channels.len() > u8::MAX as usize {
            return Err(invalid("too many channels".into()));
        }

        let mut seen = BTreeSet::new();
        for (idx, ch) in self.channels.iter().enumerate() {
            if ch.virtual_channel >= MAX_VIRTUAL_CHANNELS {
                return Err(invalid(format!(
                    "channel {idx}: virtual_channel {} out of range",
                    ch.virtual_channel
                )));
            }
            if ch.queue_depth == 0 {
                return Err(invalid(format!("channel {idx}: queue_depth must be nonzero")));
            }
            if !seen.insert((ch.protocol, ch.virtual_channel)) {
                return Err(invalid(format!(
                    "channel {idx}: duplicate ({}, vc {})",
                    ch.protocol, ch.virtual_channel
                )));
            }
        }

        Ok(())
    }
}

fn invalid(msg: String) -> ConfigError {
    ConfigError::Invalid(msg)
}
