//! d2d-link loopback demo
//!
//! Trains two link controllers against each other over a pair of lossy
//! wires, streams flits on every configured channel in both directions, and
//! prints the status counters of both ends.
//!
//! Environment variables:
//! - D2D_CONFIG: path to a TOML link configuration (default: built-in)
//! - D2D_SEED: wire RNG seed (default 1)
//! - D2D_BER: per-flit bit-error probability (default 0.01)
//! - D2D_FLITS: flits to send per channel per direction (default 200)
//! - D2D_CYCLES: cycle budget (default 100000)
//! - RUST_LOG: log filter (default info)

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use d2d_link::arbiter::ChannelId;
use d2d_link::core::{ConfigError, Cycle, LinkConfig, LinkError};
use d2d_link::flit::FlitType;
use d2d_link::link::{LinkEvent, LinkStatus};
use d2d_link::sim::{Loopback, LossyWire, Side};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum DemoError {
    #[error("{0}: invalid value {1:?}")]
    Env(&'static str, String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("link did not train within {0} cycles")]
    Training(Cycle),
}

struct Settings {
    config: LinkConfig,
    seed: u64,
    bit_error_rate: f64,
    flits: usize,
    cycles: Cycle,
}

fn env_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, DemoError> {
    match env::var(name) {
        Ok(value) => value.parse().map_err(|_| DemoError::Env(name, value)),
        Err(_) => Ok(default),
    }
}

fn settings() -> Result<Settings, DemoError> {
    let config = match env::var("D2D_CONFIG") {
        Ok(path) => LinkConfig::load(&PathBuf::from(path))?,
        Err(_) => LinkConfig::default(),
    };

    Ok(Settings {
        config,
        seed: env_or("D2D_SEED", 1)?,
        bit_error_rate: env_or("D2D_BER", 0.01)?,
        flits: env_or("D2D_FLITS", 200)?,
        cycles: env_or("D2D_CYCLES", 100_000)?,
    })
}

/// Per-direction traffic bookkeeping.
struct Traffic {
    next: Vec<usize>,
    received: Vec<usize>,
}

impl Traffic {
    fn new(channels: usize) -> Self {
        Self {
            next: vec![0; channels],
            received: vec![0; channels],
        }
    }
}

fn pump(lb: &mut Loopback, from: Side, to: Side, traffic: &mut Traffic, total: usize) {
    let channels = traffic.next.len();

    for idx in 0..channels {
        let channel = ChannelId(idx as u8);
        while traffic.next[idx] < total {
            let seq = traffic.next[idx] as u32;
            match lb.side(from).submit(channel, FlitType::Single, &seq.to_le_bytes()) {
                Ok(()) => traffic.next[idx] += 1,
                Err(err) if err.is_recoverable() => break,
                Err(err) => {
                    warn!(%err, "submit failed");
                    break;
                }
            }
        }
    }

    for idx in 0..channels {
        let channel = ChannelId(idx as u8);
        while let Ok(Some(flit)) = lb.side(to).recv(channel) {
            let seq = u32::from_le_bytes([
                flit.payload[0],
                flit.payload[1],
                flit.payload[2],
                flit.payload[3],
            ]) as usize;
            if seq != traffic.received[idx] {
                warn!(channel = idx, expected = traffic.received[idx], got = seq, "out of sequence");
            }
            traffic.received[idx] = seq + 1;
        }
    }
}

fn report(name: &str, status: &LinkStatus) {
    println!("== {name}: {} at cycle {}", status.state, status.cycle);
    for ch in &status.channels {
        println!(
            "   ch{} {:<12} vc{}  grants {:>6}  credits {}/{}",
            ch.channel,
            ch.protocol.to_string(),
            ch.virtual_channel,
            ch.grants,
            ch.available,
            ch.available + ch.consumed,
        );
    }
    let c = &status.counters;
    println!(
        "   crc_failures {}  retransmissions {}  retry_exhausted {}  flits_lost {}  stale {}",
        c.crc_failures, c.retransmissions, c.retry_exhausted, c.flits_lost, c.stale_session
    );
    println!(
        "   starvation {}  emergency_grants {}  quality_alarms {}  credit_overflows {}",
        c.starvation_events, c.emergency_grants, c.quality_alarms, c.credit_overflows
    );
}

fn run() -> Result<bool, DemoError> {
    let s = settings()?;
    let channels = s.config.channels.len();
    info!(
        seed = s.seed,
        ber = s.bit_error_rate,
        flit_size = s.config.flit_size(),
        channels,
        "starting loopback"
    );

    let mut lb = Loopback::with_wires(
        s.config,
        LossyWire::new(s.seed, s.bit_error_rate),
        LossyWire::new(s.seed.wrapping_add(1), s.bit_error_rate),
    )?;

    if !lb.train(10_000) {
        return Err(DemoError::Training(10_000));
    }
    info!(cycle = lb.cycle(), "both ends active");

    let mut ab = Traffic::new(channels);
    let mut ba = Traffic::new(channels);
    let done = |ab: &Traffic, ba: &Traffic| {
        ab.received.iter().chain(&ba.received).all(|&n| n >= s.flits)
    };

    while lb.cycle() < s.cycles && !done(&ab, &ba) {
        pump(&mut lb, Side::A, Side::B, &mut ab, s.flits);
        pump(&mut lb, Side::B, Side::A, &mut ba, s.flits);
        lb.step();

        for side in [Side::A, Side::B] {
            while let Some(event) = lb.side(side).poll_event() {
                match event {
                    LinkEvent::StateChanged { .. } => {}
                    LinkEvent::DataLoss { .. } | LinkEvent::CreditViolation(_) => {
                        error!(?side, ?event, "link event");
                    }
                    _ => warn!(?side, ?event, "link event"),
                }
            }
        }
    }

    report("A", &lb.a.status());
    report("B", &lb.b.status());
    println!(
        "wire A->B: {:?}\nwire B->A: {:?}",
        lb.wire_ab.stats(),
        lb.wire_ba.stats()
    );

    Ok(done(&ab, &ba))
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            error!("not every flit was delivered within the cycle budget");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(%err, "loopback failed");
            ExitCode::FAILURE
        }
    }
}
