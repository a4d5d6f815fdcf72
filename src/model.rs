use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Delay between probe cycles, slept regardless of the probe outcome.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long a single probe waits for an echo reply.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Extra connectivity probes attempted at startup before giving up,
    /// i.e. `retry_count + 1` attempts in total.
    pub retry_count: u32,
    /// Delay between failed startup probes.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Initial minimum-latency filter in milliseconds (0 = no filter).
    pub filter_threshold: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_secs(4),
            retry_count: 3,
            retry_delay: Duration::from_millis(500),
            filter_threshold: 0,
        }
    }
}

/// Lifecycle of the monitor. Exactly one state is live at a time; the error
/// states are re-armable, a later `start` may leave them again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Probing,
    Running,
    Stopped,
    HostError,
    PingError,
}

impl RunState {
    /// Human-readable status-line text.
    pub fn label(self) -> &'static str {
        match self {
            RunState::Idle => "Idle",
            RunState::Probing => "Starting",
            RunState::Running => "Running",
            RunState::Stopped => "Stopped",
            RunState::HostError => "Host error",
            RunState::PingError => "Ping error",
        }
    }
}

/// One successful probe: when it completed and the measured round trip.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub at: Instant,
    pub latency_ms: u64,
}

/// Summary over one set of latency values. `average` and `median` keep full
/// precision; display layers decide how to round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub average: f64,
    pub min: u64,
    pub max: u64,
    pub median: f64,
}

/// Statistics over the current history, recomputed per cycle.
///
/// `filtered` is `Some` exactly when a filter threshold > 0 is active, so
/// consumers can tell "no filter applied" apart from "filter applied, zero
/// samples matched".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub summary: Summary,
    pub filtered: Option<Summary>,
    pub lost: u64,
}

/// Result of one polling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    Reply { rtt_ms: u64 },
    Lost,
}

/// Events published by the sampler task. Each polling cycle produces exactly
/// one `CycleCompleted`, carrying the sample outcome and the statistics
/// recomputed for it in the same message.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    StateChanged(RunState),
    CycleCompleted {
        outcome: CycleOutcome,
        /// When the cycle's probe completed. For a reply this is the stored
        /// sample's timestamp, so plots drawn from it line up with the
        /// history rather than with event delivery.
        at: Instant,
        /// `None` while fewer than two samples exist.
        stats: Option<Statistics>,
    },
    HistoryCleared,
}

/// Final report printed by `--json` mode.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub host: String,
    pub timestamp_utc: String,
    pub cycles: u64,
    pub statistics: Option<Statistics>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    /// The target failed syntactic validation; no network I/O was attempted.
    #[error("malformed host {0:?}")]
    Host(String),
    /// The startup connectivity probe exhausted its retry budget.
    #[error("host did not answer any of {attempts} probe attempts")]
    Ping { attempts: u32 },
    /// The sampler task is gone; only possible after the monitor shut down.
    #[error("monitor task is no longer running")]
    EngineGone,
}
