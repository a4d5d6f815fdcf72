use crate::engine::Monitor;
use crate::model::{
    CycleOutcome, MonitorConfig, MonitorEvent, MonitorReport, RunState, Statistics,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "pingmon",
    version,
    about = "Periodic ping monitor with running statistics and optional TUI"
)]
pub struct Cli {
    /// Target host (hostname or IP literal). Required for --text/--json;
    /// pre-filled and started automatically in the TUI.
    pub host: Option<String>,

    /// Print one line per probe cycle plus a final summary (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently and print the final statistics as JSON (requires --count)
    #[arg(long)]
    pub json: bool,

    /// Stop after this many probe cycles (0 = run until Ctrl-C)
    #[arg(long, default_value_t = 0)]
    pub count: u64,

    /// Delay between probe cycles
    #[arg(long, default_value = "1s")]
    pub interval: humantime::Duration,

    /// Per-probe reply timeout
    #[arg(long, default_value = "4s")]
    pub probe_timeout: humantime::Duration,

    /// Extra connectivity probes attempted at startup before giving up
    #[arg(long, default_value_t = 3)]
    pub retry_count: u32,

    /// Delay between failed startup probes
    #[arg(long, default_value = "500ms")]
    pub retry_delay: humantime::Duration,

    /// Minimum latency (ms) a sample must reach to count toward the
    /// filtered statistics (0 = no filter)
    #[arg(long, default_value_t = 0)]
    pub filter: u64,
}

pub async fn run(args: Cli) -> Result<()> {
    if args.json && args.count == 0 {
        return Err(anyhow::anyhow!(
            "--json requires --count so the run can terminate"
        ));
    }

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_text(args).await;
        }
    }

    if args.json {
        return run_json(args).await;
    }
    run_text(args).await
}

/// Build a `MonitorConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> MonitorConfig {
    MonitorConfig {
        poll_interval: Duration::from(args.interval),
        probe_timeout: Duration::from(args.probe_timeout),
        retry_count: args.retry_count,
        retry_delay: Duration::from(args.retry_delay),
        filter_threshold: args.filter,
    }
}

fn require_host(args: &Cli) -> Result<String> {
    args.host
        .clone()
        .context("a target host is required (pingmon <HOST>)")
}

async fn run_text(args: Cli) -> Result<()> {
    let host = require_host(&args)?;
    let (monitor, mut events) = Monitor::spawn(build_config(&args));
    monitor
        .start(&host)
        .await
        .with_context(|| format!("cannot start monitoring {host}"))?;

    let mut cycles = 0u64;
    let mut last_stats: Option<Statistics> = None;
    let mut failed: Option<RunState> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                monitor.stop().await;
                break;
            }
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    MonitorEvent::CycleCompleted { outcome, stats, .. } => {
                        cycles += 1;
                        match outcome {
                            CycleOutcome::Reply { rtt_ms } => {
                                println!("reply from {host}: {rtt_ms} ms");
                            }
                            CycleOutcome::Lost => println!("request timed out"),
                        }
                        if let Some(s) = stats {
                            last_stats = Some(s);
                        }
                        if args.count > 0 && cycles >= args.count {
                            monitor.stop().await;
                            break;
                        }
                    }
                    MonitorEvent::StateChanged(state) => {
                        eprintln!("{}", state.label());
                        // The engine parks after an unrecoverable error and
                        // produces no further cycles; waiting would hang.
                        if matches!(state, RunState::PingError | RunState::HostError) {
                            failed = Some(state);
                            break;
                        }
                    }
                    MonitorEvent::HistoryCleared => {}
                }
            }
        }
    }

    if let Some(stats) = last_stats.as_ref() {
        print_summary(stats);
    }
    if let Some(state) = failed {
        anyhow::bail!("monitoring ended early: {}", state.label().to_lowercase());
    }
    Ok(())
}

/// Drain cycle events until `count` cycles have completed (0 = no limit) or
/// the engine parks in an error state. Returns the cycles seen, the latest
/// statistics and the error state that cut the run short, if any.
async fn drain_cycles(
    monitor: &Monitor,
    events: &mut mpsc::Receiver<MonitorEvent>,
    count: u64,
) -> (u64, Option<Statistics>, Option<RunState>) {
    let mut cycles = 0u64;
    let mut last_stats: Option<Statistics> = None;
    while let Some(ev) = events.recv().await {
        match ev {
            MonitorEvent::CycleCompleted { stats, .. } => {
                cycles += 1;
                if let Some(s) = stats {
                    last_stats = Some(s);
                }
                if count > 0 && cycles >= count {
                    monitor.stop().await;
                    break;
                }
            }
            MonitorEvent::StateChanged(s @ (RunState::PingError | RunState::HostError)) => {
                return (cycles, last_stats, Some(s));
            }
            _ => {}
        }
    }
    (cycles, last_stats, None)
}

async fn run_json(args: Cli) -> Result<()> {
    let host = require_host(&args)?;
    let (monitor, mut events) = Monitor::spawn(build_config(&args));
    monitor
        .start(&host)
        .await
        .with_context(|| format!("cannot start monitoring {host}"))?;

    let (cycles, last_stats, failed) = drain_cycles(&monitor, &mut events, args.count).await;

    let report = MonitorReport {
        host,
        timestamp_utc: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into()),
        cycles,
        statistics: last_stats,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(state) = failed {
        anyhow::bail!("monitoring ended early: {}", state.label().to_lowercase());
    }
    Ok(())
}

/// Mirrors the status line: full statistics, plus the filtered subset when a
/// threshold is active. Averages are floored for display only.
fn print_summary(stats: &Statistics) {
    let s = &stats.summary;
    println!(
        "Total: {} | Avg: {} | Min: {} | Max: {} | Median: {} | Lost: {}",
        s.count,
        s.average.floor(),
        s.min,
        s.max,
        s.median,
        stats.lost
    );
    if let Some(f) = stats.filtered.as_ref() {
        println!(
            "Filtered: {} | Avg: {} | Min: {} | Max: {} | Median: {}",
            f.count,
            f.average.floor(),
            f.min,
            f.max,
            f.median
        );
    }
}
