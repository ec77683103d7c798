//! `quill sim` — deterministic simulation campaign commands.
//!
//! `quill sim run` — execute a campaign across many seeds.
//! `quill sim replay` — replay a single seed with detailed trace output.

use std::ops::Range;
use std::path::Path;
use std::process;

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};
use quill_core::config::LogLevel;
use quill_sim::TraceEvent;
use quill_sim::campaign::{CampaignConfig, replay_seed, run_campaign};
use quill_sim::network::{DeliveryStats, FaultConfig};
use serde::Serialize;

use crate::output::{OutputMode, pretty_kv, pretty_section};

/// Top-level arguments for `quill sim`.
#[derive(Args, Debug)]
pub struct SimArgs {
    #[command(subcommand)]
    pub command: SimCommand,
}

/// Simulation subcommands.
#[derive(Subcommand, Debug)]
pub enum SimCommand {
    /// Run a campaign across multiple seeds.
    #[command(
        about = "Run a simulation campaign across multiple seeds",
        long_about = "Drive the real recorder through scripted editing sessions over a\n\
                      fault-injecting network into an in-memory store, then check the\n\
                      ledger against the client. Reports pass/fail per seed and the first\n\
                      failure for replay.",
        after_help = "EXAMPLES:\n    # Run 100 seeds with default faults\n    quill sim run\n\n\
                      # Heavier packet loss over more seeds\n    quill sim run --seeds 0..500 --drop 30\n\n\
                      # Fault-free baseline\n    quill sim run --no-faults\n\n\
                      # Machine-readable output\n    quill sim run --format json"
    )]
    Run(SimRunArgs),

    /// Replay a single seed with full trace.
    #[command(
        about = "Replay a single seed with detailed trace output",
        long_about = "Replay a specific seed to get its delivery statistics, oracle verdict\n\
                      and, with --trace, every action and request. Use after a campaign\n\
                      failure to debug.",
        after_help = "EXAMPLES:\n    # Replay seed 42\n    quill sim replay --seed 42\n\n\
                      # Show every step\n    quill sim replay --seed 42 --trace\n\n\
                      # Same fault knobs as the failing campaign\n    quill sim replay --seed 42 --drop 30"
    )]
    Replay(SimReplayArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LevelArg {
    Verbose,
    Standard,
    Minimal,
}

impl From<LevelArg> for LogLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Verbose => Self::Verbose,
            LevelArg::Standard => Self::Standard,
            LevelArg::Minimal => Self::Minimal,
        }
    }
}

/// Session shape and fault rates shared by `run` and `replay`.
#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Simulated steps per session.
    #[arg(long, default_value = "400")]
    pub steps: u64,

    /// Events per upload request.
    #[arg(long, default_value = "16")]
    pub batch: usize,

    /// Recorder log level.
    #[arg(long, value_enum, default_value = "standard")]
    pub level: LevelArg,

    /// Percent of requests that never reach the server.
    #[arg(long, default_value = "10")]
    pub drop: u8,

    /// Percent of requests answered with 503.
    #[arg(long, default_value = "5")]
    pub server_errors: u8,

    /// Percent of requests stored but never acknowledged.
    #[arg(long, default_value = "5")]
    pub lost_acks: u8,

    /// Percent of requests delivered twice.
    #[arg(long, default_value = "5")]
    pub duplicates: u8,

    /// Per-step percent chance of going offline.
    #[arg(long, default_value = "2")]
    pub offline: u8,

    /// Steps an offline window lasts.
    #[arg(long, default_value = "25")]
    pub offline_steps: u16,

    /// Percent of unload beacons lost.
    #[arg(long, default_value = "30")]
    pub beacon_drop: u8,

    /// Ignore every fault rate.
    #[arg(long)]
    pub no_faults: bool,
}

impl SessionArgs {
    fn fault(&self) -> FaultConfig {
        if self.no_faults {
            return FaultConfig::none();
        }
        FaultConfig {
            drop_rate_percent: self.drop.min(100),
            server_error_rate_percent: self.server_errors.min(100),
            lost_ack_rate_percent: self.lost_acks.min(100),
            duplicate_rate_percent: self.duplicates.min(100),
            offline_rate_percent: self.offline.min(100),
            offline_duration_steps: self.offline_steps,
            beacon_drop_rate_percent: self.beacon_drop.min(100),
        }
    }

    fn campaign(&self, seed_range: Range<u64>) -> CampaignConfig {
        CampaignConfig {
            seed_range,
            steps: self.steps,
            max_batch_size: self.batch,
            log_level: self.level.into(),
            fault: self.fault(),
        }
    }

    fn flags(&self) -> String {
        if self.no_faults {
            format!("--steps {} --no-faults", self.steps)
        } else {
            format!(
                "--steps {} --drop {} --server-errors {} --lost-acks {} --duplicates {} --offline {}",
                self.steps, self.drop, self.server_errors, self.lost_acks, self.duplicates, self.offline
            )
        }
    }
}

/// Arguments for `quill sim run`.
#[derive(Args, Debug)]
pub struct SimRunArgs {
    /// Seeds to run: `START..END`, or a count starting at 0.
    #[arg(long, default_value = "0..100", value_parser = parse_seed_range)]
    pub seeds: Range<u64>,

    #[command(flatten)]
    pub session: SessionArgs,
}

/// Arguments for `quill sim replay`.
#[derive(Args, Debug)]
pub struct SimReplayArgs {
    /// Seed to replay.
    #[arg(long)]
    pub seed: u64,

    /// Include every trace event.
    #[arg(long)]
    pub trace: bool,

    #[command(flatten)]
    pub session: SessionArgs,
}

fn parse_seed_range(raw: &str) -> Result<Range<u64>, String> {
    let range = match raw.split_once("..") {
        Some((start, end)) => {
            let start = start
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid start '{start}': {e}"))?;
            let end = end
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid end '{end}': {e}"))?;
            start..end
        }
        None => 0..raw
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid seed count '{raw}': {e}"))?,
    };
    if range.is_empty() {
        return Err(format!("seed range {raw} is empty"));
    }
    Ok(range)
}

/// JSON output for `quill sim run`.
#[derive(Debug, Serialize)]
struct RunOutput {
    seeds_run: usize,
    seeds_passed: usize,
    seeds_failed: usize,
    first_failure: Option<u64>,
    interesting_states_reached: usize,
    events_stored: usize,
    all_passed: bool,
    fault: FaultConfig,
    failures: Vec<FailureOutput>,
}

#[derive(Debug, Serialize)]
struct FailureOutput {
    seed: u64,
    violations: Vec<String>,
}

/// JSON output for `quill sim replay`.
#[derive(Debug, Serialize)]
struct ReplayOutput {
    seed: u64,
    trace_events: usize,
    ledger_events: usize,
    client_last_sequence: Option<u64>,
    unacknowledged: usize,
    offline_windows: usize,
    deliveries: DeliveryStats,
    oracle_passed: bool,
    violations: Vec<String>,
    interesting_state_reached: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    trace: Vec<TraceEvent>,
}

/// Execute `quill sim run`.
///
/// # Errors
///
/// Returns an error if the campaign configuration is invalid or a
/// simulation cannot run. Exits with status 1 when any seed fails.
pub fn run_sim_run(args: &SimRunArgs, output: OutputMode, _project_root: &Path) -> Result<()> {
    let config = args.session.campaign(args.seeds.clone());
    let report = run_campaign(&config)?;

    let out = RunOutput {
        seeds_run: report.seeds_run,
        seeds_passed: report.seeds_passed,
        seeds_failed: report.failures.len(),
        first_failure: report.first_failure,
        interesting_states_reached: report.interesting_states_reached,
        events_stored: report.events_stored,
        all_passed: report.all_passed(),
        fault: config.fault,
        failures: report
            .failures
            .iter()
            .map(|f| FailureOutput {
                seed: f.seed,
                violations: f.violations.clone(),
            })
            .collect(),
    };
    let replay_hint = format!(
        "quill sim replay --seed {} {}",
        out.first_failure.unwrap_or(0),
        args.session.flags()
    );

    render_run(&out, args, config.steps, &replay_hint, output)?;

    if !report.all_passed() {
        process::exit(1);
    }

    Ok(())
}

fn render_run(
    out: &RunOutput,
    args: &SimRunArgs,
    steps: u64,
    replay_hint: &str,
    output: OutputMode,
) -> Result<()> {
    match output {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(out)?);
        }
        OutputMode::Text => {
            println!(
                "campaign seeds_run={} steps={} drop_pct={} offline_pct={}",
                out.seeds_run, steps, out.fault.drop_rate_percent, out.fault.offline_rate_percent
            );
            println!(
                "results passed={} failed={} interesting_states={} events_stored={} all_passed={}",
                out.seeds_passed,
                out.seeds_failed,
                out.interesting_states_reached,
                out.events_stored,
                out.all_passed
            );
            if !out.all_passed {
                for failure in out.failures.iter().take(5) {
                    println!(
                        "failure seed={} violations={}",
                        failure.seed,
                        failure.violations.len()
                    );
                }
                if out.failures.len() > 5 {
                    println!("failures_truncated count={}", out.failures.len() - 5);
                }
                println!("hint replay_seed={}", out.first_failure.unwrap_or(0));
            }
        }
        OutputMode::Pretty => {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            pretty_section(&mut w, "Simulation Campaign")?;
            pretty_kv(&mut w, "Seeds", format!("{}..{}", args.seeds.start, args.seeds.end))?;
            pretty_kv(&mut w, "Steps", steps.to_string())?;
            pretty_kv(
                &mut w,
                "Faults",
                format!(
                    "drop {}% / 5xx {}% / lost ack {}% / dup {}% / offline {}%",
                    out.fault.drop_rate_percent,
                    out.fault.server_error_rate_percent,
                    out.fault.lost_ack_rate_percent,
                    out.fault.duplicate_rate_percent,
                    out.fault.offline_rate_percent
                ),
            )?;
            pretty_kv(
                &mut w,
                "Results",
                format!(
                    "{} passed / {} failed ({} interesting states)",
                    out.seeds_passed, out.seeds_failed, out.interesting_states_reached
                ),
            )?;
            pretty_kv(&mut w, "Events stored", out.events_stored.to_string())?;

            if out.all_passed {
                pretty_kv(&mut w, "Status", "all seeds passed")?;
            } else {
                pretty_kv(
                    &mut w,
                    "Status",
                    format!(
                        "{} failures (first at seed {})",
                        out.seeds_failed,
                        out.first_failure.unwrap_or(0)
                    ),
                )?;
                println!();
                pretty_section(&mut w, "Failure Samples")?;
                for failure in out.failures.iter().take(5) {
                    println!("seed {:<8} violations={}", failure.seed, failure.violations.len());
                    for violation in &failure.violations {
                        println!("  - {violation}");
                    }
                }
                if out.failures.len() > 5 {
                    println!("... and {} more failures", out.failures.len() - 5);
                }
                println!();
                pretty_kv(&mut w, "Replay", replay_hint)?;
            }
        }
    }

    Ok(())
}

/// Execute `quill sim replay`.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the simulation
/// cannot run. Exits with status 1 when the oracle reports violations.
pub fn run_sim_replay(
    args: &SimReplayArgs,
    output: OutputMode,
    _project_root: &Path,
) -> Result<()> {
    let config = args
        .session
        .campaign(args.seed..args.seed.saturating_add(1));
    let detailed = replay_seed(args.seed, &config)?;
    let result = &detailed.result;

    let out = ReplayOutput {
        seed: args.seed,
        trace_events: result.trace.len(),
        ledger_events: result.ledger.len(),
        client_last_sequence: result.client_last_sequence,
        unacknowledged: result.unacknowledged,
        offline_windows: result.offline_windows,
        deliveries: result.stats,
        oracle_passed: detailed.oracle.passed,
        violations: detailed
            .oracle
            .violations
            .iter()
            .map(ToString::to_string)
            .collect(),
        interesting_state_reached: result.interesting_state_reached,
        trace: if args.trace {
            result.trace.clone()
        } else {
            Vec::new()
        },
    };

    render_replay(&out, config.steps, output)?;

    if !detailed.oracle.passed {
        process::exit(1);
    }

    Ok(())
}

fn render_replay(out: &ReplayOutput, steps: u64, output: OutputMode) -> Result<()> {
    match output {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(out)?);
        }
        OutputMode::Text => {
            println!("replay seed={} steps={}", out.seed, steps);
            println!(
                "result oracle_passed={} ledger_events={} client_last_sequence={} unacknowledged={} offline_windows={} interesting_state_reached={}",
                out.oracle_passed,
                out.ledger_events,
                out.client_last_sequence.unwrap_or(0),
                out.unacknowledged,
                out.offline_windows,
                out.interesting_state_reached
            );
            let s = &out.deliveries;
            println!(
                "deliveries requests={} delivered={} dropped={} server_errors={} lost_acks={} duplicated={}",
                s.requests, s.delivered, s.dropped, s.server_errors, s.lost_acks, s.duplicated
            );
            for violation in &out.violations {
                println!("violation={violation}");
            }
            for event in &out.trace {
                println!(
                    "trace step={} at_ms={} {}",
                    event.step,
                    event.at_ms,
                    serde_json::to_string(&event.kind)?
                );
            }
        }
        OutputMode::Pretty => {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            pretty_section(&mut w, &format!("Replay Seed {}", out.seed))?;
            pretty_kv(&mut w, "Steps", steps.to_string())?;
            pretty_kv(&mut w, "Trace events", out.trace_events.to_string())?;
            pretty_kv(&mut w, "Ledger", out.ledger_events.to_string())?;
            pretty_kv(
                &mut w,
                "Client last",
                out.client_last_sequence
                    .map_or_else(|| "none".to_string(), |s| s.to_string()),
            )?;
            let s = &out.deliveries;
            pretty_kv(
                &mut w,
                "Requests",
                format!(
                    "{} ({} delivered, {} dropped, {} 5xx, {} lost acks, {} dup)",
                    s.requests, s.delivered, s.dropped, s.server_errors, s.lost_acks, s.duplicated
                ),
            )?;
            pretty_kv(&mut w, "Offline", format!("{} windows", out.offline_windows))?;
            pretty_kv(&mut w, "Interesting", out.interesting_state_reached.to_string())?;
            pretty_kv(&mut w, "Oracle", out.oracle_passed.to_string())?;

            if !out.oracle_passed {
                println!();
                pretty_section(&mut w, "Invariant Violations")?;
                for violation in &out.violations {
                    println!("- {violation}");
                }
            }

            if !out.trace.is_empty() {
                println!();
                pretty_section(&mut w, "Trace")?;
                for event in &out.trace {
                    println!(
                        "{:>5} {:>8}ms  {}",
                        event.step,
                        event.at_ms,
                        serde_json::to_string(&event.kind)?
                    );
                }
            }
        }
    }

    Ok(())
}

/// Dispatch `quill sim` subcommands.
///
/// # Errors
///
/// Propagates the subcommand's error.
pub fn run_sim(args: &SimArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    match &args.command {
        SimCommand::Run(run_args) => run_sim_run(run_args, output, project_root),
        SimCommand::Replay(replay_args) => run_sim_replay(replay_args, output, project_root),
    }
}
