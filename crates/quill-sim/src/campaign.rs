//! Seed campaigns: run many simulated sessions and collect failures.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use quill_core::config::LogLevel;

use crate::network::FaultConfig;
use crate::oracle::{InvariantViolation, LedgerOracle, OracleResult};
use crate::rng::SimRng;
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Salt for the oracle's shuffle stream, so it never aliases a run stream.
const ORACLE_STREAM: u64 = 0xDEAD_BEEF;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub seed_range: Range<u64>,
    pub steps: u64,
    pub max_batch_size: usize,
    pub log_level: LogLevel,
    pub fault: FaultConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            seed_range: 0..100,
            steps: 400,
            max_batch_size: 16,
            log_level: LogLevel::Standard,
            fault: FaultConfig::default(),
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            steps: self.steps,
            max_batch_size: self.max_batch_size,
            log_level: self.log_level,
            fault: self.fault,
        }
    }

    /// # Errors
    ///
    /// Returns an error for an empty seed range or an invalid per-seed
    /// configuration.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        self.sim_config_for_seed(self.seed_range.start).validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// Lowest failing seed, to replay first.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    pub interesting_states_reached: usize,
    /// Events stored across all seeds.
    pub events_stored: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A single seed's run with its oracle verdict.
#[derive(Debug, Clone)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// Run every seed in the campaign.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or a simulation hits an
/// internal error. Invariant violations are reported, not returned as errors.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
        events_stored: 0,
    };

    for seed in config.seed_range.clone() {
        let trace = replay_seed(seed, config)?;
        report.seeds_run += 1;
        report.events_stored += trace.result.ledger.len();
        if trace.result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }

        if trace.oracle.passed {
            report.seeds_passed += 1;
        } else {
            warn!(seed, violations = trace.oracle.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: trace
                    .oracle
                    .violations
                    .iter()
                    .map(InvariantViolation::to_string)
                    .collect(),
            });
        }
    }

    info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        interesting = report.interesting_states_reached,
        "campaign finished"
    );
    Ok(report)
}

/// Run one seed. The inner result is `Err` with the violations on failure.
///
/// # Errors
///
/// Returns an error if the simulation itself fails.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let trace = replay_seed(seed, config)?;
    if trace.oracle.passed {
        Ok(Ok(()))
    } else {
        Ok(Err(trace.oracle.violations))
    }
}

/// Run one seed and keep the full trace for debugging.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    let result = Simulator::new(config.sim_config_for_seed(seed))?.run()?;
    let mut oracle_rng = SimRng::new(seed).fork(ORACLE_STREAM);
    let oracle = LedgerOracle::check_all(&result, &mut oracle_rng);
    Ok(DetailedTrace { result, oracle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CampaignConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_seed_range_rejected() {
        let config = CampaignConfig {
            seed_range: 5..5,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_steps_rejected() {
        let config = CampaignConfig {
            steps: 0,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sim_config_carries_seed_and_faults() {
        let config = CampaignConfig::default();
        let sim = config.sim_config_for_seed(42);
        assert_eq!(sim.seed, 42);
        assert_eq!(sim.steps, config.steps);
        assert_eq!(sim.fault, config.fault);
    }

    #[test]
    fn faulty_seeds_still_pass() {
        let config = CampaignConfig {
            seed_range: 0..10,
            steps: 250,
            ..CampaignConfig::default()
        };
        let report = run_campaign(&config).expect("campaign");
        assert_eq!(report.seeds_run, 10);
        assert!(
            report.all_passed(),
            "failures: {:?}",
            report.failures
        );
        assert!(report.first_failure.is_none());
        assert!(report.events_stored > 0);
    }

    #[test]
    fn harsh_network_reaches_interesting_states() {
        let config = CampaignConfig {
            seed_range: 0..10,
            steps: 300,
            fault: FaultConfig {
                drop_rate_percent: 30,
                server_error_rate_percent: 20,
                lost_ack_rate_percent: 20,
                duplicate_rate_percent: 20,
                offline_rate_percent: 5,
                offline_duration_steps: 30,
                beacon_drop_rate_percent: 50,
            },
            ..CampaignConfig::default()
        };
        let report = run_campaign(&config).expect("campaign");
        assert!(report.all_passed(), "failures: {:?}", report.failures);
        assert!(report.interesting_states_reached > 0);
    }

    #[test]
    fn replay_is_deterministic() {
        let config = CampaignConfig::default();
        let a = replay_seed(7, &config).expect("first");
        let b = replay_seed(7, &config).expect("second");
        assert_eq!(a.result.trace, b.result.trace);
        assert_eq!(a.result.client_files, b.result.client_files);
        assert_eq!(a.result.metrics, b.result.metrics);
        let seqs = |t: &DetailedTrace| -> Vec<u64> {
            t.result.ledger.iter().map(|e| e.sequence()).collect()
        };
        assert_eq!(seqs(&a), seqs(&b));
    }

    #[test]
    fn single_seed_passes() {
        let result = run_single_seed(0, &CampaignConfig::default()).expect("sim");
        assert!(result.is_ok(), "seed 0 failed: {result:?}");
    }

    #[test]
    fn report_serializes_to_json() {
        let report = CampaignReport {
            seeds_run: 3,
            seeds_passed: 2,
            first_failure: Some(1),
            failures: vec![SeedFailure {
                seed: 1,
                violations: vec!["Unacknowledged: 2 events never acknowledged".into()],
            }],
            interesting_states_reached: 1,
            events_stored: 120,
        };
        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains("\"seeds_run\":3"));
        assert!(json.contains("\"first_failure\":1"));
    }
}
