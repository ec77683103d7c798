use proptest::prelude::*;
use quill_core::config::LogLevel;
use quill_sim::campaign::{CampaignConfig, replay_seed};
use quill_sim::network::FaultConfig;
use quill_sim::oracle::LedgerOracle;
use quill_sim::rng::SimRng;
use quill_sim::{SimulationConfig, Simulator};

fn arb_fault() -> impl Strategy<Value = FaultConfig> {
    (0u8..=40, 0u8..=30, 0u8..=30, 0u8..=30, 0u8..=8, 1u16..=40, 0u8..=100).prop_map(
        |(drop, server, lost, dup, offline, duration, beacon)| FaultConfig {
            drop_rate_percent: drop,
            server_error_rate_percent: server,
            lost_ack_rate_percent: lost,
            duplicate_rate_percent: dup,
            offline_rate_percent: offline,
            offline_duration_steps: duration,
            beacon_drop_rate_percent: beacon,
        },
    )
}

fn arb_level() -> impl Strategy<Value = LogLevel> {
    prop_oneof![
        Just(LogLevel::Verbose),
        Just(LogLevel::Standard),
        Just(LogLevel::Minimal)
    ]
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(48))]

    /// Every recoverable fault mix ends with a complete, flag-free ledger
    /// that replays to the editor contents.
    #[test]
    fn any_fault_mix_preserves_the_ledger(
        seed in any::<u64>(),
        fault in arb_fault(),
        level in arb_level(),
        batch in 1usize..40,
    ) {
        let sim = Simulator::new(SimulationConfig {
            seed,
            steps: 150,
            max_batch_size: batch,
            log_level: level,
            fault,
        }).expect("config");
        let result = sim.run().expect("run");
        let verdict = LedgerOracle::check_all(&result, &mut SimRng::new(seed));
        let violations: Vec<String> = verdict.violations.iter().map(ToString::to_string).collect();
        prop_assert!(verdict.passed, "seed {seed}: {violations:?}");
    }
}

#[test]
fn minimal_level_records_no_cursor_events() {
    let config = CampaignConfig {
        log_level: LogLevel::Minimal,
        ..CampaignConfig::default()
    };
    let trace = replay_seed(21, &config).expect("replay");
    assert!(trace.oracle.passed, "{:?}", trace.oracle.violations);
    assert!(trace.result.ledger.iter().all(|e| e.wire.kind != "cursor"));
}

#[test]
fn offline_windows_are_exercised() {
    let config = CampaignConfig {
        fault: FaultConfig {
            offline_rate_percent: 10,
            offline_duration_steps: 20,
            ..FaultConfig::none()
        },
        ..CampaignConfig::default()
    };
    let trace = replay_seed(4, &config).expect("replay");
    assert!(trace.oracle.passed, "{:?}", trace.oracle.violations);
    assert!(trace.result.offline_windows > 0);
}
