#![forbid(unsafe_code)]

use anyhow::{Result, bail};
use quill_sim::campaign::{CampaignConfig, run_campaign};

fn main() -> Result<()> {
    let report = run_campaign(&CampaignConfig::default())?;

    println!(
        "simulation complete: seeds={} passed={} interesting={} events={}",
        report.seeds_run,
        report.seeds_passed,
        report.interesting_states_reached,
        report.events_stored
    );
    for failure in &report.failures {
        println!("seed {}:", failure.seed);
        for violation in &failure.violations {
            println!("  {violation}");
        }
    }

    if let Some(seed) = report.first_failure {
        bail!("campaign failed; replay seed {seed} first");
    }
    Ok(())
}
