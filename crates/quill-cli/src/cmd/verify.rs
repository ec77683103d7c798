use std::path::Path;

use anyhow::Result;
use clap::Args;
use quill_core::AttemptId;
use quill_core::error::ErrorCode;
use quill_core::replay::FinalStateCheck;
use quill_core::store::IntegrityReport;

use super::{load_config, open_store, store_failure};
use crate::output::OutputMode;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Attempt to check. Every attempt when omitted.
    pub id: Option<AttemptId>,
}

fn problems(report: &IntegrityReport) -> Vec<String> {
    let mut out = Vec::new();
    if !report.gaps.is_empty() {
        let gaps: Vec<String> = report.gaps.iter().map(ToString::to_string).collect();
        out.push(format!("{} gaps {}", ErrorCode::SequenceGap, gaps.join(",")));
    }
    if !report.collisions.is_empty() {
        out.push(format!(
            "{} collisions {:?}",
            ErrorCode::SequenceCollision,
            report.collisions
        ));
    }
    if let FinalStateCheck::Mismatch { files } = &report.final_state {
        out.push(format!(
            "{} final state differs in {}",
            ErrorCode::FinalStateMismatch,
            files.join(",")
        ));
    }
    out
}

/// Run integrity checks: gap scan, collision flags, quarantined events and
/// final-state verification by full replay.
///
/// # Errors
///
/// Returns an error when any checked attempt is not clean.
pub fn run_verify(args: &VerifyArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let config = load_config(project_root, output)?;
    let store = open_store(project_root, output)?;
    let ids: Vec<AttemptId> = match args.id {
        Some(id) => vec![id],
        None => store
            .list_attempts(None)
            .map_err(|err| store_failure(output, &err))?
            .iter()
            .map(|a| a.id)
            .collect(),
    };

    let mut reports = Vec::with_capacity(ids.len());
    for id in ids {
        let report = store
            .check_integrity(id, &config.recorder.default_file)
            .map_err(|err| store_failure(output, &err))?;
        reports.push(report);
    }
    let clean = reports.iter().all(IntegrityReport::is_clean);

    if output.is_json() {
        let value = serde_json::json!({ "clean": clean, "attempts": reports });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for report in &reports {
            let found = problems(report);
            if found.is_empty() {
                println!(
                    "OK   attempt {} ({} events)",
                    report.attempt_id, report.event_count
                );
            } else {
                println!("FAIL attempt {} ({})", report.attempt_id, found.join("; "));
            }
            if !report.quarantined.is_empty() {
                println!(
                    "     {} quarantined: {:?}",
                    report.quarantined.len(),
                    report.quarantined
                );
            }
        }
    }

    if clean {
        if !output.is_json() {
            println!("verify: success");
        }
        Ok(())
    } else {
        anyhow::bail!("verify: failed");
    }
}
