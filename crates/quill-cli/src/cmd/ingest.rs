//! `quill ingest` — store event batches from a file or stdin.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use quill_core::error::ErrorCode;
use quill_core::event::EventBatch;
use quill_core::store::IngestReport;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{open_store, read_input, store_failure};
use crate::output::{CliError, OutputMode, fail, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// JSON batch, array of batches, or one batch per line. `-` reads stdin.
    #[arg(default_value = "-")]
    pub input: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchInput {
    One(EventBatch),
    Many(Vec<EventBatch>),
}

#[derive(Debug, Default, Serialize)]
struct IngestOutput {
    batches: usize,
    #[serde(flatten)]
    totals: IngestReport,
}

impl IngestOutput {
    const fn absorb(&mut self, report: IngestReport) {
        self.batches += 1;
        self.totals.inserted += report.inserted;
        self.totals.duplicates += report.duplicates;
        self.totals.collisions += report.collisions;
        self.totals.quarantined += report.quarantined;
    }
}

/// Parse every accepted input shape into a list of batches.
fn parse_batches(raw: &str) -> Result<Vec<EventBatch>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if let Ok(input) = serde_json::from_str::<BatchInput>(trimmed) {
        return Ok(match input {
            BatchInput::One(batch) => vec![batch],
            BatchInput::Many(batches) => batches,
        });
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<EventBatch>(line)
                .with_context(|| format!("line {}: not an event batch", n + 1))
        })
        .collect()
}

/// Execute `quill ingest`.
///
/// Each batch is stored atomically, as `POST /events` would. A batch that
/// fails aborts the run; earlier batches stay stored.
///
/// # Errors
///
/// Returns an error if the input does not parse, a batch targets a missing
/// attempt, or the store write fails.
pub fn run_ingest(args: &IngestArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let raw = read_input(&args.input)?;
    let batches = parse_batches(&raw).map_err(|err| {
        fail(output, &CliError::coded(ErrorCode::InvalidRequest, format!("{err:#}")))
    })?;
    let store = open_store(project_root, output)?;

    let mut out = IngestOutput::default();
    for batch in &batches {
        let report = store
            .ingest(batch)
            .map_err(|err| store_failure(output, &err))?;
        if report.collisions > 0 {
            warn!(
                attempt_id = batch.attempt_id,
                collisions = report.collisions,
                "batch reused sequence numbers"
            );
        }
        out.absorb(report);
    }

    render_mode(
        output,
        &out,
        |o, w| {
            writeln!(
                w,
                "batches={} inserted={} duplicates={} collisions={} quarantined={}",
                o.batches,
                o.totals.inserted,
                o.totals.duplicates,
                o.totals.collisions,
                o.totals.quarantined
            )
        },
        |o, w| {
            pretty_section(w, "Ingest")?;
            pretty_kv(w, "Batches", o.batches.to_string())?;
            pretty_kv(w, "Inserted", o.totals.inserted.to_string())?;
            pretty_kv(w, "Duplicates", o.totals.duplicates.to_string())?;
            pretty_kv(w, "Quarantined", o.totals.quarantined.to_string())?;
            if o.totals.collisions > 0 {
                pretty_kv(
                    w,
                    "Collisions",
                    format!(
                        "{} ({}: flagged for review)",
                        o.totals.collisions,
                        ErrorCode::SequenceCollision
                    ),
                )?;
            }
            Ok(())
        },
    )
}
