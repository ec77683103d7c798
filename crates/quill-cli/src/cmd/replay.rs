//! `quill replay` — reconstruct editor state from the ledger.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use clap::Args;
use quill_core::event::summary;
use quill_core::replay::{
    ReplaySnapshot, Timeline, TimelineEntry, reconstruct_at_sequence, reconstruct_at_step,
};
use quill_core::{AttemptId, FileMap};
use serde::Serialize;

use super::{load_config, open_store, store_failure};
use crate::output::{CliError, OutputMode, fail, pretty_kv, pretty_rule, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct ReplayArgs {
    pub id: AttemptId,

    /// State after this sequence number.
    #[arg(long, conflicts_with = "step")]
    pub seq: Option<u64>,

    /// State at this (0-based) meaningful step; no-op edits are skipped.
    #[arg(long)]
    pub step: Option<usize>,

    /// List the meaningful steps instead of reconstructing files.
    #[arg(long, conflicts_with_all = ["seq", "step"])]
    pub steps: bool,
}

#[derive(Debug, Serialize)]
struct SnapshotOutput {
    attempt_id: AttemptId,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<usize>,
    #[serde(flatten)]
    snapshot: ReplaySnapshot,
}

#[derive(Debug, Serialize)]
struct StepRow {
    step: usize,
    sequence: u64,
    relative_time: f64,
    kind: String,
    file_path: Option<String>,
    summary: String,
}

impl StepRow {
    fn new(step: usize, entry: &TimelineEntry) -> Self {
        Self {
            step,
            sequence: entry.sequence,
            relative_time: entry.relative_time,
            kind: entry.kind.clone(),
            file_path: entry.file_path.clone(),
            summary: entry
                .payload()
                .map_or_else(|| "[unparsable]".to_string(), summary),
        }
    }
}

/// Execute `quill replay <id>`.
///
/// # Errors
///
/// Returns an error if the attempt does not exist, the requested position
/// is past the end of the ledger, or output rendering fails.
pub fn run_replay(args: &ReplayArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let config = load_config(project_root, output)?;
    let default_file = config.recorder.default_file.as_str();
    let store = open_store(project_root, output)?;
    let attempt = store
        .attempt(args.id)
        .map_err(|err| store_failure(output, &err))?;
    let ledger = store
        .ledger(args.id)
        .map_err(|err| store_failure(output, &err))?;
    let timeline = Timeline::from_stored(&ledger);

    if args.steps {
        return render_steps(&timeline, default_file, output);
    }

    let snapshot = match (args.seq, args.step) {
        (Some(seq), _) => reconstruct_at_sequence(&timeline, &attempt.starter_state, default_file, seq),
        (None, Some(step)) => reconstruct_at_step(&timeline, &attempt.starter_state, default_file, step),
        (None, None) => {
            let last = timeline.last_sequence().unwrap_or(0);
            reconstruct_at_sequence(&timeline, &attempt.starter_state, default_file, last)
        }
    }
    .map_err(|err| fail(output, &CliError::coded(err.code(), err.to_string())))?;

    let out = SnapshotOutput {
        attempt_id: args.id,
        step: args.step,
        snapshot,
    };
    render_mode(
        output,
        &out,
        |o, w| {
            writeln!(w, "at_sequence={}", position(o.snapshot.at_sequence))?;
            for (name, content) in &o.snapshot.files {
                writeln!(w, "file={name} bytes={}", content.len())?;
            }
            Ok(())
        },
        |o, w| {
            pretty_section(w, &format!("Attempt #{} replay", o.attempt_id))?;
            pretty_kv(w, "Position", position(o.snapshot.at_sequence))?;
            if let Some(entry) = &o.snapshot.event {
                pretty_kv(w, "Event", format!("{} at {:.3}s", entry.kind, entry.relative_time))?;
            }
            write_files(w, &o.snapshot.files)
        },
    )
}

fn position(at: Option<u64>) -> String {
    at.map_or_else(|| "start".to_string(), |seq| format!("seq {seq}"))
}

fn write_files(w: &mut dyn Write, files: &FileMap) -> std::io::Result<()> {
    for (name, content) in files {
        writeln!(w)?;
        writeln!(w, "── {name}")?;
        pretty_rule(w)?;
        write!(w, "{content}")?;
        if !content.is_empty() && !content.ends_with('\n') {
            writeln!(w)?;
        }
    }
    Ok(())
}

fn render_steps(timeline: &Timeline, default_file: &str, output: OutputMode) -> Result<()> {
    let meaningful = timeline.meaningful_sequences(default_file);
    let entries = timeline.entries();
    let rows: Vec<StepRow> = meaningful
        .iter()
        .enumerate()
        .filter_map(|(step, seq)| {
            let index = entries.binary_search_by_key(seq, |e| e.sequence).ok()?;
            Some(StepRow::new(step, &entries[index]))
        })
        .collect();

    render_mode(
        output,
        &rows,
        |rows, w| {
            for row in rows {
                writeln!(
                    w,
                    "{}\t{}\t{:.3}\t{}\t{}",
                    row.step, row.sequence, row.relative_time, row.kind, row.summary
                )?;
            }
            Ok(())
        },
        |rows, w| {
            pretty_section(w, &format!("{} meaningful steps", rows.len()))?;
            for row in rows {
                writeln!(
                    w,
                    "{:>5}  #{:<6} {:>9.3}s  {:<20} {}",
                    row.step, row.sequence, row.relative_time, row.kind, row.summary
                )?;
            }
            Ok(())
        },
    )
}
