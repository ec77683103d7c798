//! `quill attempt` — attempt lifecycle: create, list, show, save, finish, delete.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Subcommand};
use quill_core::AttemptId;
use quill_core::error::ErrorCode;
use quill_core::store::{Attempt, EventStore, LedgerFlag, NewAttempt, SeqRange, StoreError};
use serde::Serialize;
use tracing::warn;

use super::{local_time, open_store, read_file_map, store_failure};
use crate::output::{
    CliError, OutputMode, Renderable, fail, pretty_kv, pretty_section, render_list, render_mode,
};

#[derive(Args, Debug)]
pub struct AttemptArgs {
    #[command(subcommand)]
    pub command: AttemptCommand,
}

#[derive(Subcommand, Debug)]
pub enum AttemptCommand {
    #[command(
        about = "Start a new attempt",
        after_help = "EXAMPLES:\n    # Attempt with one starter file\n    quill attempt create --assignment hw1 --file main.py=./main.py\n\n    # Starter files from a JSON object\n    quill attempt create --starter starter.json"
    )]
    Create(CreateArgs),

    #[command(
        about = "List attempts",
        after_help = "EXAMPLES:\n    # Every attempt\n    quill attempt list\n\n    # One assignment, machine-readable\n    quill attempt list --assignment hw1 --json"
    )]
    List(ListArgs),

    #[command(
        about = "Show one attempt",
        after_help = "EXAMPLES:\n    quill attempt show 3"
    )]
    Show(IdArg),

    #[command(
        about = "Save the cached final state",
        after_help = "EXAMPLES:\n    quill attempt save 3 --file main.py=./main.py"
    )]
    Save(StateArgs),

    #[command(
        about = "Finish an attempt and scan its ledger for gaps",
        after_help = "EXAMPLES:\n    # Finish, caching the submitted files\n    quill attempt finish 3 --file main.py=./main.py\n\n    # Finish without a snapshot\n    quill attempt finish 3"
    )]
    Finish(StateArgs),

    #[command(
        about = "Delete an attempt with its ledger and flags",
        after_help = "EXAMPLES:\n    quill attempt delete 3"
    )]
    Delete(IdArg),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Assignment this attempt belongs to.
    #[arg(long)]
    pub assignment: Option<String>,

    /// JSON object mapping file names to starter contents.
    #[arg(long, value_name = "JSON")]
    pub starter: Option<PathBuf>,

    /// Starter file as NAME=PATH. Repeatable.
    #[arg(long = "file", value_name = "NAME=PATH")]
    pub files: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only attempts for this assignment.
    #[arg(long)]
    pub assignment: Option<String>,
}

#[derive(Args, Debug)]
pub struct IdArg {
    pub id: AttemptId,
}

#[derive(Args, Debug)]
pub struct StateArgs {
    pub id: AttemptId,

    /// JSON object mapping file names to final contents.
    #[arg(long, value_name = "JSON")]
    pub state: Option<PathBuf>,

    /// Final file as NAME=PATH. Repeatable.
    #[arg(long = "file", value_name = "NAME=PATH")]
    pub files: Vec<String>,
}

impl StateArgs {
    fn has_state(&self) -> bool {
        self.state.is_some() || !self.files.is_empty()
    }
}

/// One row of `quill attempt list`.
#[derive(Debug, Serialize)]
pub struct AttemptRow {
    #[serde(flatten)]
    pub attempt: Attempt,
    pub event_count: usize,
}

impl Renderable for AttemptRow {
    fn render_human(&self, w: &mut dyn Write) -> io::Result<()> {
        let a = &self.attempt;
        writeln!(
            w,
            "#{:<5} {:<12} {:<19} {:>6} events  {}",
            a.id,
            a.assignment_id.as_deref().unwrap_or("-"),
            local_time(a.started_at),
            self.event_count,
            if a.is_finished() { "finished" } else { "open" },
        )
    }

    fn render_json(&self, w: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer(&mut *w, self).map_err(io::Error::other)?;
        writeln!(w)
    }

    fn render_table(&self, w: &mut dyn Write) -> io::Result<()> {
        let a = &self.attempt;
        writeln!(
            w,
            "{}\t{}\t{}\t{}\t{}",
            a.id,
            a.assignment_id.as_deref().unwrap_or("-"),
            a.started_at.to_rfc3339(),
            a.finished_at.map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
            self.event_count,
        )
    }

    fn table_headers() -> &'static [&'static str] {
        &["ID", "ASSIGNMENT", "STARTED", "FINISHED", "EVENTS"]
    }
}

#[derive(Debug, Serialize)]
struct AttemptDetail {
    attempt: Attempt,
    event_count: usize,
    last_sequence: Option<u64>,
    flags: Vec<LedgerFlag>,
}

#[derive(Debug, Serialize)]
struct FinishOutput {
    attempt: Attempt,
    gaps: Vec<SeqRange>,
}

#[derive(Debug, Serialize)]
struct DeleteOutput {
    id: AttemptId,
    deleted: bool,
}

/// Execute `quill attempt <subcommand>`.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, the attempt does not
/// exist, or output rendering fails.
pub fn run_attempt(args: &AttemptArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let store = open_store(project_root, output)?;
    match &args.command {
        AttemptCommand::Create(create) => run_create(&store, create, output),
        AttemptCommand::List(list) => run_list(&store, list, output),
        AttemptCommand::Show(show) => run_show(&store, show.id, output),
        AttemptCommand::Save(save) => run_save(&store, save, output),
        AttemptCommand::Finish(finish) => run_finish(&store, finish, output),
        AttemptCommand::Delete(delete) => run_delete(&store, delete.id, output),
    }
}

fn run_create(store: &EventStore, args: &CreateArgs, output: OutputMode) -> Result<()> {
    let starter_state = read_file_map(args.starter.as_deref(), &args.files)?;
    let attempt = store
        .create_attempt(&NewAttempt {
            assignment_id: args.assignment.clone(),
            started_at: None,
            starter_state,
        })
        .map_err(|err| store_failure(output, &err))?;

    render_mode(
        output,
        &attempt,
        |a, w| writeln!(w, "id={}", a.id),
        |a, w| {
            writeln!(w, "✓ Created attempt #{}", a.id)?;
            writeln!(w, "  Starter files: {}", a.starter_state.len())
        },
    )
}

fn run_list(store: &EventStore, args: &ListArgs, output: OutputMode) -> Result<()> {
    let attempts = store
        .list_attempts(args.assignment.as_deref())
        .map_err(|err| store_failure(output, &err))?;
    let rows = attempts
        .into_iter()
        .map(|attempt| {
            let event_count = store.event_count(attempt.id)?;
            Ok(AttemptRow {
                attempt,
                event_count,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()
        .map_err(|err| store_failure(output, &err))?;

    if rows.is_empty() && !output.is_json() {
        println!("no attempts");
        return Ok(());
    }
    render_list(&rows, output)?;
    Ok(())
}

fn run_show(store: &EventStore, id: AttemptId, output: OutputMode) -> Result<()> {
    let detail = load_detail(store, id).map_err(|err| store_failure(output, &err))?;

    render_mode(
        output,
        &detail,
        |d, w| {
            writeln!(w, "id={}", d.attempt.id)?;
            writeln!(w, "assignment={}", d.attempt.assignment_id.as_deref().unwrap_or("-"))?;
            writeln!(w, "started_at={}", d.attempt.started_at.to_rfc3339())?;
            if let Some(finished) = d.attempt.finished_at {
                writeln!(w, "finished_at={}", finished.to_rfc3339())?;
            }
            writeln!(w, "events={}", d.event_count)?;
            writeln!(w, "flags={}", d.flags.len())
        },
        |d, w| {
            pretty_section(w, &format!("Attempt #{}", d.attempt.id))?;
            pretty_kv(w, "Assignment", d.attempt.assignment_id.as_deref().unwrap_or("-"))?;
            pretty_kv(w, "Started", local_time(d.attempt.started_at))?;
            pretty_kv(
                w,
                "Finished",
                d.attempt.finished_at.map_or_else(|| "open".to_string(), local_time),
            )?;
            pretty_kv(w, "Events", d.event_count.to_string())?;
            pretty_kv(
                w,
                "Last seq",
                d.last_sequence.map_or_else(|| "-".to_string(), |s| s.to_string()),
            )?;
            let files: Vec<&str> = d.attempt.starter_state.keys().map(String::as_str).collect();
            pretty_kv(w, "Starter", files.join(", "))?;
            pretty_kv(
                w,
                "Final state",
                if d.attempt.final_state.is_some() { "cached" } else { "not saved" },
            )?;
            if !d.flags.is_empty() {
                writeln!(w)?;
                pretty_section(w, "Flags (manual review)")?;
                for flag in &d.flags {
                    writeln!(w, "{} seq {}: {}", flag.kind.code(), flag.seq, flag.detail)?;
                }
            }
            Ok(())
        },
    )
}

fn load_detail(store: &EventStore, id: AttemptId) -> Result<AttemptDetail, StoreError> {
    Ok(AttemptDetail {
        attempt: store.attempt(id)?,
        event_count: store.event_count(id)?,
        last_sequence: store.last_sequence(id)?,
        flags: store.flags(id)?,
    })
}

fn run_save(store: &EventStore, args: &StateArgs, output: OutputMode) -> Result<()> {
    if !args.has_state() {
        return Err(fail(
            output,
            &CliError::coded(ErrorCode::InvalidRequest, "no final state given")
                .with_suggestion("pass --file NAME=PATH or --state FILE.json"),
        ));
    }
    let state = read_file_map(args.state.as_deref(), &args.files)?;
    store
        .save_final_state(args.id, &state)
        .map_err(|err| store_failure(output, &err))?;
    let attempt = store.attempt(args.id).map_err(|err| store_failure(output, &err))?;

    render_mode(
        output,
        &attempt,
        |a, w| writeln!(w, "saved id={} files={}", a.id, state.len()),
        |a, w| writeln!(w, "✓ Saved final state of attempt #{} ({} files)", a.id, state.len()),
    )
}

fn run_finish(store: &EventStore, args: &StateArgs, output: OutputMode) -> Result<()> {
    let state = if args.has_state() {
        Some(read_file_map(args.state.as_deref(), &args.files)?)
    } else {
        None
    };
    let report = store
        .finish_attempt(args.id, state.as_ref(), None)
        .map_err(|err| store_failure(output, &err))?;
    if !report.gaps.is_empty() {
        warn!(attempt_id = args.id, gaps = report.gaps.len(), "ledger has gaps");
    }

    let out = FinishOutput {
        attempt: report.attempt,
        gaps: report.gaps,
    };
    render_mode(
        output,
        &out,
        |o, w| {
            writeln!(w, "finished id={} gaps={}", o.attempt.id, o.gaps.len())?;
            for gap in &o.gaps {
                writeln!(w, "gap {gap}")?;
            }
            Ok(())
        },
        |o, w| {
            writeln!(w, "✓ Finished attempt #{}", o.attempt.id)?;
            if !o.gaps.is_empty() {
                let listed: Vec<String> = o.gaps.iter().map(ToString::to_string).collect();
                writeln!(
                    w,
                    "  {}: missing sequences {} (flagged for review)",
                    ErrorCode::SequenceGap,
                    listed.join(", ")
                )?;
            }
            Ok(())
        },
    )
}

fn run_delete(store: &EventStore, id: AttemptId, output: OutputMode) -> Result<()> {
    let deleted = store
        .delete_attempt(id)
        .map_err(|err| store_failure(output, &err))?;
    if !deleted {
        return Err(fail(
            output,
            &CliError::coded(ErrorCode::AttemptNotFound, format!("attempt {id} not found")),
        ));
    }

    render_mode(
        output,
        &DeleteOutput { id, deleted },
        |o, w| writeln!(w, "deleted id={}", o.id),
        |o, w| writeln!(w, "✓ Deleted attempt #{} and its ledger", o.id),
    )
}
