use std::io::{self, Write};
use std::path::Path;

use anyhow::Result;
use clap::Args;
use quill_core::AttemptId;
use quill_core::event::summary;
use quill_core::store::StoredEvent;

use super::{open_store, store_failure};
use crate::output::{OutputMode, Renderable, render_list};

#[derive(Args, Debug)]
pub struct EventsArgs {
    /// Attempt whose ledger to list.
    pub id: AttemptId,

    /// Only events with a sequence greater than this.
    #[arg(long)]
    pub after: Option<u64>,

    /// Maximum number of events.
    #[arg(long)]
    pub limit: Option<usize>,
}

/// Ledger row with a decoded one-line description.
struct EventRow {
    event: StoredEvent,
    description: String,
}

impl EventRow {
    fn new(event: StoredEvent) -> Self {
        let description = match (&event.quarantine_reason, event.decode()) {
            (Some(reason), _) => format!("[quarantined] {reason}"),
            (None, Ok(decoded)) => summary(&decoded.payload),
            (None, Err(err)) => format!("[unparsable] {err}"),
        };
        Self { event, description }
    }
}

impl Renderable for EventRow {
    fn render_human(&self, w: &mut dyn Write) -> io::Result<()> {
        let wire = &self.event.wire;
        writeln!(
            w,
            "#{:<6} {:>9.3}s  {:<20} {:<12} {}",
            wire.seq,
            wire.t,
            wire.kind,
            wire.file_path.as_deref().unwrap_or("-"),
            self.description
        )
    }

    fn render_json(&self, w: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer(&mut *w, &self.event).map_err(io::Error::other)?;
        writeln!(w)
    }

    fn render_table(&self, w: &mut dyn Write) -> io::Result<()> {
        let wire = &self.event.wire;
        writeln!(
            w,
            "{}\t{:.3}\t{}\t{}\t{}",
            wire.seq,
            wire.t,
            wire.kind,
            wire.file_path.as_deref().unwrap_or("-"),
            self.description
        )
    }

    fn table_headers() -> &'static [&'static str] {
        &["SEQ", "T", "TYPE", "FILE", "SUMMARY"]
    }
}

/// Execute `quill events <id>`: the stored ledger in sequence order.
///
/// # Errors
///
/// Returns an error if the attempt does not exist or the store read fails.
pub fn run_events(args: &EventsArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let store = open_store(project_root, output)?;
    store
        .attempt(args.id)
        .map_err(|err| store_failure(output, &err))?;
    let ledger = store
        .ledger_page(args.id, args.after, args.limit)
        .map_err(|err| store_failure(output, &err))?;

    let rows: Vec<EventRow> = ledger.into_iter().map(EventRow::new).collect();
    if rows.is_empty() && !output.is_json() {
        println!("no events");
        return Ok(());
    }
    render_list(&rows, output)?;
    Ok(())
}
