use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use quill_core::AttemptId;
use quill_core::metrics::{self, EngagementMetrics};
use quill_core::replay::Timeline;
use serde::Serialize;

use super::{human_secs, load_config, open_store, store_failure};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct MetricsArgs {
    pub id: AttemptId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsOutput {
    attempt_id: AttemptId,
    finished: bool,
    #[serde(flatten)]
    metrics: EngagementMetrics,
}

/// Execute `quill metrics <id>`: engagement signals derived from the ledger.
///
/// # Errors
///
/// Returns an error if the attempt does not exist or the store read fails.
pub fn run_metrics(args: &MetricsArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let config = load_config(project_root, output)?;
    let store = open_store(project_root, output)?;
    let attempt = store
        .attempt(args.id)
        .map_err(|err| store_failure(output, &err))?;
    let ledger = store
        .ledger(args.id)
        .map_err(|err| store_failure(output, &err))?;
    let timeline = Timeline::from_stored(&ledger);

    let out = MetricsOutput {
        attempt_id: attempt.id,
        finished: attempt.is_finished(),
        metrics: metrics::compute(&timeline, &attempt, Utc::now(), &config.metrics),
    };

    render_mode(
        output,
        &out,
        |o, w| {
            let m = &o.metrics;
            writeln!(w, "attempt={} finished={}", o.attempt_id, o.finished)?;
            writeln!(w, "active_typing_time={:.3}", m.active_typing_time)?;
            writeln!(w, "session_length={:.3}", m.session_length)?;
            writeln!(w, "paste_count={}", m.paste_count)?;
            writeln!(w, "large_paste_count={}", m.large_paste_count)?;
            writeln!(w, "avg_paste_size={:.1}", m.avg_paste_size)?;
            writeln!(w, "ai_interaction_count={}", m.ai_interaction_count)?;
            writeln!(w, "run_count={}", m.run_count)?;
            writeln!(w, "event_count={}", m.event_count)?;
            writeln!(w, "unparsable_count={}", m.unparsable_count)
        },
        |o, w| {
            let m = &o.metrics;
            let state = if o.finished { "finished" } else { "open" };
            pretty_section(w, &format!("Attempt #{} engagement ({state})", o.attempt_id))?;
            pretty_kv(w, "Session", human_secs(m.session_length))?;
            pretty_kv(w, "Typing", human_secs(m.active_typing_time))?;
            pretty_kv(
                w,
                "Pastes",
                format!(
                    "{} ({} large, avg {:.0} chars)",
                    m.paste_count, m.large_paste_count, m.avg_paste_size
                ),
            )?;
            pretty_kv(w, "AI exchanges", m.ai_interaction_count.to_string())?;
            pretty_kv(w, "Runs", m.run_count.to_string())?;
            pretty_kv(
                w,
                "Events",
                format!("{} ({} unparsable)", m.event_count, m.unparsable_count),
            )
        },
    )
}
