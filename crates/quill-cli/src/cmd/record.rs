//! `quill record` — drive the client recorder from a step script.
//!
//! The script is JSON Lines; blank lines and `#` comments are skipped:
//!
//! ```text
//! {"step": "edit", "code": "print(1)"}
//! {"step": "wait", "ms": 1500}
//! {"step": "event", "type": "paste", "payload": {"size": 120}}
//! {"step": "online", "value": false}
//! {"step": "run"}
//! ```
//!
//! Time is simulated: `wait` advances a manual clock and fires every timer
//! that falls due on the way, so a script replays identically every time.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use quill_core::clock::{Clock, ManualClock};
use quill_core::config::ProjectConfig;
use quill_core::error::ErrorCode;
use quill_core::event::{EventKind, EventPayload, RunData};
use quill_core::recorder::{SessionRecorder, StopReport};
use quill_core::store::{Attempt, EventStore, NewAttempt};
use quill_core::upload::{HttpTransport, StoreTransport, Transport};
use quill_core::{AttemptId, FileMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{load_config, open_store, read_input, store_failure};
use crate::output::{CliError, OutputMode, fail, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// Step script (JSON Lines), or `-` for stdin.
    pub script: PathBuf,

    /// Record into this attempt. Its ledger must be empty. A new attempt
    /// is created when omitted.
    #[arg(long)]
    pub attempt: Option<AttemptId>,

    /// Assignment for a newly created attempt.
    #[arg(long, conflicts_with = "attempt")]
    pub assignment: Option<String>,

    /// Upload to a running `quill serve` instead of the local store.
    #[arg(long, value_name = "URL")]
    pub server: Option<String>,

    /// Finish the attempt with the editor contents once the script ends.
    #[arg(long)]
    pub finish: bool,
}

/// One scripted editor action.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
enum ScriptStep {
    /// Replace a file's editor contents.
    Edit {
        #[serde(default)]
        file: Option<String>,
        code: String,
    },
    Wait {
        ms: u64,
    },
    /// Any discrete event with a typed payload.
    Event {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default = "empty_payload")]
        payload: serde_json::Value,
        #[serde(default)]
        file: Option<String>,
    },
    Run {
        #[serde(default)]
        file: Option<String>,
    },
    Online {
        value: bool,
    },
    Hidden,
    Unload,
    Start,
    Stop,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn parse_script(raw: &str) -> Result<Vec<ScriptStep>> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("script line {}: invalid step", index + 1))
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct RecordOutput {
    attempt_id: AttemptId,
    steps: usize,
    finished: bool,
    #[serde(flatten)]
    report: StopReport,
}

/// Where recorded events go.
enum Target {
    Local(EventStore),
    Remote { base: String },
}

/// Execute `quill record <script>`.
///
/// # Errors
///
/// Returns an error if the script is malformed, the attempt already has
/// events, or the target store/server cannot be reached.
pub fn run_record(args: &RecordArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let config = load_config(project_root, output)?;
    let steps = parse_script(&read_input(&args.script)?)
        .map_err(|err| fail(output, &CliError::coded(ErrorCode::InvalidRequest, format!("{err:#}"))))?;

    let target = match &args.server {
        Some(base) => Target::Remote {
            base: base.trim_end_matches('/').to_string(),
        },
        None => Target::Local(open_store(project_root, output)?),
    };
    let attempt = prepare_attempt(&target, args, output)?;
    let mut editor = attempt.starter_state.clone();
    info!(attempt_id = attempt.id, steps = steps.len(), "recording script");

    let report = match &target {
        Target::Local(store) => play(
            attempt.id,
            &config,
            StoreTransport::new(store),
            &steps,
            &mut editor,
        )?,
        Target::Remote { base } => play(
            attempt.id,
            &config,
            HttpTransport::new(base),
            &steps,
            &mut editor,
        )?,
    };

    if args.finish {
        finish(&target, attempt.id, &editor, output)?;
    }

    let out = RecordOutput {
        attempt_id: attempt.id,
        steps: steps.len(),
        finished: args.finish,
        report,
    };
    render_mode(
        output,
        &out,
        |o, w| {
            writeln!(
                w,
                "record attempt={} steps={} last_sequence={}",
                o.attempt_id,
                o.steps,
                o.report.last_sequence.map_or_else(|| "-".into(), |s| s.to_string())
            )?;
            writeln!(
                w,
                "sync status={} unacknowledged={} finished={}",
                o.report.status, o.report.unacknowledged, o.finished
            )
        },
        |o, w| {
            pretty_section(w, &format!("Recorded attempt #{}", o.attempt_id))?;
            pretty_kv(w, "Steps", o.steps.to_string())?;
            pretty_kv(
                w,
                "Last seq",
                o.report.last_sequence.map_or_else(|| "none".into(), |s| s.to_string()),
            )?;
            pretty_kv(w, "Sync", o.report.status.to_string())?;
            if o.report.unacknowledged > 0 {
                pretty_kv(w, "Unacked", o.report.unacknowledged.to_string())?;
            }
            if o.finished {
                pretty_kv(w, "Finished", "yes")?;
            }
            Ok(())
        },
    )
}

fn remote_failure(output: OutputMode, err: &impl std::fmt::Display) -> anyhow::Error {
    fail(output, &CliError::coded(ErrorCode::UploadFailed, err.to_string()))
}

fn not_empty(output: OutputMode, id: AttemptId, count: usize) -> anyhow::Error {
    fail(
        output,
        &CliError::coded(
            ErrorCode::InvalidRequest,
            format!("attempt {id} already has {count} events"),
        )
        .with_suggestion("Record into a fresh attempt: omit --attempt to create one"),
    )
}

/// Find or create the attempt, refusing one whose ledger is not empty.
fn prepare_attempt(target: &Target, args: &RecordArgs, output: OutputMode) -> Result<Attempt> {
    match (target, args.attempt) {
        (Target::Local(store), Some(id)) => {
            let attempt = store.attempt(id).map_err(|err| store_failure(output, &err))?;
            let count = store.event_count(id).map_err(|err| store_failure(output, &err))?;
            if count > 0 {
                return Err(not_empty(output, id, count));
            }
            Ok(attempt)
        }
        (Target::Local(store), None) => store
            .create_attempt(&NewAttempt {
                assignment_id: args.assignment.clone(),
                ..NewAttempt::default()
            })
            .map_err(|err| store_failure(output, &err)),
        (Target::Remote { base }, Some(id)) => {
            #[derive(Deserialize)]
            struct ReplayBody {
                attempt: Attempt,
                events: Vec<serde_json::Value>,
            }
            let body: ReplayBody = ureq::get(&format!("{base}/replay/{id}"))
                .call()
                .map_err(|err| remote_failure(output, &err))?
                .into_json()
                .map_err(|err| remote_failure(output, &err))?;
            if !body.events.is_empty() {
                return Err(not_empty(output, id, body.events.len()));
            }
            Ok(body.attempt)
        }
        (Target::Remote { base }, None) => ureq::post(&format!("{base}/attempts"))
            .send_json(serde_json::json!({ "assignment_id": args.assignment }))
            .map_err(|err| remote_failure(output, &err))?
            .into_json()
            .map_err(|err| remote_failure(output, &err)),
    }
}

fn finish(target: &Target, id: AttemptId, editor: &FileMap, output: OutputMode) -> Result<()> {
    match target {
        Target::Local(store) => {
            store
                .finish_attempt(id, Some(editor), None)
                .map_err(|err| store_failure(output, &err))?;
        }
        Target::Remote { base } => {
            ureq::post(&format!("{base}/attempts/{id}/finish"))
                .send_json(serde_json::json!({ "final_state": editor }))
                .map_err(|err| remote_failure(output, &err))?;
        }
    }
    Ok(())
}

/// Run the script through a fresh recorder, returning its stop report.
fn play<T: Transport>(
    attempt_id: AttemptId,
    config: &ProjectConfig,
    transport: T,
    steps: &[ScriptStep],
    editor: &mut FileMap,
) -> Result<StopReport> {
    let clock = ManualClock::new(0);
    let mut recorder = SessionRecorder::new(attempt_id, config, clock.clone(), transport);
    let default_file = config.recorder.default_file.as_str();
    recorder.start_logging();

    for (index, step) in steps.iter().enumerate() {
        debug!(index, ?step, "script step");
        match step {
            ScriptStep::Edit { file, code } => {
                let key = file.as_deref().unwrap_or(default_file).to_string();
                let previous = editor.insert(key, code.clone()).unwrap_or_default();
                recorder.content_changed(file.clone(), previous, code.clone());
            }
            ScriptStep::Wait { ms } => advance(&mut recorder, &clock, *ms),
            ScriptStep::Event {
                kind,
                payload,
                file,
            } => {
                let kind: EventKind = kind
                    .parse()
                    .with_context(|| format!("script step {}", index + 1))?;
                let payload = EventPayload::deserialize_for(kind, &payload.to_string())
                    .with_context(|| format!("script step {}", index + 1))?;
                recorder.record(payload, file.clone());
            }
            ScriptStep::Run { file } => {
                let key = file.as_deref().unwrap_or(default_file);
                let run = RunData {
                    code: editor.get(key).cloned(),
                    ..RunData::default()
                };
                recorder.request_run(run, file.clone());
            }
            ScriptStep::Online { value } => {
                recorder.set_online(*value);
            }
            ScriptStep::Hidden => {
                recorder.visibility_hidden();
            }
            ScriptStep::Unload => {
                recorder.before_unload();
            }
            ScriptStep::Start => recorder.start_logging(),
            ScriptStep::Stop => {
                recorder.stop_logging();
            }
        }
    }

    // Let a pending debounce close before the final upload.
    if let Some(deadline) = recorder.next_deadline() {
        advance(&mut recorder, &clock, deadline.saturating_sub(clock.now_ms()));
    }
    Ok(recorder.stop_logging())
}

/// Move the clock forward by `ms`, firing timers at their own deadlines.
fn advance<T: Transport>(recorder: &mut SessionRecorder<ManualClock, T>, clock: &ManualClock, ms: u64) {
    let target = clock.now_ms().saturating_add(ms);
    while let Some(deadline) = recorder.next_deadline() {
        if deadline > target {
            break;
        }
        clock.set(deadline);
        recorder.tick();
        if recorder.next_deadline() == Some(deadline) {
            break;
        }
    }
    clock.set(target);
    recorder.tick();
}
