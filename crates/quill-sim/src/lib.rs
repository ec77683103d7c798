//! Deterministic simulation harness for the quill event pipeline.
//!
//! A [`Simulator`] drives the real [`SessionRecorder`] with a scripted
//! student and a manual clock, uploading through a [`FaultyTransport`]
//! into a real in-memory [`EventStore`]. After the session it finishes the
//! attempt and collects everything the [`oracle`] needs.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` for return types.
//! - **Logging**: `tracing` macros; per-step detail at `trace!`.

pub mod campaign;
pub mod client;
pub mod network;
pub mod oracle;
pub mod rng;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use quill_core::{AttemptId, FileMap};
use quill_core::clock::{Clock, ManualClock};
use quill_core::config::{LogLevel, ProjectConfig};
use quill_core::event::{
    AiPromptData, AiResponseData, CursorData, EventBatch, EventPayload, Extra, FileSwitchData,
    PasteData, RunData,
};
use quill_core::metrics::{self, EngagementMetrics};
use quill_core::recorder::SessionRecorder;
use quill_core::replay::Timeline;
use quill_core::store::{
    EventStore, IngestReport, IntegrityReport, LedgerFlag, NewAttempt, SeqRange, StoredEvent,
};
use quill_core::upload::SyncStatus;

use crate::client::{MAIN_FILE, SimulatedStudent, UiAction};
use crate::network::{Delivery, DeliveryStats, FaultConfig, FaultyTransport};
use crate::rng::SimRng;

const CLIENT_STREAM: u64 = 1;
const NETWORK_STREAM: u64 = 2;
const SCHEDULE_STREAM: u64 = 3;

/// Fixed attempt start so metrics are reproducible.
const EPOCH_SECS: i64 = 1_700_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    /// UI actions per session.
    pub steps: u64,
    pub max_batch_size: usize,
    pub log_level: LogLevel,
    pub fault: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            steps: 400,
            max_batch_size: 16,
            log_level: LogLevel::Standard,
            fault: FaultConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error if `steps` or `max_batch_size` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            bail!("steps must be > 0");
        }
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be > 0");
        }
        Ok(())
    }

    fn project_config(&self) -> ProjectConfig {
        let mut config = ProjectConfig::default();
        config.recorder.default_file = MAIN_FILE.to_string();
        config.logging.log_level = self.log_level;
        config.uploader.max_batch_size = self.max_batch_size;
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEventKind {
    Action {
        action: UiAction,
        /// Sequence the recorder assigned, if any.
        sequence: Option<u64>,
    },
    Request(Delivery),
    Connectivity { online: bool },
    Status { status: SyncStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub step: u64,
    pub at_ms: u64,
    pub kind: TraceEventKind,
}

/// Everything observable after one simulated session.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    pub starter: FileMap,
    /// Editor contents at the end of the session.
    pub client_files: FileMap,
    pub client_last_sequence: Option<u64>,
    /// Sequences returned to the UI by the recorder.
    pub handed_out: Vec<u64>,
    pub ring_tail: Vec<u64>,
    pub unacknowledged: usize,
    pub recorded_pastes: usize,
    pub recorded_runs: usize,
    pub ledger: Vec<StoredEvent>,
    pub flags: Vec<LedgerFlag>,
    pub finish_gaps: Vec<SeqRange>,
    pub integrity: IntegrityReport,
    /// Outcome of re-sending the whole ledger after finishing.
    pub redelivery: IngestReport,
    pub metrics: EngagementMetrics,
    pub stats: DeliveryStats,
    pub offline_windows: usize,
    /// Whether the run exercised a recovery path: a lost acknowledgement,
    /// an offline backlog, or degraded sync.
    pub interesting_state_reached: bool,
}

pub struct Simulator {
    config: SimulationConfig,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Run one session to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory store fails.
    pub fn run(&self) -> Result<SimulationResult> {
        let config = &self.config;
        let root = SimRng::new(config.seed);
        let mut schedule = root.fork(SCHEDULE_STREAM);

        let store = EventStore::open_in_memory().context("open simulation store")?;
        let starter = SimulatedStudent::starter();
        let started_at = DateTime::from_timestamp(EPOCH_SECS, 0).unwrap_or_default();
        let attempt = store
            .create_attempt(&NewAttempt {
                assignment_id: Some(format!("sim-{}", config.seed)),
                started_at: Some(started_at),
                starter_state: starter.clone(),
            })
            .context("create simulation attempt")?;

        let clock = ManualClock::new(0);
        let transport = FaultyTransport::new(&store, config.fault, root.fork(NETWORK_STREAM));
        let mut recorder =
            SessionRecorder::new(attempt.id, &config.project_config(), clock.clone(), transport);
        let mut student = SimulatedStudent::new(&starter, root.fork(CLIENT_STREAM));

        let mut run = RunState::default();
        recorder.start_logging();

        for step in 0..config.steps {
            run.step = step;
            run.step_connectivity(&mut recorder, &clock, &mut schedule, config.fault);

            let action = student.next_action(recorder.is_active());
            let sequence = apply(&action, &mut recorder, &clock, &mut run, student.active_file());
            run.handed_out.extend(sequence);
            run.push(&clock, TraceEventKind::Action { action, sequence });
            run.after_step(&mut recorder, &clock);
        }

        // Final drain: the network heals and the session ends normally.
        recorder.transport_mut().calm();
        if !recorder.uploader().is_online() {
            recorder.set_online(true);
            run.push(&clock, TraceEventKind::Connectivity { online: true });
        }
        let stop = recorder.stop_logging();
        run.after_step(&mut recorder, &clock);
        debug!(seed = config.seed, last = ?stop.last_sequence, status = %stop.status, "session stopped");

        let session = Session {
            attempt_id: attempt.id,
            started_at,
            starter,
            stats: recorder.transport().stats(),
            client_files: student.files().clone(),
            client_last_sequence: recorder.last_sequence(),
            ring_tail: recorder.ring().iter().map(|e| e.sequence).collect(),
            unacknowledged: stop.unacknowledged,
            elapsed_ms: clock.now_ms(),
        };
        self.settle(&store, session, run)
    }

    /// Finish the attempt, resend the ledger and gather the observations.
    fn settle(&self, store: &EventStore, session: Session, run: RunState) -> Result<SimulationResult> {
        let attempt_id = session.attempt_id;
        let stats = session.stats;
        let elapsed_ms = i64::try_from(session.elapsed_ms).unwrap_or(i64::MAX);
        let finished_at = session.started_at + Duration::milliseconds(elapsed_ms);
        let finish = store
            .finish_attempt(attempt_id, Some(&session.client_files), Some(finished_at))
            .context("finish simulation attempt")?;

        let ledger = store.ledger(attempt_id).context("read ledger")?;
        let redelivery = store
            .ingest(&EventBatch {
                attempt_id,
                events: ledger.iter().map(|e| e.wire.clone()).collect(),
            })
            .context("redeliver ledger")?;
        let integrity = store
            .check_integrity(attempt_id, MAIN_FILE)
            .context("integrity check")?;
        let flags = store.flags(attempt_id).context("read flags")?;
        let metrics = metrics::compute(
            &Timeline::from_stored(&ledger),
            &finish.attempt,
            finished_at,
            &self.config.project_config().metrics,
        );

        let interesting_state_reached =
            stats.lost_acks > 0 || run.offline_backlog_flushed || run.degraded_seen;

        Ok(SimulationResult {
            seed: self.config.seed,
            trace: run.trace,
            starter: session.starter,
            client_files: session.client_files,
            client_last_sequence: session.client_last_sequence,
            handed_out: run.handed_out,
            ring_tail: session.ring_tail,
            unacknowledged: session.unacknowledged,
            recorded_pastes: run.recorded_pastes,
            recorded_runs: run.recorded_runs,
            ledger,
            flags,
            finish_gaps: finish.gaps,
            integrity,
            redelivery,
            metrics,
            stats,
            offline_windows: run.offline_windows,
            interesting_state_reached,
        })
    }
}

/// Client-side state captured when the session stops.
struct Session {
    attempt_id: AttemptId,
    started_at: DateTime<Utc>,
    starter: FileMap,
    stats: DeliveryStats,
    client_files: FileMap,
    client_last_sequence: Option<u64>,
    ring_tail: Vec<u64>,
    unacknowledged: usize,
    elapsed_ms: u64,
}

type SimRecorder<'a> = SessionRecorder<ManualClock, FaultyTransport<'a>>;

#[derive(Debug, Default)]
struct RunState {
    step: u64,
    trace: Vec<TraceEvent>,
    handed_out: Vec<u64>,
    recorded_pastes: usize,
    recorded_runs: usize,
    offline_steps_left: u64,
    offline_windows: usize,
    offline_backlog_flushed: bool,
    degraded_seen: bool,
    last_status: Option<SyncStatus>,
}

impl RunState {
    fn push(&mut self, clock: &ManualClock, kind: TraceEventKind) {
        self.trace.push(TraceEvent {
            step: self.step,
            at_ms: clock.now_ms(),
            kind,
        });
    }

    /// Open or close offline windows.
    fn step_connectivity(
        &mut self,
        recorder: &mut SimRecorder<'_>,
        clock: &ManualClock,
        schedule: &mut SimRng,
        fault: FaultConfig,
    ) {
        if self.offline_steps_left > 0 {
            self.offline_steps_left -= 1;
            if self.offline_steps_left == 0 {
                let backlog = recorder.uploader().offline_len();
                let flush = recorder.set_online(true);
                if backlog > 0 && flush.events_sent > 0 {
                    self.offline_backlog_flushed = true;
                }
                self.push(clock, TraceEventKind::Connectivity { online: true });
            }
            return;
        }
        if fault.offline_duration_steps > 0 && schedule.chance(fault.offline_rate_percent) {
            self.offline_steps_left = u64::from(fault.offline_duration_steps);
            self.offline_windows += 1;
            recorder.set_online(false);
            self.push(clock, TraceEventKind::Connectivity { online: false });
        }
    }

    fn after_step(&mut self, recorder: &mut SimRecorder<'_>, clock: &ManualClock) {
        for delivery in recorder.transport_mut().take_log() {
            self.push(clock, TraceEventKind::Request(delivery));
        }
        let status = recorder.status();
        if self.last_status != Some(status) {
            self.degraded_seen |= status == SyncStatus::Degraded;
            self.last_status = Some(status);
            self.push(clock, TraceEventKind::Status { status });
        }
    }
}

/// Feed one UI action to the recorder. Returns the sequence it assigned.
fn apply(
    action: &UiAction,
    recorder: &mut SimRecorder<'_>,
    clock: &ManualClock,
    run: &mut RunState,
    active_file: &str,
) -> Option<u64> {
    let file = Some(active_file.to_string());
    match action {
        UiAction::Type {
            file,
            previous,
            next,
        } => recorder.content_changed(Some(file.clone()), previous.clone(), next.clone()),
        UiAction::Paste { size } => {
            let seq = recorder.record(
                EventPayload::Paste(PasteData {
                    size: *size,
                    text: None,
                    extra: Extra::new(),
                }),
                file,
            );
            run.recorded_pastes += usize::from(seq.is_some());
            seq
        }
        UiAction::Cursor { line, column } => recorder.record(
            EventPayload::Cursor(CursorData {
                line: *line,
                column: *column,
                selection_length: None,
                extra: Extra::new(),
            }),
            file,
        ),
        UiAction::SwitchFile { from, to } => recorder.record(
            EventPayload::FileSwitch(FileSwitchData {
                from: Some(from.clone()),
                extra: Extra::new(),
            }),
            Some(to.clone()),
        ),
        UiAction::AiPrompt => recorder.record(
            EventPayload::AiPrompt(AiPromptData {
                prompt: "why does my loop never end?".into(),
                model: None,
                extra: Extra::new(),
            }),
            None,
        ),
        UiAction::AiResponse => recorder.record(
            EventPayload::AiResponse(AiResponseData {
                response: "check the loop condition".into(),
                model: None,
                extra: Extra::new(),
            }),
            None,
        ),
        UiAction::Run => {
            let seq = recorder.request_run(RunData::default(), file);
            run.recorded_runs += usize::from(seq.is_some());
            seq
        }
        UiAction::Wait { ms } => {
            clock.advance(*ms);
            None
        }
        UiAction::Tick => recorder.tick().edit,
        UiAction::TabHidden => {
            recorder.visibility_hidden();
            None
        }
        UiAction::Unload => {
            let beaconed = recorder.before_unload();
            trace!(beaconed, "unload beacon");
            None
        }
        UiAction::StopLogging => {
            recorder.stop_logging();
            None
        }
        UiAction::StartLogging => {
            recorder.start_logging();
            None
        }
    }
}
