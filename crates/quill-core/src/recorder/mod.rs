//! Client-side session recorder.
//!
//! [`SessionRecorder`] is the single owner of an attempt's capture state:
//! the sequence counter, the inspection ring, the edit coalescer, the
//! uploader queues and the timers that drive them. Every event, including
//! coalesced edits, enters through the same sequencing path, so sequence
//! numbers are unique and equal call order.
//!
//! Nothing runs in the background. The host calls [`SessionRecorder::tick`]
//! whenever the clock may have passed a timer deadline
//! ([`SessionRecorder::next_deadline`] says when).

pub mod coalescer;
pub mod ring;

pub use coalescer::{CoalescedEdit, EditChange, EditCoalescer};
pub use ring::EventRing;

use serde::Serialize;
use tracing::{debug, info};

use crate::AttemptId;
use crate::clock::{Clock, Millis};
use crate::config::{LoggingSettings, ProjectConfig};
use crate::event::{EventKind, Event, EventPayload, FIRST_SEQUENCE, RunData};
use crate::scheduler::{Scheduler, TimerHandle, TimerKind};
use crate::upload::{BatchUploader, FlushReport, SyncStatus, Transport};

/// Returned by [`SessionRecorder::stop_logging`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Highest sequence assigned so far, if any.
    pub last_sequence: Option<u64>,
    pub flush: FlushReport,
    pub status: SyncStatus,
    /// Events still queued after the final upload attempt.
    pub unacknowledged: usize,
}

/// What a [`SessionRecorder::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sequence of an edit emitted by an expired debounce timer.
    pub edit: Option<u64>,
    /// Present if a periodic flush ran.
    pub flush: Option<FlushReport>,
}

pub struct SessionRecorder<C: Clock, T: Transport> {
    attempt_id: AttemptId,
    clock: C,
    transport: T,
    settings: LoggingSettings,
    debounce_ms: Millis,

    active: bool,
    origin_ms: Option<Millis>,
    next_sequence: u64,
    last_cursor_ms: Option<Millis>,

    ring: EventRing,
    coalescer: EditCoalescer,
    uploader: BatchUploader,
    scheduler: Scheduler,
    debounce_timer: Option<TimerHandle>,
    flush_timer: Option<TimerHandle>,
}

impl<C: Clock, T: Transport> SessionRecorder<C, T> {
    #[must_use]
    pub fn new(attempt_id: AttemptId, config: &ProjectConfig, clock: C, transport: T) -> Self {
        Self {
            attempt_id,
            clock,
            transport,
            settings: config.logging.clone(),
            debounce_ms: config.recorder.debounce_ms,
            active: false,
            origin_ms: None,
            next_sequence: FIRST_SEQUENCE,
            last_cursor_ms: None,
            ring: EventRing::new(config.recorder.ring_capacity),
            coalescer: EditCoalescer::new(),
            uploader: BatchUploader::new(attempt_id, config.uploader.clone()),
            scheduler: Scheduler::new(),
            debounce_timer: None,
            flush_timer: None,
        }
    }

    /// Begin capturing. Relative times are measured from the first start.
    pub fn start_logging(&mut self) {
        if self.active {
            return;
        }
        let now = self.clock.now_ms();
        self.active = true;
        self.origin_ms.get_or_insert(now);
        self.arm_flush_timer(now);
        info!(attempt_id = self.attempt_id, "logging started");
    }

    /// Drain the coalescer, attempt a final upload and stop capturing.
    pub fn stop_logging(&mut self) -> StopReport {
        if self.active {
            self.flush_edits();
        }
        let flush = self.uploader.flush(&mut self.transport);
        self.active = false;
        self.scheduler.clear();
        self.debounce_timer = None;
        self.flush_timer = None;

        let report = StopReport {
            last_sequence: self.last_sequence(),
            flush,
            status: self.uploader.status(),
            unacknowledged: self.uploader.queued_len(),
        };
        info!(
            attempt_id = self.attempt_id,
            last_sequence = ?report.last_sequence,
            status = %report.status,
            "logging stopped"
        );
        report
    }

    /// Capture a discrete action.
    ///
    /// Returns the assigned sequence, or `None` if logging is inactive or
    /// the logging settings filter the event out.
    pub fn record(&mut self, payload: EventPayload, file_path: Option<String>) -> Option<u64> {
        if !self.active {
            debug!(kind = %payload.kind(), "logging inactive; action dropped");
            return None;
        }
        let kind = payload.kind();
        if !self.settings.tracks(kind) {
            return None;
        }
        if kind == EventKind::Cursor && !self.cursor_sample_due() {
            return None;
        }
        Some(self.append(payload, file_path))
    }

    /// Feed a raw editor content change into the coalescer.
    ///
    /// Returns the sequence of an edit emitted because the change targets
    /// a different file than the buffered burst.
    pub fn content_changed(
        &mut self,
        file_path: Option<String>,
        previous_content: String,
        new_content: String,
    ) -> Option<u64> {
        if !self.active || !self.settings.track_keystrokes {
            return None;
        }
        let now = self.clock.now_ms();
        let flushed = self.coalescer.push(EditChange {
            timestamp: now,
            file_path,
            previous_content,
            new_content,
        });

        if let Some(handle) = self.debounce_timer.take() {
            self.scheduler.cancel(handle);
        }
        self.debounce_timer = Some(
            self.scheduler
                .schedule(TimerKind::Debounce, now.saturating_add(self.debounce_ms)),
        );

        flushed.map(|edit| self.append(EventPayload::Edit(edit.data), edit.file_path))
    }

    /// Collapse any buffered burst now. Returns the emitted edit's sequence.
    pub fn flush_edits(&mut self) -> Option<u64> {
        if let Some(handle) = self.debounce_timer.take() {
            self.scheduler.cancel(handle);
        }
        let edit = self.coalescer.flush()?;
        Some(self.append(EventPayload::Edit(edit.data), edit.file_path))
    }

    /// Force-flush edits, then record the run so it follows the code it ran.
    pub fn request_run(&mut self, run: RunData, file_path: Option<String>) -> Option<u64> {
        if !self.active {
            return None;
        }
        self.flush_edits();
        self.record(EventPayload::Run(run), file_path)
    }

    /// Tab hidden: force-flush edits and try an upload.
    pub fn visibility_hidden(&mut self) -> FlushReport {
        if self.active {
            self.flush_edits();
        }
        self.uploader.flush(&mut self.transport)
    }

    /// Page unloading: force-flush edits and beacon every queued event.
    ///
    /// Queues are kept; the beacon is not an acknowledgement.
    pub fn before_unload(&mut self) -> usize {
        if self.active {
            self.flush_edits();
        }
        self.uploader.beacon(&mut self.transport)
    }

    /// Connectivity changed.
    pub fn set_online(&mut self, online: bool) -> FlushReport {
        self.uploader.set_online(online, &mut self.transport)
    }

    /// Fire every timer due at the current clock reading.
    pub fn tick(&mut self) -> TickReport {
        let now = self.clock.now_ms();
        let mut report = TickReport::default();
        for (handle, kind) in self.scheduler.take_due(now) {
            match kind {
                TimerKind::Debounce => {
                    if self.debounce_timer == Some(handle) {
                        self.debounce_timer = None;
                        report.edit = self.flush_edits().or(report.edit);
                    }
                }
                TimerKind::Flush => {
                    self.flush_timer = None;
                    let flush = self.uploader.flush(&mut self.transport);
                    report.flush = Some(flush);
                    if self.active {
                        self.arm_flush_timer(now);
                    }
                }
            }
        }
        report
    }

    /// Earliest pending timer deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Millis> {
        self.scheduler.next_deadline()
    }

    #[must_use]
    pub const fn attempt_id(&self) -> AttemptId {
        self.attempt_id
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub const fn last_sequence(&self) -> Option<u64> {
        match self.next_sequence {
            FIRST_SEQUENCE => None,
            next => Some(next - 1),
        }
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.uploader.status()
    }

    /// Recent events, for in-session inspection.
    #[must_use]
    pub const fn ring(&self) -> &EventRing {
        &self.ring
    }

    #[must_use]
    pub const fn uploader(&self) -> &BatchUploader {
        &self.uploader
    }

    #[must_use]
    pub const fn settings(&self) -> &LoggingSettings {
        &self.settings
    }

    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn append(&mut self, payload: EventPayload, file_path: Option<String>) -> u64 {
        let now = self.clock.now_ms();
        let origin = self.origin_ms.unwrap_or(now);
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let event = Event {
            sequence,
            relative_time: millis_to_secs(now.saturating_sub(origin)),
            file_path,
            payload,
        };
        debug!(
            attempt_id = self.attempt_id,
            sequence,
            kind = %event.kind(),
            "event recorded"
        );
        self.ring.push(event.clone());
        self.uploader.enqueue(event);
        sequence
    }

    fn cursor_sample_due(&mut self) -> bool {
        let now = self.clock.now_ms();
        if let (Some(throttle), Some(last)) =
            (self.settings.cursor_throttle_ms(), self.last_cursor_ms)
        {
            if now.saturating_sub(last) < throttle {
                return false;
            }
        }
        self.last_cursor_ms = Some(now);
        true
    }

    fn arm_flush_timer(&mut self, now: Millis) {
        if let Some(handle) = self.flush_timer.take() {
            self.scheduler.cancel(handle);
        }
        let deadline = now.saturating_add(self.settings.batch_interval_ms());
        self.flush_timer = Some(self.scheduler.schedule(TimerKind::Flush, deadline));
    }
}

#[allow(clippy::cast_precision_loss)]
fn millis_to_secs(ms: Millis) -> f64 {
    ms as f64 / 1_000.0
}
