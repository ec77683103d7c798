//! Explicit timer scheduler owned by the recorder service.
//!
//! Timers are plain deadlines with cancelable handles. Nothing fires on its
//! own: the owner calls [`Scheduler::take_due`] from its `tick` and handles
//! each expired timer synchronously, which keeps all mutation on a single
//! logical thread of control.

use std::collections::BTreeMap;

use crate::clock::Millis;

/// What an expired timer means to the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// The typing pause elapsed; collapse the edit buffer.
    Debounce,
    /// Periodic batch upload.
    Flush,
}

/// Handle returned by [`Scheduler::schedule`]; used to cancel the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy)]
struct Timer {
    deadline: Millis,
    kind: TimerKind,
}

/// Deadline-ordered set of one-shot timers.
#[derive(Debug, Default)]
pub struct Scheduler {
    next_id: u64,
    timers: BTreeMap<TimerHandle, Timer>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot timer expiring at `deadline`.
    pub fn schedule(&mut self, kind: TimerKind, deadline: Millis) -> TimerHandle {
        let handle = TimerHandle(self.next_id);
        self.next_id += 1;
        self.timers.insert(handle, Timer { deadline, kind });
        handle
    }

    /// Disarm a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.timers.remove(&handle).is_some()
    }

    /// Whether `handle` is still armed.
    #[must_use]
    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.timers.contains_key(&handle)
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// ordered by deadline, then by arming order.
    pub fn take_due(&mut self, now: Millis) -> Vec<(TimerHandle, TimerKind)> {
        let mut due: Vec<(TimerHandle, Timer)> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(handle, timer)| (*handle, *timer))
            .collect();
        due.sort_by_key(|(handle, timer)| (timer.deadline, *handle));

        for (handle, _) in &due {
            self.timers.remove(handle);
        }

        due.into_iter().map(|(handle, timer)| (handle, timer.kind)).collect()
    }

    /// Earliest armed deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.values().map(|timer| timer.deadline).min()
    }

    /// Disarm everything.
    pub fn clear(&mut self) {
        self.timers.clear();
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
