//! Offline queue and batch uploader.
//!
//! Two queues hold unacknowledged events: `pending` while online and
//! `offline` while disconnected. Batches are drained from the front of a
//! queue and put back at the front on failure, so every unacknowledged
//! event stays queued in sequence order. Queues are never evicted.

pub mod transport;

pub use transport::{HttpTransport, StoreTransport, Transport, TransportError};

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::AttemptId;
use crate::config::UploaderConfig;
use crate::event::{Event, EventBatch};

/// Delivery state surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Every captured event is acknowledged.
    Synced,
    /// Events are queued and the last upload did not fail repeatedly.
    Pending,
    /// Disconnected; events accumulate in the offline queue.
    Offline,
    /// Repeated upload failures. Still retrying.
    Degraded,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Offline => "offline",
            Self::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub batches_sent: usize,
    pub events_sent: usize,
    /// A batch failed and was put back.
    pub failed: bool,
}

impl FlushReport {
    fn absorb(&mut self, other: Self) {
        self.batches_sent += other.batches_sent;
        self.events_sent += other.events_sent;
        self.failed |= other.failed;
    }
}

#[derive(Debug)]
pub struct BatchUploader {
    attempt_id: AttemptId,
    config: UploaderConfig,
    pending: VecDeque<Event>,
    offline: VecDeque<Event>,
    online: bool,
    consecutive_failures: u32,
    warned: bool,
    acknowledged: u64,
}

impl BatchUploader {
    #[must_use]
    pub fn new(attempt_id: AttemptId, config: UploaderConfig) -> Self {
        Self {
            attempt_id,
            config,
            pending: VecDeque::new(),
            offline: VecDeque::new(),
            online: true,
            consecutive_failures: 0,
            warned: false,
            acknowledged: 0,
        }
    }

    /// Queue a freshly sequenced event on the active queue.
    pub fn enqueue(&mut self, event: Event) {
        if self.online {
            self.pending.push_back(event);
        } else {
            self.offline.push_back(event);
        }
        self.check_queue_size();
    }

    /// Switch connectivity.
    ///
    /// Going offline moves `pending` to the front of `offline`. Coming back
    /// flushes `offline` and merges any remainder at the front of `pending`.
    pub fn set_online(&mut self, online: bool, transport: &mut impl Transport) -> FlushReport {
        if online == self.online {
            return FlushReport::default();
        }
        self.online = online;

        if !online {
            while let Some(event) = self.pending.pop_back() {
                self.offline.push_front(event);
            }
            info!(queued = self.offline.len(), "connection lost; queueing offline");
            return FlushReport::default();
        }

        info!(queued = self.offline.len(), "connection restored; flushing offline queue");
        let report = self.drain(Queue::Offline, transport);
        while let Some(event) = self.offline.pop_back() {
            self.pending.push_front(event);
        }
        report
    }

    /// Upload `pending` in capped batches until empty or a batch fails.
    ///
    /// Does nothing while offline.
    pub fn flush(&mut self, transport: &mut impl Transport) -> FlushReport {
        if !self.online {
            return FlushReport::default();
        }
        self.drain(Queue::Pending, transport)
    }

    /// Hand every queued event to the beacon transport. Queues are kept:
    /// a beacon is never an acknowledgement.
    pub fn beacon(&self, transport: &mut impl Transport) -> usize {
        let events: Vec<&Event> = self.offline.iter().chain(self.pending.iter()).collect();
        let mut handed_off = 0;
        for chunk in events.chunks(self.config.max_batch_size.max(1)) {
            match EventBatch::from_events(self.attempt_id, chunk.iter().copied()) {
                Ok(batch) => {
                    if transport.send_beacon(&batch) {
                        handed_off += batch.events.len();
                    }
                }
                Err(err) => warn!(error = %err, "failed to encode beacon batch"),
            }
        }
        debug!(handed_off, "beacon sent");
        handed_off
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        if !self.online {
            SyncStatus::Offline
        } else if self.consecutive_failures >= self.config.degraded_after_failures {
            SyncStatus::Degraded
        } else if self.queued_len() > 0 {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        }
    }

    /// Whether the queues are over the warning threshold.
    #[must_use]
    pub fn queue_warning(&self) -> bool {
        self.queued_len() > self.config.queue_warning_threshold
    }

    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.online
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.pending.len() + self.offline.len()
    }

    /// Sequences still awaiting acknowledgement, in queue order.
    #[must_use]
    pub fn queued_sequences(&self) -> Vec<u64> {
        self.offline
            .iter()
            .chain(self.pending.iter())
            .map(|e| e.sequence)
            .collect()
    }

    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Events acknowledged since creation.
    #[must_use]
    pub const fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    fn queue_mut(&mut self, queue: Queue) -> &mut VecDeque<Event> {
        match queue {
            Queue::Pending => &mut self.pending,
            Queue::Offline => &mut self.offline,
        }
    }

    fn drain(&mut self, queue: Queue, transport: &mut impl Transport) -> FlushReport {
        let mut report = FlushReport::default();
        while !self.queue_mut(queue).is_empty() {
            report.absorb(self.send_front(queue, transport));
            if report.failed {
                break;
            }
        }
        self.check_queue_size();
        report
    }

    fn send_front(&mut self, queue: Queue, transport: &mut impl Transport) -> FlushReport {
        let cap = self.config.max_batch_size.max(1);
        let attempt_id = self.attempt_id;
        let q = self.queue_mut(queue);
        let take = q.len().min(cap);
        let events: Vec<Event> = q.drain(..take).collect();

        let result = EventBatch::from_events(attempt_id, &events)
            .map_err(TransportError::from)
            .and_then(|batch| transport.send_batch(&batch));

        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.acknowledged += events.len() as u64;
                debug!(
                    first = events.first().map(|e| e.sequence),
                    last = events.last().map(|e| e.sequence),
                    "batch acknowledged"
                );
                FlushReport {
                    batches_sent: 1,
                    events_sent: events.len(),
                    failed: false,
                }
            }
            Err(err) => {
                let q = self.queue_mut(queue);
                for event in events.into_iter().rev() {
                    q.push_front(event);
                }
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if err.is_client_error() {
                    error!(error = %err, attempt_id, "batch rejected; will retry");
                } else {
                    debug!(error = %err, failures = self.consecutive_failures, "batch upload failed");
                }
                if self.consecutive_failures == self.config.degraded_after_failures {
                    warn!(
                        failures = self.consecutive_failures,
                        queued = self.queued_len(),
                        "sync degraded"
                    );
                }
                FlushReport {
                    batches_sent: 0,
                    events_sent: 0,
                    failed: true,
                }
            }
        }
    }

    fn check_queue_size(&mut self) {
        let over = self.queue_warning();
        if over && !self.warned {
            warn!(
                queued = self.queued_len(),
                threshold = self.config.queue_warning_threshold,
                "upload queue is large; events are kept until acknowledged"
            );
        }
        self.warned = over;
    }
}

#[derive(Debug, Clone, Copy)]
enum Queue {
    Pending,
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, RunData};

    /// Records every batch; fails the next `fail_next` sends.
    #[derive(Default)]
    struct ScriptedTransport {
        sent: Vec<EventBatch>,
        beacons: Vec<EventBatch>,
        fail_next: usize,
        reject: bool,
    }

    impl Transport for ScriptedTransport {
        fn send_batch(&mut self, batch: &EventBatch) -> Result<(), TransportError> {
            if self.fail_next > 0 {
                self.fail_next -= 1;
                if self.reject {
                    return Err(TransportError::Rejected {
                        status: 400,
                        body: "bad".into(),
                    });
                }
                return Err(TransportError::Server { status: 503 });
            }
            self.sent.push(batch.clone());
            Ok(())
        }

        fn send_beacon(&mut self, batch: &EventBatch) -> bool {
            self.beacons.push(batch.clone());
            true
        }
    }

    fn event(seq: u64) -> Event {
        Event {
            sequence: seq,
            relative_time: 0.0,
            file_path: None,
            payload: EventPayload::Run(RunData::default()),
        }
    }

    fn uploader(max_batch: usize) -> BatchUploader {
        BatchUploader::new(
            7,
            UploaderConfig {
                max_batch_size: max_batch,
                degraded_after_failures: 3,
                queue_warning_threshold: 5,
            },
        )
    }

    fn seqs(batch: &EventBatch) -> Vec<u64> {
        batch.events.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn flush_splits_into_capped_batches() {
        let mut up = uploader(2);
        let mut t = ScriptedTransport::default();
        for seq in 1..=5 {
            up.enqueue(event(seq));
        }
        let report = up.flush(&mut t);
        assert_eq!(report.batches_sent, 3);
        assert_eq!(report.events_sent, 5);
        assert_eq!(seqs(&t.sent[0]), vec![1, 2]);
        assert_eq!(seqs(&t.sent[2]), vec![5]);
        assert_eq!(up.status(), SyncStatus::Synced);
        assert_eq!(t.sent[0].attempt_id, 7);
    }

    #[test]
    fn failed_batch_is_put_back_in_order() {
        let mut up = uploader(2);
        let mut t = ScriptedTransport {
            fail_next: 1,
            ..ScriptedTransport::default()
        };
        for seq in 1..=3 {
            up.enqueue(event(seq));
        }
        let report = up.flush(&mut t);
        assert!(report.failed);
        assert_eq!(up.queued_sequences(), vec![1, 2, 3]);
        assert_eq!(up.status(), SyncStatus::Pending);

        up.enqueue(event(4));
        up.flush(&mut t);
        let sent: Vec<u64> = t.sent.iter().flat_map(seqs).collect();
        assert_eq!(sent, vec![1, 2, 3, 4]);
    }

    #[test]
    fn repeated_failures_degrade_then_recover() {
        let mut up = uploader(10);
        let mut t = ScriptedTransport {
            fail_next: 3,
            reject: true,
            ..ScriptedTransport::default()
        };
        up.enqueue(event(1));
        for _ in 0..3 {
            up.flush(&mut t);
        }
        assert_eq!(up.status(), SyncStatus::Degraded);
        assert_eq!(up.consecutive_failures(), 3);

        up.flush(&mut t);
        assert_eq!(up.status(), SyncStatus::Synced);
        assert_eq!(up.acknowledged(), 1);
    }

    #[test]
    fn going_offline_moves_pending_ahead_of_offline() {
        let mut up = uploader(100);
        let mut t = ScriptedTransport::default();
        up.enqueue(event(1));
        up.enqueue(event(2));
        up.set_online(false, &mut t);
        up.enqueue(event(3));
        assert_eq!(up.pending_len(), 0);
        assert_eq!(up.queued_sequences(), vec![1, 2, 3]);
        assert_eq!(up.status(), SyncStatus::Offline);

        assert_eq!(up.flush(&mut t), FlushReport::default());
        assert!(t.sent.is_empty());

        let report = up.set_online(true, &mut t);
        assert_eq!(report.batches_sent, 1);
        assert_eq!(seqs(&t.sent[0]), vec![1, 2, 3]);
    }

    #[test]
    fn failed_reconnect_merges_remainder_into_pending() {
        let mut up = uploader(2);
        let mut t = ScriptedTransport::default();
        up.set_online(false, &mut t);
        for seq in 1..=4 {
            up.enqueue(event(seq));
        }
        t.fail_next = 1;
        let report = up.set_online(true, &mut t);
        assert!(report.failed);
        assert_eq!(up.offline_len(), 0);
        up.enqueue(event(5));
        assert_eq!(up.queued_sequences(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn beacon_keeps_queues() {
        let mut up = uploader(2);
        let mut t = ScriptedTransport::default();
        for seq in 1..=3 {
            up.enqueue(event(seq));
        }
        assert_eq!(up.beacon(&mut t), 3);
        assert_eq!(t.beacons.len(), 2);
        assert_eq!(up.queued_len(), 3);
    }

    #[test]
    fn warning_threshold_never_drops_events() {
        let mut up = uploader(10);
        let mut t = ScriptedTransport::default();
        up.set_online(false, &mut t);
        for seq in 1..=8 {
            up.enqueue(event(seq));
        }
        assert!(up.queue_warning());
        assert_eq!(up.queued_len(), 8);
        up.set_online(true, &mut t);
        assert!(!up.queue_warning());
    }
}
