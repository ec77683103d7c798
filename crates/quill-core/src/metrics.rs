//! Engagement metrics derived from an attempt's ledger.
//!
//! Every metric is a pure function of the ordered timeline, the attempt's
//! timestamps and (for open attempts) the current time. Only parsed events
//! count toward per-kind metrics; unparsable ones are reported separately.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;

use crate::AttemptId;
use crate::config::MetricsConfig;
use crate::event::EventPayload;
use crate::replay::Timeline;
use crate::store::Attempt;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementMetrics {
    /// Seconds; never exceeds `session_length`.
    pub active_typing_time: f64,
    pub paste_count: usize,
    pub large_paste_count: usize,
    pub avg_paste_size: f64,
    /// Completed `ai_prompt` then `ai_response` pairs.
    pub ai_interaction_count: usize,
    pub run_count: usize,
    /// Seconds from start to finish, or to now while open.
    pub session_length: f64,
    pub event_count: usize,
    pub unparsable_count: usize,
    pub last_sequence: Option<u64>,
}

/// `finished_at - started_at`, or `now - started_at` while open, in seconds.
#[must_use]
pub fn session_length(attempt: &Attempt, now: DateTime<Utc>) -> f64 {
    let end = attempt.finished_at.unwrap_or(now);
    let micros = (end - attempt.started_at).num_microseconds().unwrap_or(i64::MAX);
    micros_to_secs(micros.max(0))
}

#[must_use]
pub fn compute(
    timeline: &Timeline,
    attempt: &Attempt,
    now: DateTime<Utc>,
    config: &MetricsConfig,
) -> EngagementMetrics {
    let session = session_length(attempt, now);
    let mut metrics = EngagementMetrics {
        session_length: session,
        event_count: timeline.len(),
        unparsable_count: timeline.unparsable_count(),
        last_sequence: timeline.last_sequence(),
        ..EngagementMetrics::default()
    };

    let mut active = 0.0;
    let mut previous_t: Option<f64> = None;
    let mut total_paste = 0.0;
    let mut open_prompts = 0usize;

    for entry in timeline.entries() {
        if let Some(prev) = previous_t {
            let gap = entry.relative_time - prev;
            if (0.0..=config.idle_threshold_secs).contains(&gap) {
                active += gap;
            }
        }
        previous_t = Some(entry.relative_time);

        match entry.payload() {
            Some(EventPayload::Paste(paste)) => {
                metrics.paste_count += 1;
                total_paste += usize_to_f64(paste.size);
                if paste.size > config.large_paste_threshold {
                    metrics.large_paste_count += 1;
                }
            }
            Some(EventPayload::Run(_)) => metrics.run_count += 1,
            Some(EventPayload::AiPrompt(_)) => open_prompts += 1,
            Some(EventPayload::AiResponse(_)) if open_prompts > 0 => {
                open_prompts -= 1;
                metrics.ai_interaction_count += 1;
            }
            _ => {}
        }
    }

    metrics.active_typing_time = active.min(session);
    if metrics.paste_count > 0 {
        metrics.avg_paste_size = total_paste / usize_to_f64(metrics.paste_count);
    }
    metrics
}

/// Memoizes metrics by `(attempt, last sequence seen)`.
///
/// Only finished attempts are cached: an open attempt's session length
/// moves with the clock.
#[derive(Debug, Default)]
pub struct MetricsCache {
    config: MetricsConfig,
    entries: HashMap<(AttemptId, Option<u64>), EngagementMetrics>,
    hits: u64,
    misses: u64,
}

impl MetricsCache {
    #[must_use]
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn get_or_compute(
        &mut self,
        attempt: &Attempt,
        timeline: &Timeline,
        now: DateTime<Utc>,
    ) -> EngagementMetrics {
        if !attempt.is_finished() {
            self.misses += 1;
            return compute(timeline, attempt, now, &self.config);
        }
        let key = (attempt.id, timeline.last_sequence());
        if let Some(hit) = self.entries.get(&key) {
            self.hits += 1;
            trace!(attempt_id = attempt.id, "metrics cache hit");
            return hit.clone();
        }
        self.misses += 1;
        let metrics = compute(timeline, attempt, now, &self.config);
        self.entries.retain(|(id, _), _| *id != attempt.id);
        self.entries.insert(key, metrics.clone());
        metrics
    }

    #[must_use]
    pub const fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// `(hits, misses)` since creation.
    #[must_use]
    pub const fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn invalidate(&mut self, attempt_id: AttemptId) {
        self.entries.retain(|(id, _), _| *id != attempt_id);
    }
}

#[allow(clippy::cast_precision_loss)]
fn micros_to_secs(micros: i64) -> f64 {
    micros as f64 / 1_000_000.0
}

#[allow(clippy::cast_precision_loss)]
const fn usize_to_f64(n: usize) -> f64 {
    n as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileMap;
    use crate::event::WireEvent;
    use chrono::Duration;
    use serde_json::json;

    fn wire(seq: u64, t: f64, kind: &str, payload: serde_json::Value) -> WireEvent {
        WireEvent {
            t,
            seq,
            kind: kind.into(),
            file_path: None,
            payload_json: payload.to_string(),
        }
    }

    fn attempt(length_secs: Option<i64>) -> Attempt {
        let started_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        Attempt {
            id: 1,
            assignment_id: None,
            started_at,
            finished_at: length_secs.map(|s| started_at + Duration::seconds(s)),
            starter_state: FileMap::new(),
            final_state: None,
        }
    }

    #[test]
    fn empty_ledger_has_zero_metrics() {
        let m = compute(&Timeline::default(), &attempt(Some(60)), Utc::now(), &MetricsConfig::default());
        assert_eq!(m.paste_count, 0);
        assert!(m.active_typing_time.abs() < f64::EPSILON);
        assert!((m.session_length - 60.0).abs() < 1e-9);
        assert_eq!(m.last_sequence, None);
    }

    #[test]
    fn idle_gaps_are_excluded() {
        let timeline = Timeline::from_wire(&[
            wire(1, 0.0, "edit", json!({"fullCode": "a"})),
            wire(2, 10.0, "edit", json!({"fullCode": "ab"})),
            wire(3, 100.0, "edit", json!({"fullCode": "abc"})),
            wire(4, 105.0, "run", json!({})),
        ]);
        let m = compute(&timeline, &attempt(Some(200)), Utc::now(), &MetricsConfig::default());
        assert!((m.active_typing_time - 15.0).abs() < 1e-9);
        assert_eq!(m.run_count, 1);
    }

    #[test]
    fn active_time_is_clamped_to_session_length() {
        let timeline = Timeline::from_wire(&[
            wire(1, 0.0, "run", json!({})),
            wire(2, 20.0, "run", json!({})),
        ]);
        let m = compute(&timeline, &attempt(Some(5)), Utc::now(), &MetricsConfig::default());
        assert!((m.active_typing_time - 5.0).abs() < 1e-9);
    }

    #[test]
    fn pastes_and_ai_pairs() {
        let timeline = Timeline::from_wire(&[
            wire(1, 0.0, "paste", json!({"size": 150})),
            wire(2, 1.0, "paste", json!({"size": 50})),
            wire(3, 2.0, "ai_response", json!({"response": "orphan"})),
            wire(4, 3.0, "ai_prompt", json!({"prompt": "help"})),
            wire(5, 4.0, "ai_response", json!({"response": "sure"})),
            wire(6, 5.0, "ai_prompt", json!({"prompt": "again"})),
        ]);
        let m = compute(&timeline, &attempt(Some(60)), Utc::now(), &MetricsConfig::default());
        assert_eq!(m.paste_count, 2);
        assert_eq!(m.large_paste_count, 1);
        assert!((m.avg_paste_size - 100.0).abs() < 1e-9);
        assert_eq!(m.ai_interaction_count, 1);
    }

    #[test]
    fn huge_paste_sizes_do_not_overflow_the_average() {
        let timeline = Timeline::from_wire(&[
            wire(1, 0.0, "paste", json!({"size": u64::MAX})),
            wire(2, 1.0, "paste", json!({"size": u64::MAX})),
        ]);
        let m = compute(&timeline, &attempt(Some(60)), Utc::now(), &MetricsConfig::default());
        assert_eq!(m.paste_count, 2);
        assert_eq!(m.large_paste_count, 2);
        assert!(m.avg_paste_size.is_finite());
        assert!(m.avg_paste_size > 1e19);
    }

    #[test]
    fn unparsable_events_are_counted_not_classified() {
        let timeline = Timeline::from_wire(&[
            wire(1, 0.0, "paste", json!({"bytes": 10})),
            wire(2, 1.0, "paste", json!({"size": 10})),
        ]);
        let m = compute(&timeline, &attempt(Some(60)), Utc::now(), &MetricsConfig::default());
        assert_eq!(m.paste_count, 1);
        assert_eq!(m.unparsable_count, 1);
        assert_eq!(m.event_count, 2);
    }

    #[test]
    fn open_attempt_uses_now() {
        let a = attempt(None);
        let now = a.started_at + Duration::seconds(90);
        assert!((session_length(&a, now) - 90.0).abs() < 1e-9);
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(EngagementMetrics::default()).expect("json");
        assert!(value.get("activeTypingTime").is_some());
        assert!(value.get("largePasteCount").is_some());
    }

    #[test]
    fn cache_only_memoizes_finished_attempts() {
        let timeline = Timeline::from_wire(&[wire(1, 0.0, "run", json!({}))]);
        let mut cache = MetricsCache::new(MetricsConfig::default());

        cache.get_or_compute(&attempt(None), &timeline, Utc::now());
        assert!(cache.is_empty());

        let finished = attempt(Some(10));
        cache.get_or_compute(&finished, &timeline, Utc::now());
        cache.get_or_compute(&finished, &timeline, Utc::now());
        assert_eq!(cache.stats(), (1, 2));

        let longer = Timeline::from_wire(&[
            wire(1, 0.0, "run", json!({})),
            wire(2, 1.0, "run", json!({})),
        ]);
        let m = cache.get_or_compute(&finished, &longer, Utc::now());
        assert_eq!(m.run_count, 2);
        assert_eq!(cache.len(), 1);
    }
}
