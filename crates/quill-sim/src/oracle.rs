//! Ledger invariants checked after every simulated session.
//!
//! The oracle only sees what a real deployment would keep: the stored
//! ledger, its flags, and what the client believes it recorded. Each
//! checker returns an [`OracleResult`]; [`LedgerOracle::check_all`] merges
//! them.

use std::collections::BTreeSet;
use std::fmt;

use quill_core::replay::{FinalStateCheck, Timeline, reconstruct_final};

use crate::SimulationResult;
use crate::client::MAIN_FILE;
use crate::rng::SimRng;

/// Shuffled re-orderings tried by the order-independence check.
const PERMUTATIONS: usize = 4;

// ── Result types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn fail(violation: InvariantViolation) -> Self {
        Self {
            passed: false,
            violations: vec![violation],
        }
    }

    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

// ── Violations ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    /// Stored sequences are not exactly `1..=last` for the client's last
    /// assigned sequence.
    LedgerShape {
        client_last: Option<u64>,
        missing: Vec<u64>,
        unexpected: Vec<u64>,
    },
    /// The same sequence appears twice in the ledger read.
    DuplicateSequence { seq: u64 },
    /// Relative time went backwards between consecutive sequences.
    TimeRegression { seq: u64, previous_t: f64, t: f64 },
    /// The in-session ring is not strictly increasing.
    RingOrder { sequences: Vec<u64> },
    /// A recorder-produced event failed to decode.
    Quarantined { sequences: Vec<u64> },
    /// The store flagged the ledger for review.
    Flagged { detail: Vec<String> },
    /// Replaying the ledger does not give the editor contents.
    FinalState { files: Vec<String> },
    /// Events still queued after the final drain.
    Unacknowledged { count: usize },
    /// Re-sending the whole ledger changed it.
    Redelivery { inserted: usize, collisions: usize },
    /// Replaying a shuffled copy of the ledger gave a different result.
    OrderDependence { permutation: usize },
    /// Engagement metrics disagree with what the client recorded.
    Metrics { detail: String },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LedgerShape {
                client_last,
                missing,
                unexpected,
            } => write!(
                f,
                "LedgerShape: client last={client_last:?} (missing={missing:?}, unexpected={unexpected:?})"
            ),
            Self::DuplicateSequence { seq } => write!(f, "DuplicateSequence: seq={seq} read twice"),
            Self::TimeRegression { seq, previous_t, t } => write!(
                f,
                "TimeRegression: seq={seq} at t={t:.3} after t={previous_t:.3}"
            ),
            Self::RingOrder { sequences } => write!(f, "RingOrder: {sequences:?}"),
            Self::Quarantined { sequences } => {
                write!(f, "Quarantined: recorder events {sequences:?} did not decode")
            }
            Self::Flagged { detail } => write!(f, "Flagged: {}", detail.join("; ")),
            Self::FinalState { files } => {
                write!(f, "FinalState: replay differs from editor in {files:?}")
            }
            Self::Unacknowledged { count } => {
                write!(f, "Unacknowledged: {count} events never acknowledged")
            }
            Self::Redelivery {
                inserted,
                collisions,
            } => write!(
                f,
                "Redelivery: resend inserted {inserted} and collided {collisions}"
            ),
            Self::OrderDependence { permutation } => {
                write!(f, "OrderDependence: permutation {permutation} replays differently")
            }
            Self::Metrics { detail } => write!(f, "Metrics: {detail}"),
        }
    }
}

// ── Oracle ───────────────────────────────────────────────────────────────────

pub struct LedgerOracle;

impl LedgerOracle {
    /// Run every checker and merge the results.
    #[must_use]
    pub fn check_all(result: &SimulationResult, rng: &mut SimRng) -> OracleResult {
        Self::check_contiguity(result)
            .merge(Self::check_time_order(result))
            .merge(Self::check_ring(result))
            .merge(Self::check_decodable(result))
            .merge(Self::check_flags(result))
            .merge(Self::check_final_state(result))
            .merge(Self::check_acknowledged(result))
            .merge(Self::check_redelivery(result))
            .merge(Self::check_order_independence(result, rng))
            .merge(Self::check_metrics(result))
    }

    /// Stored sequences are exactly `1..=last` and each appears once.
    #[must_use]
    pub fn check_contiguity(result: &SimulationResult) -> OracleResult {
        let mut out = OracleResult::pass();
        let mut seen = BTreeSet::new();
        for event in &result.ledger {
            if !seen.insert(event.sequence()) {
                out = out.merge(OracleResult::fail(InvariantViolation::DuplicateSequence {
                    seq: event.sequence(),
                }));
            }
        }

        let expected: BTreeSet<u64> = (1..=result.client_last_sequence.unwrap_or(0)).collect();
        let missing: Vec<u64> = expected.difference(&seen).copied().collect();
        let unexpected: Vec<u64> = seen.difference(&expected).copied().collect();
        let handed_out_missing = result.handed_out.iter().any(|seq| !seen.contains(seq));

        if missing.is_empty() && unexpected.is_empty() && !handed_out_missing {
            return out;
        }
        out.merge(OracleResult::fail(InvariantViolation::LedgerShape {
            client_last: result.client_last_sequence,
            missing,
            unexpected,
        }))
    }

    /// Relative time never decreases in sequence order.
    #[must_use]
    pub fn check_time_order(result: &SimulationResult) -> OracleResult {
        let regression = result.ledger.windows(2).find_map(|pair| {
            (pair[1].wire.t < pair[0].wire.t).then(|| InvariantViolation::TimeRegression {
                seq: pair[1].sequence(),
                previous_t: pair[0].wire.t,
                t: pair[1].wire.t,
            })
        });
        regression.map_or_else(OracleResult::pass, OracleResult::fail)
    }

    #[must_use]
    pub fn check_ring(result: &SimulationResult) -> OracleResult {
        if result.ring_tail.windows(2).all(|w| w[0] < w[1]) {
            OracleResult::pass()
        } else {
            OracleResult::fail(InvariantViolation::RingOrder {
                sequences: result.ring_tail.clone(),
            })
        }
    }

    /// Everything the recorder produces decodes; nothing is quarantined.
    #[must_use]
    pub fn check_decodable(result: &SimulationResult) -> OracleResult {
        let sequences: Vec<u64> = result
            .ledger
            .iter()
            .filter(|e| e.is_quarantined() || e.decode().is_err())
            .map(quill_core::store::StoredEvent::sequence)
            .collect();
        if sequences.is_empty() {
            OracleResult::pass()
        } else {
            OracleResult::fail(InvariantViolation::Quarantined { sequences })
        }
    }

    /// No collision or gap flags, and finishing found no gaps.
    #[must_use]
    pub fn check_flags(result: &SimulationResult) -> OracleResult {
        let detail: Vec<String> = result
            .flags
            .iter()
            .map(|flag| format!("{} at {}: {}", flag.kind, flag.seq, flag.detail))
            .chain(result.finish_gaps.iter().map(|gap| format!("gap {gap} on finish")))
            .collect();
        if detail.is_empty() {
            OracleResult::pass()
        } else {
            OracleResult::fail(InvariantViolation::Flagged { detail })
        }
    }

    /// Replaying the ledger from the starter state gives the editor
    /// contents, and the store's own verification agrees.
    #[must_use]
    pub fn check_final_state(result: &SimulationResult) -> OracleResult {
        let timeline = Timeline::from_stored(&result.ledger);
        let replayed = reconstruct_final(&timeline, &result.starter, MAIN_FILE);

        let mut files: BTreeSet<String> = result
            .client_files
            .keys()
            .chain(replayed.keys())
            .filter(|name| result.client_files.get(*name) != replayed.get(*name))
            .cloned()
            .collect();
        if let FinalStateCheck::Mismatch { files: stored } = &result.integrity.final_state {
            files.extend(stored.iter().cloned());
        }

        if files.is_empty() {
            OracleResult::pass()
        } else {
            OracleResult::fail(InvariantViolation::FinalState {
                files: files.into_iter().collect(),
            })
        }
    }

    #[must_use]
    pub fn check_acknowledged(result: &SimulationResult) -> OracleResult {
        if result.unacknowledged == 0 {
            OracleResult::pass()
        } else {
            OracleResult::fail(InvariantViolation::Unacknowledged {
                count: result.unacknowledged,
            })
        }
    }

    /// Re-sending the full ledger is absorbed as duplicates.
    #[must_use]
    pub fn check_redelivery(result: &SimulationResult) -> OracleResult {
        let report = result.redelivery;
        if report.inserted == 0 && report.collisions == 0 {
            OracleResult::pass()
        } else {
            OracleResult::fail(InvariantViolation::Redelivery {
                inserted: report.inserted,
                collisions: report.collisions,
            })
        }
    }

    /// Arrival order does not matter: the timeline orders by sequence.
    #[must_use]
    pub fn check_order_independence(result: &SimulationResult, rng: &mut SimRng) -> OracleResult {
        let wires: Vec<_> = result.ledger.iter().map(|e| e.wire.clone()).collect();
        let canonical = reconstruct_final(&Timeline::from_wire(&wires), &result.starter, MAIN_FILE);

        let mut out = OracleResult::pass();
        for permutation in 0..PERMUTATIONS {
            let mut shuffled = wires.clone();
            rng.shuffle(&mut shuffled);
            let files = reconstruct_final(&Timeline::from_wire(&shuffled), &result.starter, MAIN_FILE);
            if files != canonical {
                out = out.merge(OracleResult::fail(InvariantViolation::OrderDependence {
                    permutation,
                }));
            }
        }
        out
    }

    #[must_use]
    pub fn check_metrics(result: &SimulationResult) -> OracleResult {
        let m = &result.metrics;
        let mut problems = Vec::new();
        if m.paste_count != result.recorded_pastes {
            problems.push(format!(
                "paste_count {} != recorded {}",
                m.paste_count, result.recorded_pastes
            ));
        }
        if m.run_count != result.recorded_runs {
            problems.push(format!(
                "run_count {} != recorded {}",
                m.run_count, result.recorded_runs
            ));
        }
        if m.event_count != result.ledger.len() {
            problems.push(format!(
                "event_count {} != ledger {}",
                m.event_count,
                result.ledger.len()
            ));
        }
        if m.active_typing_time > m.session_length {
            problems.push(format!(
                "active typing {:.3}s exceeds session {:.3}s",
                m.active_typing_time, m.session_length
            ));
        }

        problems
            .into_iter()
            .map(|detail| OracleResult::fail(InvariantViolation::Metrics { detail }))
            .fold(OracleResult::pass(), OracleResult::merge)
    }
}
