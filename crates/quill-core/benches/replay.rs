use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use quill_core::FileMap;
use quill_core::config::MetricsConfig;
use quill_core::event::WireEvent;
use quill_core::metrics;
use quill_core::replay::{Timeline, reconstruct_at_sequence};
use quill_core::store::Attempt;
use serde_json::json;

const TIERS: &[(&str, u64)] = &[("small", 1_000), ("medium", 10_000), ("large", 100_000)];

/// A typing-heavy ledger: mostly edits that grow the file, with pastes,
/// runs and cursor samples mixed in.
fn synthetic_ledger(len: u64) -> Vec<WireEvent> {
    let mut code = String::new();
    (1..=len)
        .map(|seq| {
            let (kind, payload) = match seq % 10 {
                0 => ("run", json!({})),
                3 => ("paste", json!({"size": seq % 300})),
                5 | 7 => ("cursor", json!({"line": seq % 40, "column": seq % 80})),
                _ => {
                    code.push(char::from(b'a' + u8::try_from(seq % 26).unwrap_or(0)));
                    if code.len() > 4_000 {
                        code.clear();
                    }
                    ("edit", json!({"fullCode": code}))
                }
            };
            WireEvent {
                t: f64::from(u32::try_from(seq).unwrap_or(u32::MAX)) * 0.25,
                seq,
                kind: kind.to_string(),
                file_path: if seq % 50 == 0 { Some("util.py".into()) } else { None },
                payload_json: payload.to_string(),
            }
        })
        .collect()
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    let starter = FileMap::from([("main.py".to_string(), String::new())]);

    for &(name, len) in TIERS {
        let ledger = synthetic_ledger(len);
        group.throughput(Throughput::Elements(len));

        group.bench_with_input(BenchmarkId::new("timeline", name), &ledger, |b, ledger| {
            b.iter(|| black_box(Timeline::from_wire(ledger)));
        });

        let timeline = Timeline::from_wire(&ledger);
        group.bench_with_input(BenchmarkId::new("reconstruct_mid", name), &timeline, |b, t| {
            b.iter(|| black_box(reconstruct_at_sequence(t, &starter, "main.py", len / 2)));
        });

        group.bench_with_input(BenchmarkId::new("meaningful_index", name), &timeline, |b, t| {
            b.iter(|| black_box(t.meaningful_sequences("main.py")));
        });

        let attempt = Attempt {
            id: 1,
            assignment_id: None,
            started_at: chrono::Utc::now(),
            finished_at: None,
            starter_state: starter.clone(),
            final_state: None,
        };
        let config = MetricsConfig::default();
        group.bench_with_input(BenchmarkId::new("metrics", name), &timeline, |b, t| {
            b.iter(|| black_box(metrics::compute(t, &attempt, chrono::Utc::now(), &config)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_replay);
criterion_main!(benches);
