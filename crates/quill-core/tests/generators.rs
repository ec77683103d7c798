#![allow(dead_code)]

use proptest::prelude::*;
use quill_core::FileMap;
use quill_core::event::WireEvent;
use serde_json::json;

pub const FILES: &[Option<&str>] = &[None, Some("main.py"), Some("util.py")];

/// Payload JSON for one kind, sometimes deliberately malformed.
fn arb_body() -> impl Strategy<Value = (String, String)> {
    prop_oneof![
        4 => "[a-c]{0,6}".prop_map(|code| ("edit".to_string(), json!({"fullCode": code}).to_string())),
        1 => (0usize..400).prop_map(|size| ("paste".to_string(), json!({"size": size}).to_string())),
        1 => Just(("paste".to_string(), json!({"size": u64::MAX}).to_string())),
        1 => Just(("run".to_string(), "{}".to_string())),
        1 => (0u32..50, 0u32..80).prop_map(|(line, column)| {
            ("cursor".to_string(), json!({"line": line, "column": column}).to_string())
        }),
        1 => Just(("ai_prompt".to_string(), json!({"prompt": "why"}).to_string())),
        1 => Just(("ai_response".to_string(), json!({"response": "because"}).to_string())),
        1 => Just(("edit".to_string(), json!({"code": "missing fullCode"}).to_string())),
        1 => Just(("scroll".to_string(), "{}".to_string())),
        1 => Just(("paste".to_string(), "not json".to_string())),
    ]
}

/// A gap-free ledger with non-decreasing times.
pub fn arb_ledger(max_len: usize) -> impl Strategy<Value = Vec<WireEvent>> {
    prop::collection::vec((arb_body(), 0usize..FILES.len(), 0u32..45_000), 0..max_len).prop_map(
        |items| {
            let mut t = 0.0;
            items
                .into_iter()
                .zip(1u64..)
                .map(|(((kind, payload_json), file, gap_ms), seq)| {
                    t += f64::from(gap_ms) / 1_000.0;
                    WireEvent {
                        t,
                        seq,
                        kind,
                        file_path: FILES[file].map(str::to_string),
                        payload_json,
                    }
                })
                .collect()
        },
    )
}

pub fn arb_starter() -> impl Strategy<Value = FileMap> {
    prop::collection::btree_map(
        prop_oneof![Just("main.py".to_string()), Just("util.py".to_string())],
        "[a-c]{0,4}",
        0..3,
    )
}
