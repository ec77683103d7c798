#![no_main]

use libfuzzer_sys::fuzz_target;
use quill_core::FileMap;
use quill_core::event::WireEvent;
use quill_core::replay::{Timeline, reconstruct_at_sequence, reconstruct_final};

const DEFAULT_FILE: &str = "main.py";

// Any ledger, however malformed its payloads, must replay without panicking,
// and every meaningful step must land on the state a forward replay reaches.
fuzz_target!(|data: &[u8]| {
    let Ok(events) = serde_json::from_slice::<Vec<WireEvent>>(data) else {
        return;
    };
    let timeline = Timeline::from_wire(&events);
    let starter = FileMap::from([(DEFAULT_FILE.to_string(), String::new())]);

    let last = reconstruct_final(&timeline, &starter, DEFAULT_FILE);
    for seq in timeline.meaningful_sequences(DEFAULT_FILE) {
        let snapshot = reconstruct_at_sequence(&timeline, &starter, DEFAULT_FILE, seq)
            .expect("meaningful sequences are in range");
        assert_eq!(snapshot.at_sequence, Some(seq));
    }
    if let Some(seq) = timeline.last_sequence() {
        let snapshot = reconstruct_at_sequence(&timeline, &starter, DEFAULT_FILE, seq)
            .expect("last sequence is in range");
        assert_eq!(snapshot.files, last);
    }
});
