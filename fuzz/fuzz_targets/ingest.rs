#![no_main]

use libfuzzer_sys::fuzz_target;
use quill_core::event::EventBatch;
use quill_core::store::{EventStore, NewAttempt};

// Ingest an arbitrary batch twice: the store either rejects it whole or
// accepts it, and a resend of an accepted batch adds no rows.
fuzz_target!(|data: &[u8]| {
    let Ok(mut batch) = serde_json::from_slice::<EventBatch>(data) else {
        return;
    };
    let store = EventStore::open_in_memory().expect("in-memory store");
    let attempt = store
        .create_attempt(&NewAttempt::default())
        .expect("create attempt");
    batch.attempt_id = attempt.id;

    let Ok(first) = store.ingest(&batch) else {
        assert_eq!(store.event_count(attempt.id).expect("count"), 0);
        return;
    };
    let stored = store.event_count(attempt.id).expect("count");
    assert_eq!(stored, first.inserted);

    let again = store.ingest(&batch).expect("resend of accepted batch");
    assert_eq!(again.inserted, 0);
    assert_eq!(store.event_count(attempt.id).expect("count"), stored);

    store
        .check_integrity(attempt.id, "main.py")
        .expect("integrity scan");
});
