#![no_main]

use libfuzzer_sys::fuzz_target;
use quill_core::event::{EventBatch, WireEvent, summary};

// Arbitrary bytes must never panic the wire decoder, and a decoded event
// must survive a trip back to the wire unchanged.
fuzz_target!(|data: &[u8]| {
    if let Ok(batch) = serde_json::from_slice::<EventBatch>(data) {
        for wire in &batch.events {
            check(wire);
        }
    }
    if let Ok(wire) = serde_json::from_slice::<WireEvent>(data) {
        check(&wire);
    }
});

fn check(wire: &WireEvent) {
    let Ok(event) = wire.decode() else {
        return;
    };
    let _ = summary(&event.payload);
    let again = event
        .to_wire()
        .expect("decoded payload re-serializes")
        .decode()
        .expect("re-encoded event decodes");
    assert_eq!(again, event);
}
