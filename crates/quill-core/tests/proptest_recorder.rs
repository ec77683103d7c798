use proptest::prelude::*;
use quill_core::clock::ManualClock;
use quill_core::config::{LogLevel, ProjectConfig};
use quill_core::event::{EventPayload, Extra, PasteData, RunData};
use quill_core::recorder::SessionRecorder;
use quill_core::store::{EventStore, NewAttempt};
use quill_core::upload::StoreTransport;

#[derive(Debug, Clone)]
enum Action {
    Type(String),
    Paste(usize),
    Run,
    Advance(u64),
    Tick,
    Offline,
    Online,
    Hidden,
    Stop,
    Start,
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        6 => "[a-d]{0,3}".prop_map(Action::Type),
        1 => (0usize..300).prop_map(Action::Paste),
        1 => Just(Action::Run),
        3 => (0u64..3_000).prop_map(Action::Advance),
        2 => Just(Action::Tick),
        1 => Just(Action::Offline),
        1 => Just(Action::Online),
        1 => Just(Action::Hidden),
        1 => Just(Action::Stop),
        1 => Just(Action::Start),
    ]
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(256))]

    /// Whatever the UI does, the stored ledger is gap-free, ordered, and
    /// every sequence the recorder handed out is stored exactly once.
    #[test]
    fn recorder_sequences_are_unique_and_increasing(actions in prop::collection::vec(arb_action(), 0..80)) {
        let store = EventStore::open_in_memory().expect("store");
        let attempt = store.create_attempt(&NewAttempt::default()).expect("attempt");

        let mut config = ProjectConfig::default();
        config.logging.log_level = LogLevel::Verbose;
        config.uploader.max_batch_size = 7;
        let clock = ManualClock::new(0);
        let mut rec = SessionRecorder::new(attempt.id, &config, clock.clone(), StoreTransport::new(&store));
        rec.start_logging();

        let mut content = String::new();
        let mut handed_out: Vec<u64> = Vec::new();

        for action in actions {
            let assigned = match action {
                Action::Type(next) => {
                    let previous = std::mem::replace(&mut content, next.clone());
                    rec.content_changed(None, previous, next)
                }
                Action::Paste(size) => rec.record(
                    EventPayload::Paste(PasteData { size, text: None, extra: Extra::new() }),
                    None,
                ),
                Action::Run => rec.request_run(RunData::default(), None),
                Action::Advance(ms) => {
                    clock.advance(ms);
                    None
                }
                Action::Tick => rec.tick().edit,
                Action::Offline => { rec.set_online(false); None }
                Action::Online => { rec.set_online(true); None }
                Action::Hidden => { rec.visibility_hidden(); None }
                Action::Stop => { rec.stop_logging(); None }
                Action::Start => { rec.start_logging(); None }
            };
            handed_out.extend(assigned);
        }
        rec.set_online(true);
        let report = rec.stop_logging();
        prop_assert_eq!(report.unacknowledged, 0);

        let ring: Vec<u64> = rec.ring().iter().map(|e| e.sequence).collect();
        prop_assert!(ring.windows(2).all(|w| w[0] < w[1]));

        let stored: Vec<u64> = store
            .ledger(attempt.id)
            .expect("ledger")
            .iter()
            .map(|e| e.sequence())
            .collect();
        let expected: Vec<u64> = (1..=report.last_sequence.unwrap_or(0)).collect();
        prop_assert_eq!(&stored, &expected);
        prop_assert!(handed_out.iter().all(|seq| stored.binary_search(seq).is_ok()));
        prop_assert!(store.flags(attempt.id).expect("flags").is_empty());
    }
}
