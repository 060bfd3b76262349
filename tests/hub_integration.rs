//! Integration tests for session fan-out on top of the registry.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use sharewatch::hub::{NotificationHub, ServerMessage, Transport};
use sharewatch::testing::{CountingSubscriptions, RecordingTransport, ScriptedBackend, WaitStep};
use sharewatch::watch::{
    AcquisitionError, ChangeType, RawChange, RetryPolicy, WatchBackend, WatchError, WatchRegistry,
    WatchState, WatchSubscriptions,
};

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    backend: Arc<ScriptedBackend>,
    registry: WatchRegistry,
    counting: Arc<CountingSubscriptions>,
    transport: Arc<RecordingTransport>,
    hub: NotificationHub,
}

fn fixture(max_retries: u32) -> Fixture {
    let backend = ScriptedBackend::new();
    let registry = WatchRegistry::with_policy(
        Arc::clone(&backend) as Arc<dyn WatchBackend>,
        RetryPolicy::fixed(max_retries, Duration::from_millis(1), Duration::from_millis(5)),
        Duration::from_secs(2),
        Duration::from_secs(5),
    );
    let counting = CountingSubscriptions::new(registry.clone());
    let transport = RecordingTransport::new();
    let hub = NotificationHub::new(
        Arc::clone(&counting) as Arc<dyn WatchSubscriptions>,
        Arc::clone(&transport) as Arc<dyn Transport>,
    );
    Fixture {
        backend,
        registry,
        counting,
        transport,
        hub,
    }
}

fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

fn changes(messages: &[ServerMessage]) -> Vec<(ChangeType, Option<String>)> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::DirectoryChanged { change, name, .. } => Some((*change, name.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn test_session_close_releases_every_key_once() {
    let f = fixture(5);
    let k1 = f.hub.key_for("nas", "photos");
    let k2 = f.hub.key_for("nas", "music");
    f.hub.open_session("s1");
    f.hub.subscribe("s1", &k1, "photos").unwrap();
    f.hub.subscribe("s1", &k2, "music").unwrap();

    f.hub.close_session("s1");

    assert_eq!(f.counting.unsubscribes(&k1), 1);
    assert_eq!(f.counting.unsubscribes(&k2), 1);
    assert!(eventually(WAIT, || f.registry.is_empty()));
    assert_eq!(f.backend.closes(&k1), 1);
    assert_eq!(f.backend.closes(&k2), 1);
}

#[test]
fn test_unsubscribe_racing_close_releases_once() {
    let f = fixture(5);
    let key = f.hub.key_for("nas", "photos");
    let rounds = 50;

    for round in 0..rounds {
        let session = format!("s{round}");
        f.hub.open_session(&session);
        f.hub.subscribe(&session, &key, "photos").unwrap();

        let barrier = Barrier::new(2);
        thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                f.hub.unsubscribe(&session, &key);
            });
            scope.spawn(|| {
                barrier.wait();
                f.hub.close_session(&session);
            });
        });
    }

    assert_eq!(f.counting.unsubscribes(&key), rounds);
    assert!(eventually(WAIT, || f.registry.is_empty()));
    assert_eq!(f.backend.opens(&key), f.backend.closes(&key));
}

#[test]
fn test_change_reaches_exactly_the_subscribers_at_dispatch() {
    let f = fixture(5);
    let key = f.hub.key_for("nas", "photos");
    for s in ["a", "b", "c", "late"] {
        f.hub.open_session(s);
    }
    f.hub.subscribe("a", &key, "photos").unwrap();
    f.hub.subscribe("b", &key, "photos").unwrap();
    f.hub.subscribe("c", &key, "photos").unwrap();
    assert!(f.hub.unsubscribe("c", &key));

    f.backend.push(&key, WaitStep::Batch(vec![RawChange::named(ChangeType::Added, "cat.jpg")]));
    assert!(f.transport.wait_for_count("a", 1, WAIT));
    assert!(f.transport.wait_for_count("b", 1, WAIT));

    f.hub.subscribe("late", &key, "photos").unwrap();
    f.backend.push(&key, WaitStep::Batch(vec![RawChange::named(ChangeType::Removed, "cat.jpg")]));
    assert!(f.transport.wait_for_count("late", 1, WAIT));
    assert!(f.transport.wait_for_count("a", 2, WAIT));

    let expected = vec![
        (ChangeType::Added, Some("cat.jpg".to_string())),
        (ChangeType::Removed, Some("cat.jpg".to_string())),
    ];
    assert_eq!(changes(&f.transport.messages("a")), expected);
    assert!(f.transport.wait_for_count("b", 2, WAIT));
    assert_eq!(changes(&f.transport.messages("b")), expected);
    assert!(f.transport.messages("c").is_empty());
    assert_eq!(
        changes(&f.transport.messages("late")),
        vec![(ChangeType::Removed, Some("cat.jpg".to_string()))]
    );
}

#[test]
fn test_broken_transport_does_not_block_other_sessions() {
    let f = fixture(5);
    let key = f.hub.key_for("nas", "photos");
    f.hub.open_session("dead");
    f.hub.open_session("live");
    f.hub.subscribe("dead", &key, "photos").unwrap();
    f.hub.subscribe("live", &key, "photos").unwrap();
    f.transport.break_session("dead");

    f.backend.push(&key, WaitStep::Batch(vec![RawChange::named(ChangeType::Modified, "x")]));
    assert!(f.transport.wait_for_count("live", 1, WAIT));
    assert!(f.transport.messages("dead").is_empty());
}

#[test]
fn test_exhausted_retries_notify_every_session_once_and_release() {
    let f = fixture(5);
    let key = f.hub.key_for("nas", "photos");
    for s in ["a", "b"] {
        f.hub.open_session(s);
        f.hub.subscribe(s, &key, "Photos").unwrap();
    }
    for _ in 0..4 {
        f.backend
            .fail_next_open(&key, AcquisitionError::ConnectionFailed("share offline".into()));
    }
    f.backend.push(&key, WaitStep::Fail(WatchError::Transient("connection reset".into())));

    for s in ["a", "b"] {
        assert!(f.transport.wait_for_count(s, 1, WAIT));
    }
    thread::sleep(Duration::from_millis(50));
    for s in ["a", "b"] {
        let messages = f.transport.messages(s);
        assert_eq!(messages.len(), 1);
        let ServerMessage::MonitoringLost {
            connection_id,
            path,
            reason,
        } = &messages[0]
        else {
            panic!("expected monitoringLost, got {:?}", messages[0]);
        };
        assert_eq!(connection_id, "nas");
        assert_eq!(path, "Photos");
        assert!(reason.contains("share offline"));
        assert!(f.hub.subscriptions(s).is_empty());
    }

    assert!(eventually(WAIT, || f.registry.is_empty()));
    assert_eq!(f.backend.live(&key), 0);
}

#[test]
fn test_errored_entry_rearmed_by_fresh_subscribe() {
    let f = fixture(5);
    let key = f.hub.key_for("nas", "photos");
    let handle = f
        .counting
        .registry()
        .subscribe(&key, sharewatch::testing::RecordingListener::new())
        .unwrap();
    f.backend.push(&key, WaitStep::Fail(WatchError::Permanent("deleted".into())));
    assert!(eventually(WAIT, || f
        .registry
        .entry(&key)
        .is_some_and(|e| e.state == WatchState::Errored)));

    f.hub.open_session("s1");
    f.hub.subscribe("s1", &key, "photos").unwrap();
    let entry = f.registry.entry(&key).unwrap();
    assert_eq!(entry.state, WatchState::Watching);
    assert_eq!(entry.refcount, 2);
    assert_eq!(f.backend.opens(&key), 2);
    assert_eq!(f.backend.live(&key), 1);

    f.counting.registry().unsubscribe(&handle);
    f.hub.close_session("s1");
    assert!(eventually(WAIT, || f.registry.is_empty()));
}

#[derive(Debug, Clone)]
enum Op {
    Subscribe(usize, usize),
    Unsubscribe(usize, usize),
    Close(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..4usize, 0..2usize).prop_map(|(s, k)| Op::Subscribe(s, k)),
        2 => (0..4usize, 0..2usize).prop_map(|(s, k)| Op::Unsubscribe(s, k)),
        1 => (0..4usize).prop_map(Op::Close),
    ]
}

/// One step of a single session's script when sessions run concurrently.
#[derive(Debug, Clone, Copy)]
enum SessionOp {
    Subscribe(usize),
    Unsubscribe(usize),
    Reconnect,
}

fn session_op() -> impl Strategy<Value = SessionOp> {
    prop_oneof![
        3 => (0..2usize).prop_map(SessionOp::Subscribe),
        2 => (0..2usize).prop_map(SessionOp::Unsubscribe),
        1 => Just(SessionOp::Reconnect),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_refcount_matches_subscribed_sessions(ops in prop::collection::vec(op(), 1..40)) {
        let f = fixture(5);
        let keys = [f.hub.key_for("nas", "a"), f.hub.key_for("nas", "b")];
        let sessions: Vec<String> = (0..4).map(|i| format!("s{i}")).collect();
        for s in &sessions {
            f.hub.open_session(s);
        }

        for op in ops {
            match op {
                Op::Subscribe(s, k) => {
                    f.hub.subscribe(&sessions[s], &keys[k], "p").unwrap();
                }
                Op::Unsubscribe(s, k) => {
                    f.hub.unsubscribe(&sessions[s], &keys[k]);
                }
                Op::Close(s) => {
                    f.hub.close_session(&sessions[s]);
                    f.hub.open_session(&sessions[s]);
                }
            }

            for key in &keys {
                let subscribed: HashSet<_> = sessions
                    .iter()
                    .filter(|s| f.hub.subscriptions(s).contains(key))
                    .collect();
                let refcount = f.registry.entry(key).map_or(0, |e| e.refcount);
                prop_assert_eq!(refcount, subscribed.len());
                if !subscribed.is_empty() {
                    prop_assert_eq!(f.backend.live(key), 1);
                }
                prop_assert!(f.backend.max_live(key) <= 1);
            }
        }

        let report = f.registry.shutdown();
        prop_assert_eq!(report.abandoned, 0);
        for key in &keys {
            prop_assert_eq!(f.backend.live(key), 0);
            prop_assert_eq!(f.backend.opens(key), f.backend.closes(key));
        }
    }

    #[test]
    fn prop_concurrent_sessions_keep_refcount_consistent(
        scripts in prop::collection::vec(prop::collection::vec(session_op(), 1..30), 4)
    ) {
        let f = fixture(5);
        let keys = [f.hub.key_for("nas", "a"), f.hub.key_for("nas", "b")];
        let sessions: Vec<String> = (0..scripts.len()).map(|i| format!("s{i}")).collect();
        for s in &sessions {
            f.hub.open_session(s);
        }

        let barrier = Barrier::new(scripts.len());
        thread::scope(|scope| {
            for (session, script) in sessions.iter().zip(&scripts) {
                let (f, keys, barrier) = (&f, &keys, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    for op in script {
                        match *op {
                            SessionOp::Subscribe(k) => {
                                f.hub.subscribe(session, &keys[k], "p").unwrap();
                            }
                            SessionOp::Unsubscribe(k) => {
                                f.hub.unsubscribe(session, &keys[k]);
                            }
                            SessionOp::Reconnect => {
                                f.hub.close_session(session);
                                f.hub.open_session(session);
                            }
                        }
                    }
                });
            }
        });

        for key in &keys {
            let subscribed = sessions
                .iter()
                .filter(|s| f.hub.subscriptions(s).contains(key))
                .count();
            let refcount = f.registry.entry(key).map_or(0, |e| e.refcount);
            prop_assert_eq!(refcount, subscribed);
            if subscribed > 0 {
                prop_assert_eq!(f.backend.live(key), 1);
            } else {
                prop_assert!(f.backend.wait_until_released(key, WAIT));
            }
            prop_assert!(f.backend.max_live(key) <= 1);
        }

        let report = f.registry.shutdown();
        prop_assert_eq!(report.abandoned, 0);
        for key in &keys {
            prop_assert_eq!(f.backend.live(key), 0);
            prop_assert_eq!(f.backend.opens(key), f.backend.closes(key));
        }
    }
}
