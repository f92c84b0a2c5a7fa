mod common;

use std::time::Duration;

use common::{ready_session, unit_change, unit_remove, until, wait_for_sequence};
use model_watcher::{
    CallError, EntityKind, InMemoryConnection, SessionPhase, WatchEvent, WatcherConfig,
};
use serde_json::json;

#[test_timeout::tokio_timeout_test]
async fn change_then_remove_tracks_a_unit() {
    let conn = InMemoryConnection::new();
    let (handle, _) = ready_session(&conn, "abc123", WatcherConfig::default()).await;

    conn.push_batch("abc123", vec![unit_change("etcd/0")]);
    let state = wait_for_sequence(&handle, 1).await;
    assert!(state.ready());
    assert_eq!(state.snapshot.len(), 1);
    assert!(state.snapshot.lookup(EntityKind::Unit, "etcd/0").is_some());
    assert_eq!(state.last_batch.len(), 1);
    assert_eq!(state.view().unit_count("etcd"), 1);

    conn.push_batch("abc123", vec![unit_remove("etcd/0")]);
    let state = wait_for_sequence(&handle, 2).await;
    assert!(state.snapshot.is_empty());
    assert!(state.ready());

    handle.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn transport_failure_errors_the_session() {
    let conn = InMemoryConnection::new();
    let (handle, watcher) = ready_session(&conn, "abc123", WatcherConfig::default()).await;
    assert!(handle.heartbeat_running());

    conn.push_error("abc123", CallError::Transport("connection reset".into()));
    let state = handle.wait_terminal().await;

    assert_eq!(state.phase, SessionPhase::Errored);
    assert!(!state.ready());
    assert!(state.error.as_ref().is_some_and(|err| err.is_connection()));
    assert!(!handle.heartbeat_running());

    handle.stop().await;
    assert_eq!(conn.next_calls(&watcher), 1);
    assert_eq!(conn.stopped_watchers(), vec![watcher]);
}

#[test_timeout::tokio_timeout_test]
async fn failed_session_closes_its_watcher_on_its_own() {
    let conn = InMemoryConnection::new();
    let (handle, watcher) = ready_session(&conn, "abc123", WatcherConfig::default()).await;

    conn.push_error("abc123", CallError::Transport("reset".into()));
    until(|| handle.is_finished()).await;

    assert_eq!(handle.phase(), SessionPhase::Errored);
    assert_eq!(conn.stopped_watchers(), vec![watcher.clone()]);

    handle.stop().await;
    assert_eq!(conn.stopped_watchers(), vec![watcher]);
}

#[test_timeout::tokio_timeout_test]
async fn stop_discards_the_pending_poll() {
    let conn = InMemoryConnection::new();
    let (handle, watcher) = ready_session(&conn, "abc123", WatcherConfig::default()).await;

    handle.stop().await;
    assert!(!conn.next_in_flight(&watcher));

    conn.push_batch("abc123", vec![unit_change("etcd/0")]);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    let state = handle.state();
    assert_eq!(state.phase, SessionPhase::Stopped);
    assert_eq!(state.sequence, 0);
    assert!(state.snapshot.is_empty());
    assert_eq!(state.error, None);

    handle.stop().await;
    handle.cancel();
    assert_eq!(conn.stopped_watchers(), vec![watcher.clone()]);
    assert_eq!(conn.next_calls(&watcher), 1);
}

#[test_timeout::tokio_timeout_test]
async fn sessions_are_independent() {
    let conn = InMemoryConnection::new();
    let (m1, w1) = ready_session(&conn, "m1", WatcherConfig::default()).await;
    let (m2, w2) = ready_session(&conn, "m2", WatcherConfig::default()).await;

    conn.push_batch("m1", vec![unit_change("mysql/0")]);
    conn.push_batch("m2", vec![unit_change("etcd/0")]);
    wait_for_sequence(&m1, 1).await;
    wait_for_sequence(&m2, 1).await;

    m1.stop().await;
    assert_eq!(m1.phase(), SessionPhase::Stopped);
    assert!(!m1.heartbeat_running());

    conn.push_batch("m2", vec![unit_change("etcd/1")]);
    let state = wait_for_sequence(&m2, 2).await;
    assert!(state.ready());
    assert_eq!(state.snapshot.len(), 2);
    assert!(m2.heartbeat_running());
    assert_eq!(m1.snapshot().len(), 1);
    assert_eq!(conn.stopped_watchers(), vec![w1]);

    m2.stop().await;
    assert_eq!(conn.stopped_watchers().last(), Some(&w2));
}

#[test_timeout::tokio_timeout_test]
async fn never_polls_twice_at_once() {
    let conn = InMemoryConnection::new();
    let (handle, watcher) = ready_session(&conn, "abc123", WatcherConfig::default()).await;

    for i in 0..20 {
        conn.push_batch("abc123", vec![unit_change(&format!("etcd/{i}"))]);
    }
    let state = wait_for_sequence(&handle, 20).await;
    assert_eq!(state.snapshot.len(), 20);
    assert_eq!(conn.overlapping_next_calls(), 0);
    assert!(conn.next_calls(&watcher) >= 20);

    handle.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn empty_batches_publish_nothing() {
    let conn = InMemoryConnection::new();
    let (handle, watcher) = ready_session(&conn, "abc123", WatcherConfig::default()).await;

    conn.push_batch("abc123", vec![]);
    until(|| conn.next_calls(&watcher) == 2 && conn.next_in_flight(&watcher)).await;
    assert_eq!(handle.state().sequence, 0);

    handle.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn undecodable_batch_is_a_protocol_error() {
    let conn = InMemoryConnection::new();
    let (handle, _) = ready_session(&conn, "abc123", WatcherConfig::default()).await;

    conn.push_batch("abc123", vec![json!(["unit", "explode", {"name": "etcd/0"}])]);
    let state = handle.wait_terminal().await;
    assert_eq!(state.phase, SessionPhase::Errored);
    assert!(state.error.as_ref().is_some_and(|err| err.is_protocol()));
    assert!(state.snapshot.is_empty());

    handle.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn events_arrive_in_order() {
    let conn = InMemoryConnection::new();
    let (handle, _) = ready_session(&conn, "abc123", WatcherConfig::default()).await;
    let mut events = handle.events();

    conn.push_batch("abc123", vec![unit_change("etcd/0")]);
    conn.push_batch("abc123", vec![unit_remove("etcd/0")]);
    wait_for_sequence(&handle, 2).await;
    handle.stop().await;

    let mut sequences = Vec::new();
    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            WatchEvent::Batch { sequence, .. } => sequences.push(sequence),
            WatchEvent::Phase(phase) => phases.push(phase),
            WatchEvent::Error(err) => panic!("unexpected error {err}"),
        }
    }
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(phases, vec![SessionPhase::Stopped]);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn heartbeat_runs_while_ready() {
    let conn = InMemoryConnection::new();
    let config = WatcherConfig::default().with_ping_interval(Duration::from_secs(1));
    let (handle, _) = ready_session(&conn, "abc123", config).await;

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(conn.pings(), 3);

    conn.fail_pings(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(conn.pings(), 5);
    assert!(handle.ready());
    assert!(handle.heartbeat_running());

    handle.stop().await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(conn.pings(), 5);
}
