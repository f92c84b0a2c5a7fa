mod common;

use std::time::Duration;

use common::{ready_session, until};
use model_watcher::{
    CallError, InMemoryConnection, SessionPhase, WatchError, WatchHandle, WatchRegistry,
    WatcherConfig,
};

#[test_timeout::tokio_timeout_test]
async fn starts_connecting_then_becomes_ready() {
    let conn = InMemoryConnection::new();
    conn.hold_watch_all(true);
    let handle = WatchHandle::start(conn.clone(), "abc123", WatcherConfig::default());
    assert_eq!(handle.phase(), SessionPhase::Connecting);
    assert_eq!(handle.model_uuid(), "abc123");
    assert!(!handle.ready());

    conn.hold_watch_all(false);
    handle
        .subscribe()
        .wait_for(|state| state.ready())
        .await
        .unwrap();
    assert!(handle.heartbeat_running());
    assert_eq!(handle.error(), None);

    handle.stop().await;
    assert!(handle.is_finished());
}

#[test_timeout::tokio_timeout_test]
async fn failed_start_errors_without_heartbeat() {
    let conn = InMemoryConnection::new();
    conn.reject_model(
        "abc123",
        CallError::Rejected {
            request: "Client.WatchAll".into(),
            message: "model not found".into(),
            code: Some("not found".into()),
        },
    );

    let handle = WatchHandle::start(conn.clone(), "abc123", WatcherConfig::default());
    let state = handle.wait_terminal().await;
    assert_eq!(state.phase, SessionPhase::Errored);
    assert!(state.error.as_ref().is_some_and(|err| err.is_protocol()));
    assert!(!handle.heartbeat_running());

    handle.stop().await;
    assert!(conn.stopped_watchers().is_empty());
    assert_eq!(conn.pings(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn closed_connection_is_a_connection_error() {
    let conn = InMemoryConnection::new();
    conn.close();
    let handle = WatchHandle::start(conn.clone(), "abc123", WatcherConfig::default());
    let state = handle.wait_terminal().await;
    assert!(state.error.as_ref().is_some_and(|err| err.is_connection()));
}

#[test_timeout::tokio_timeout_test]
async fn blank_model_is_rejected_without_a_call() {
    let conn = InMemoryConnection::new();
    let handle = WatchHandle::start(conn.clone(), "", WatcherConfig::default());
    let state = handle.wait_terminal().await;
    assert_eq!(state.error, Some(WatchError::InvalidModel(String::new())));
    assert_eq!(conn.watch_all_calls(""), 0);
}

#[test_timeout::tokio_timeout_test]
async fn stop_while_connecting_closes_the_late_watcher() {
    let conn = InMemoryConnection::new();
    conn.hold_watch_all(true);
    let handle = WatchHandle::start(conn.clone(), "abc123", WatcherConfig::default());

    handle.cancel();
    assert_eq!(handle.phase(), SessionPhase::Stopped);

    conn.hold_watch_all(false);
    handle.stop().await;

    let watcher = conn.watcher_for("abc123").unwrap();
    assert_eq!(conn.stopped_watchers(), vec![watcher.clone()]);
    assert_eq!(conn.next_calls(&watcher), 0);
    assert!(!handle.heartbeat_running());
    assert_eq!(handle.phase(), SessionPhase::Stopped);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn stuck_watch_all_is_abandoned_after_the_stop_timeout() {
    let conn = InMemoryConnection::new();
    conn.hold_watch_all(true);
    let config = WatcherConfig::default().with_stop_timeout(Duration::from_secs(2));
    let handle = WatchHandle::start(conn.clone(), "abc123", config);

    let started = tokio::time::Instant::now();
    handle.stop().await;
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(handle.is_finished());
    assert_eq!(conn.watch_all_calls("abc123"), 0);
}

#[test_timeout::tokio_timeout_test]
async fn dropping_the_last_handle_stops_the_session() {
    let conn = InMemoryConnection::new();
    let (handle, watcher) = ready_session(&conn, "abc123", WatcherConfig::default()).await;
    let clone = handle.clone();

    drop(handle);
    assert_eq!(clone.phase(), SessionPhase::Ready);

    drop(clone);
    until(|| conn.stopped_watchers().len() == 1).await;
    assert_eq!(conn.stopped_watchers(), vec![watcher.clone()]);
    assert!(!conn.next_in_flight(&watcher));
}

#[test_timeout::tokio_timeout_test]
async fn stopping_an_errored_session_keeps_the_error() {
    let conn = InMemoryConnection::new();
    let (handle, _) = ready_session(&conn, "abc123", WatcherConfig::default()).await;
    conn.push_error("abc123", CallError::Unauthenticated);
    until(|| handle.is_finished()).await;
    assert_eq!(conn.stopped_watchers().len(), 1);

    handle.stop().await;
    handle.stop().await;
    let state = handle.state();
    assert_eq!(state.phase, SessionPhase::Stopped);
    assert!(state.error.as_ref().is_some_and(|err| err.is_connection()));
    assert_eq!(conn.stopped_watchers().len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn registry_restarts_after_an_error() {
    let conn = InMemoryConnection::new();
    let registry = WatchRegistry::new(conn.clone(), WatcherConfig::default());

    let first = registry.watch("abc123");
    first.subscribe().wait_for(|state| state.ready()).await.unwrap();
    let watcher = conn.watcher_for("abc123").unwrap();
    until(|| conn.next_in_flight(&watcher)).await;
    conn.push_error("abc123", CallError::Transport("reset".into()));
    first.wait_terminal().await;

    let second = registry.watch("abc123");
    second.subscribe().wait_for(|state| state.ready()).await.unwrap();
    assert_eq!(conn.watch_all_calls("abc123"), 2);
    assert_eq!(registry.active_models(), vec!["abc123".to_string()]);

    registry.stop_all().await;
    assert!(second.is_finished());
}
