#![allow(dead_code)]

use std::sync::Arc;

use model_watcher::{InMemoryConnection, WatchHandle, WatchState, WatcherConfig, WatcherId};
use serde_json::{json, Value};

pub fn unit_change(name: &str) -> Value {
    let application = name.split('/').next().unwrap_or(name);
    json!(["unit", "change", {"name": name, "application": application}])
}

pub fn unit_remove(name: &str) -> Value {
    json!(["unit", "remove", {"name": name}])
}

/// Yields to the session tasks until `done` holds.
pub async fn until(mut done: impl FnMut() -> bool) {
    while !done() {
        tokio::task::yield_now().await;
    }
}

pub async fn wait_for_sequence(handle: &WatchHandle, sequence: u64) -> WatchState {
    let mut rx = handle.subscribe();
    let state = rx
        .wait_for(|state| state.sequence >= sequence)
        .await
        .expect("session state channel closed")
        .clone();
    state
}

/// Starts a session and waits until its first `Next` is outstanding.
pub async fn ready_session(
    conn: &Arc<InMemoryConnection>,
    model_uuid: &str,
    config: WatcherConfig,
) -> (WatchHandle, WatcherId) {
    let handle = WatchHandle::start(conn.clone(), model_uuid, config);
    handle
        .subscribe()
        .wait_for(|state| state.ready())
        .await
        .expect("session state channel closed");
    let watcher = conn
        .watcher_for(model_uuid)
        .expect("ready session has a watcher");
    until(|| conn.next_in_flight(&watcher)).await;
    (handle, watcher)
}
