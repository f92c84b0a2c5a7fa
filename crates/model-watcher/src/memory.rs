//! In-memory controller for tests and local wiring.
//!
//! Each model gets a queue of scripted `Next` replies. A `Next` on an empty
//! queue stays pending like a real long poll until something is pushed or the
//! caller drops the future.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::connection::{ControllerConnection, WatcherId};
use crate::error::CallError;

type Reply = Result<Vec<Value>, CallError>;

struct ModelQueue {
    tx: mpsc::UnboundedSender<Reply>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Reply>>>,
}

impl ModelQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

struct WatcherSlot {
    model_uuid: String,
    stopped: bool,
    next_calls: usize,
    in_flight: bool,
}

#[derive(Default)]
struct Inner {
    closed: bool,
    queues: HashMap<String, ModelQueue>,
    watchers: HashMap<WatcherId, WatcherSlot>,
    rejected: HashMap<String, CallError>,
    watch_all_calls: HashMap<String, usize>,
    stopped: Vec<WatcherId>,
    overlapping_next: usize,
    next_watcher: u64,
}

impl Inner {
    fn queue(&mut self, model_uuid: &str) -> &ModelQueue {
        self.queues
            .entry(model_uuid.to_string())
            .or_insert_with(ModelQueue::new)
    }
}

pub struct InMemoryConnection {
    inner: Mutex<Inner>,
    watch_all_open: watch::Sender<bool>,
    pings: AtomicU64,
    failing_pings: AtomicBool,
}

impl InMemoryConnection {
    pub fn new() -> Arc<Self> {
        let (watch_all_open, _) = watch::channel(true);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            watch_all_open,
            pings: AtomicU64::new(0),
            failing_pings: AtomicBool::new(false),
        })
    }

    /// Queues one `Next` reply of raw `[kind, operation, payload]` triples.
    pub fn push_batch(&self, model_uuid: &str, deltas: Vec<Value>) {
        let mut inner = self.inner.lock();
        let _ = inner.queue(model_uuid).tx.send(Ok(deltas));
    }

    /// Queues a failing `Next` reply.
    pub fn push_error(&self, model_uuid: &str, error: CallError) {
        let mut inner = self.inner.lock();
        let _ = inner.queue(model_uuid).tx.send(Err(error));
    }

    /// Makes `WatchAll` for `model_uuid` fail with `error`.
    pub fn reject_model(&self, model_uuid: &str, error: CallError) {
        self.inner
            .lock()
            .rejected
            .insert(model_uuid.to_string(), error);
    }

    /// While held, `WatchAll` calls stay pending.
    pub fn hold_watch_all(&self, held: bool) {
        self.watch_all_open.send_replace(!held);
    }

    /// Every later call fails with [`CallError::Closed`].
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    pub fn fail_pings(&self, failing: bool) {
        self.failing_pings.store(failing, Ordering::SeqCst);
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn watch_all_calls(&self, model_uuid: &str) -> usize {
        self.inner
            .lock()
            .watch_all_calls
            .get(model_uuid)
            .copied()
            .unwrap_or(0)
    }

    /// Most recently issued watcher for `model_uuid`.
    pub fn watcher_for(&self, model_uuid: &str) -> Option<WatcherId> {
        let inner = self.inner.lock();
        inner
            .watchers
            .iter()
            .filter(|(_, slot)| slot.model_uuid == model_uuid)
            .max_by_key(|(id, _)| id.as_str().parse::<u64>().unwrap_or(0))
            .map(|(id, _)| id.clone())
    }

    pub fn next_calls(&self, watcher: &WatcherId) -> usize {
        self.inner
            .lock()
            .watchers
            .get(watcher)
            .map(|slot| slot.next_calls)
            .unwrap_or(0)
    }

    pub fn next_in_flight(&self, watcher: &WatcherId) -> bool {
        self.inner
            .lock()
            .watchers
            .get(watcher)
            .map(|slot| slot.in_flight)
            .unwrap_or(false)
    }

    /// Times a `Next` was issued while another was still outstanding on the
    /// same watcher.
    pub fn overlapping_next_calls(&self) -> usize {
        self.inner.lock().overlapping_next
    }

    /// Watchers that received `Stop`, in call order, duplicates included.
    pub fn stopped_watchers(&self) -> Vec<WatcherId> {
        self.inner.lock().stopped.clone()
    }
}

/// Clears the in-flight mark when a `Next` completes or is dropped.
struct InFlight<'a> {
    connection: &'a InMemoryConnection,
    watcher: &'a WatcherId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.connection.inner.lock().watchers.get_mut(self.watcher) {
            slot.in_flight = false;
        }
    }
}

#[async_trait]
impl ControllerConnection for InMemoryConnection {
    async fn watch_all(&self, model_uuid: &str) -> Result<WatcherId, CallError> {
        let mut open = self.watch_all_open.subscribe();
        let _ = open.wait_for(|open| *open).await;

        let mut inner = self.inner.lock();
        *inner
            .watch_all_calls
            .entry(model_uuid.to_string())
            .or_default() += 1;
        if inner.closed {
            return Err(CallError::Closed);
        }
        if let Some(err) = inner.rejected.get(model_uuid) {
            return Err(err.clone());
        }

        inner.next_watcher += 1;
        let id = WatcherId::new(inner.next_watcher.to_string());
        inner.queue(model_uuid);
        inner.watchers.insert(
            id.clone(),
            WatcherSlot {
                model_uuid: model_uuid.to_string(),
                stopped: false,
                next_calls: 0,
                in_flight: false,
            },
        );
        Ok(id)
    }

    async fn next(&self, watcher: &WatcherId) -> Result<Vec<Value>, CallError> {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(CallError::Closed);
            }
            let Some(slot) = inner.watchers.get_mut(watcher) else {
                return Err(CallError::Rejected {
                    request: "AllWatcher.Next".into(),
                    message: format!("unknown watcher {watcher}"),
                    code: Some("not found".into()),
                });
            };
            if slot.stopped {
                return Err(CallError::Rejected {
                    request: "AllWatcher.Next".into(),
                    message: format!("watcher {watcher} was stopped"),
                    code: Some("stopped".into()),
                });
            }
            slot.next_calls += 1;
            let overlapping = slot.in_flight;
            slot.in_flight = true;
            let model_uuid = slot.model_uuid.clone();
            if overlapping {
                inner.overlapping_next += 1;
            }
            inner.queue(&model_uuid).rx.clone()
        };

        let _in_flight = InFlight {
            connection: self,
            watcher,
        };
        let mut rx = rx.lock().await;
        match rx.recv().await {
            Some(reply) => reply,
            None => Err(CallError::Closed),
        }
    }

    async fn stop(&self, watcher: &WatcherId) -> Result<(), CallError> {
        let mut inner = self.inner.lock();
        inner.stopped.push(watcher.clone());
        if inner.closed {
            return Err(CallError::Closed);
        }
        match inner.watchers.get_mut(watcher) {
            Some(slot) => {
                slot.stopped = true;
                Ok(())
            }
            None => Err(CallError::Rejected {
                request: "AllWatcher.Stop".into(),
                message: format!("unknown watcher {watcher}"),
                code: Some("not found".into()),
            }),
        }
    }

    async fn ping(&self) -> Result<(), CallError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.inner.lock().closed {
            return Err(CallError::Closed);
        }
        if self.failing_pings.load(Ordering::SeqCst) {
            return Err(CallError::Transport("ping timed out".into()));
        }
        Ok(())
    }
}
