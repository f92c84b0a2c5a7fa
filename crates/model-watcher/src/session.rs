//! Watch session lifecycle.
//!
//! Each session owns one driver task that starts the remote all-watcher,
//! brings up the heartbeat, then long-polls `Next` until it is stopped or the
//! controller fails it. Publication and cancellation both go through the
//! session's state channel lock, so a batch is either published before a stop
//! or never at all.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::WatcherConfig;
use crate::connection::{SharedConnection, WatcherId};
use crate::delta::DeltaBatch;
use crate::error::WatchError;
use crate::heartbeat::Heartbeat;
use crate::snapshot::{apply, Snapshot};
use crate::starter::start_watch;
use crate::view::ModelView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Ready,
    Stopped,
    Errored,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Stopped | SessionPhase::Errored)
    }
}

/// Everything a consumer renders for one watched model.
#[derive(Debug, Clone)]
pub struct WatchState {
    pub model_uuid: Arc<str>,
    pub phase: SessionPhase,
    pub snapshot: Snapshot,
    pub last_batch: Arc<DeltaBatch>,
    pub error: Option<WatchError>,
    /// Number of batches applied so far.
    pub sequence: u64,
}

impl WatchState {
    fn new(model_uuid: Arc<str>) -> Self {
        Self {
            model_uuid,
            phase: SessionPhase::Idle,
            snapshot: Snapshot::new(),
            last_batch: Arc::new(DeltaBatch::default()),
            error: None,
            sequence: 0,
        }
    }

    pub fn ready(&self) -> bool {
        self.phase == SessionPhase::Ready
    }

    pub fn view(&self) -> ModelView {
        ModelView::from_snapshot(&self.snapshot)
    }
}

/// Ordered change notifications. Unlike the state channel these are never
/// coalesced; a subscriber that falls behind gets `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Phase(SessionPhase),
    Batch {
        sequence: u64,
        batch: Arc<DeltaBatch>,
        snapshot: Snapshot,
    },
    Error(WatchError),
}

struct SessionShared {
    model_uuid: Arc<str>,
    connection: SharedConnection,
    config: WatcherConfig,
    cancel: CancellationToken,
    state: watch::Sender<WatchState>,
    events: broadcast::Sender<WatchEvent>,
    watcher: Mutex<Option<WatcherId>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    finished: watch::Sender<bool>,
}

impl SessionShared {
    fn new(connection: SharedConnection, model_uuid: Arc<str>, config: WatcherConfig) -> Self {
        let (state, _) = watch::channel(WatchState::new(model_uuid.clone()));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (finished, _) = watch::channel(false);
        Self {
            model_uuid,
            connection,
            config,
            cancel: CancellationToken::new(),
            state,
            events,
            watcher: Mutex::new(None),
            heartbeat: Mutex::new(None),
            finished,
        }
    }

    fn emit(&self, event: WatchEvent) {
        // No subscribers is fine; the state channel still carries the value.
        let _ = self.events.send(event);
    }

    /// Moves to `phase` unless the session has already been cancelled.
    fn advance(&self, phase: SessionPhase) -> bool {
        self.state.send_if_modified(|state| {
            if self.cancel.is_cancelled() {
                return false;
            }
            state.phase = phase;
            self.emit(WatchEvent::Phase(phase));
            true
        })
    }

    fn publish_batch(&self, batch: DeltaBatch) -> bool {
        // Only the driver task replaces the snapshot, so reconciling outside
        // the lock cannot lose an update.
        let current = self.state.borrow().snapshot.clone();
        let snapshot = apply(&current, &batch);
        let batch = Arc::new(batch);

        self.state.send_if_modified(|state| {
            if self.cancel.is_cancelled() {
                return false;
            }
            state.sequence += 1;
            state.snapshot = snapshot.clone();
            state.last_batch = batch.clone();
            state.error = None;
            self.emit(WatchEvent::Batch {
                sequence: state.sequence,
                batch,
                snapshot,
            });
            true
        })
    }

    /// Records a fatal error and cancels loop and heartbeat together. Returns
    /// false when a stop got there first; the error is then dropped.
    fn fail(&self, error: WatchError) -> bool {
        self.state.send_if_modified(|state| {
            if self.cancel.is_cancelled() {
                return false;
            }
            self.cancel.cancel();
            state.phase = SessionPhase::Errored;
            state.error = Some(error.clone());
            self.emit(WatchEvent::Error(error));
            self.emit(WatchEvent::Phase(SessionPhase::Errored));
            true
        })
    }

    fn request_stop(&self) {
        self.state.send_if_modified(|state| {
            self.cancel.cancel();
            if state.phase == SessionPhase::Stopped {
                return false;
            }
            state.phase = SessionPhase::Stopped;
            self.emit(WatchEvent::Phase(SessionPhase::Stopped));
            true
        });
    }

    /// Best-effort remote `Stop`, issued at most once per session.
    async fn close_remote(&self) {
        let Some(watcher) = self.watcher.lock().take() else {
            return;
        };

        match timeout(self.config.stop_timeout(), self.connection.stop(&watcher)).await {
            Ok(Ok(())) => debug!(
                target = "model_watcher::session",
                model_uuid = %self.model_uuid,
                watcher_id = %watcher,
                "remote watcher stopped"
            ),
            Ok(Err(err)) => warn!(
                target = "model_watcher::session",
                model_uuid = %self.model_uuid,
                watcher_id = %watcher,
                error = %err,
                "failed to stop remote watcher"
            ),
            Err(_) => warn!(
                target = "model_watcher::session",
                model_uuid = %self.model_uuid,
                watcher_id = %watcher,
                timeout_ms = self.config.stop_timeout_ms,
                "timed out stopping remote watcher"
            ),
        }
    }

    fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .as_ref()
            .map(|heartbeat| !heartbeat.is_cancelled())
            .unwrap_or(false)
    }
}

/// Marks the session finished however the driver exits.
struct FinishGuard(Arc<SessionShared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.cancel.cancel();
        self.0.finished.send_replace(true);
    }
}

enum LoopExit {
    Cancelled,
    Failed(WatchError),
}

async fn drive(shared: Arc<SessionShared>) {
    let _finish = FinishGuard(shared.clone());

    // A stop during WatchAll still gives the call a bounded grace period so a
    // watcher created on the controller can be closed instead of leaked.
    let started = tokio::select! {
        biased;
        result = start_watch(shared.connection.as_ref(), &shared.model_uuid) => Some(result),
        _ = async {
            shared.cancel.cancelled().await;
            sleep(shared.config.stop_timeout()).await;
        } => None,
    };

    let started = match started {
        Some(Ok(started)) => started,
        Some(Err(err)) => {
            if shared.fail(err.clone()) {
                warn!(
                    target = "model_watcher::session",
                    model_uuid = %shared.model_uuid,
                    error = %err,
                    "watch failed to start"
                );
            }
            return;
        }
        None => {
            warn!(
                target = "model_watcher::session",
                model_uuid = %shared.model_uuid,
                "abandoned pending WatchAll after stop"
            );
            return;
        }
    };

    *shared.watcher.lock() = Some(started.watcher_id.clone());
    if shared.cancel.is_cancelled() {
        debug!(
            target = "model_watcher::session",
            model_uuid = %shared.model_uuid,
            "stopped while connecting; closing new watcher"
        );
        shared.close_remote().await;
        return;
    }

    let heartbeat = Heartbeat::for_session(
        shared.connection.clone(),
        shared.config.ping_interval(),
        shared.cancel.child_token(),
        shared.model_uuid.clone(),
    );
    *shared.heartbeat.lock() = Some(heartbeat);

    if !shared.advance(SessionPhase::Ready) {
        shared.close_remote().await;
        return;
    }
    info!(
        target = "model_watcher::session",
        model_uuid = %shared.model_uuid,
        watcher_id = %started.watcher_id,
        "model watch ready"
    );

    match receive_loop(&shared, &started.watcher_id).await {
        LoopExit::Cancelled => debug!(
            target = "model_watcher::session",
            model_uuid = %shared.model_uuid,
            "receive loop cancelled"
        ),
        LoopExit::Failed(err) => {
            if shared.fail(err.clone()) {
                warn!(
                    target = "model_watcher::session",
                    model_uuid = %shared.model_uuid,
                    error = %err,
                    "receive loop failed; watch stopped"
                );
            }
        }
    }

    shared.close_remote().await;
}

async fn receive_loop(shared: &SessionShared, watcher: &WatcherId) -> LoopExit {
    loop {
        if shared.cancel.is_cancelled() {
            return LoopExit::Cancelled;
        }

        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return LoopExit::Cancelled,
            next = shared.connection.next(watcher) => next,
        };

        let batch = match next.map_err(WatchError::from).and_then(DeltaBatch::decode) {
            Ok(batch) => batch,
            Err(err) => return LoopExit::Failed(err),
        };

        let deltas = batch.len();
        if deltas == 0 {
            continue;
        }
        if !shared.publish_batch(batch) {
            debug!(
                target = "model_watcher::session",
                model_uuid = %shared.model_uuid,
                deltas,
                "discarding batch that arrived after stop"
            );
            return LoopExit::Cancelled;
        }
        trace!(
            target = "model_watcher::session",
            model_uuid = %shared.model_uuid,
            deltas,
            "applied delta batch"
        );
    }
}

struct HandleInner {
    shared: Arc<SessionShared>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}

/// Consumer side of one watch session.
///
/// Clones share the session. Dropping the last clone cancels it the same way
/// [`WatchHandle::cancel`] does; the remote watcher is then closed in the
/// background.
#[derive(Clone)]
pub struct WatchHandle {
    inner: Arc<HandleInner>,
}

impl WatchHandle {
    /// Starts watching `model_uuid`. Must be called from within a tokio
    /// runtime. Returns immediately in the `Connecting` phase.
    pub fn start(
        connection: SharedConnection,
        model_uuid: impl Into<String>,
        config: WatcherConfig,
    ) -> Self {
        let model_uuid: Arc<str> = Arc::from(model_uuid.into());
        let shared = Arc::new(SessionShared::new(connection, model_uuid, config));
        shared.advance(SessionPhase::Connecting);
        tokio::spawn(drive(shared.clone()));
        Self {
            inner: Arc::new(HandleInner { shared }),
        }
    }

    fn shared(&self) -> &SessionShared {
        &self.inner.shared
    }

    pub fn model_uuid(&self) -> &str {
        &self.shared().model_uuid
    }

    pub fn state(&self) -> WatchState {
        self.shared().state.borrow().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared().state.borrow().phase
    }

    pub fn ready(&self) -> bool {
        self.phase() == SessionPhase::Ready
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared().state.borrow().snapshot.clone()
    }

    pub fn last_batch(&self) -> Arc<DeltaBatch> {
        self.shared().state.borrow().last_batch.clone()
    }

    pub fn error(&self) -> Option<WatchError> {
        self.shared().state.borrow().error.clone()
    }

    /// Latest-value receiver; intermediate states may be coalesced.
    pub fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.shared().state.subscribe()
    }

    /// Ordered events from this point on.
    pub fn events(&self) -> broadcast::Receiver<WatchEvent> {
        self.shared().events.subscribe()
    }

    pub fn connection(&self) -> SharedConnection {
        self.shared().connection.clone()
    }

    pub fn heartbeat_running(&self) -> bool {
        self.shared().heartbeat_running()
    }

    /// True once the driver task has exited and any remote stop has been sent.
    pub fn is_finished(&self) -> bool {
        *self.shared().finished.borrow()
    }

    /// Synchronously cancels the loop and heartbeat. No batch is published
    /// after this returns. Idempotent.
    pub fn cancel(&self) {
        self.shared().request_stop();
    }

    /// Cancels, then waits until the remote watcher has been closed.
    pub async fn stop(&self) {
        self.cancel();
        let mut finished = self.shared().finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    /// Resolves once the session reaches a terminal phase.
    pub async fn wait_terminal(&self) -> WatchState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|state| state.phase.is_terminal()).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }
}
