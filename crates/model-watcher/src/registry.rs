use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::WatcherConfig;
use crate::connection::SharedConnection;
use crate::session::WatchHandle;

/// One live watch session per model over a shared controller connection.
///
/// `watch` hands out the existing session while it is connecting or ready and
/// starts a fresh one once the previous session stopped or errored, so a
/// caller retries simply by asking again.
pub struct WatchRegistry {
    connection: SharedConnection,
    config: WatcherConfig,
    sessions: DashMap<String, WatchHandle>,
}

impl WatchRegistry {
    pub fn new(connection: SharedConnection, config: WatcherConfig) -> Self {
        Self {
            connection,
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Must be called from within a tokio runtime.
    pub fn watch(&self, model_uuid: &str) -> WatchHandle {
        match self.sessions.entry(model_uuid.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().phase().is_terminal() {
                    return entry.get().clone();
                }
                debug!(
                    target = "model_watcher::registry",
                    model_uuid,
                    phase = ?entry.get().phase(),
                    "replacing finished watch session"
                );
                let handle = self.spawn(model_uuid);
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn(model_uuid);
                entry.insert(handle.clone());
                handle
            }
        }
    }

    fn spawn(&self, model_uuid: &str) -> WatchHandle {
        info!(
            target = "model_watcher::registry",
            model_uuid,
            "starting model watch"
        );
        WatchHandle::start(self.connection.clone(), model_uuid, self.config.clone())
    }

    pub fn get(&self, model_uuid: &str) -> Option<WatchHandle> {
        self.sessions.get(model_uuid).map(|entry| entry.value().clone())
    }

    /// Stops and forgets the session for `model_uuid`. Returns false if none
    /// was registered.
    pub async fn stop(&self, model_uuid: &str) -> bool {
        let Some((_, handle)) = self.sessions.remove(model_uuid) else {
            return false;
        };
        handle.stop().await;
        true
    }

    pub async fn stop_all(&self) {
        let models: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for model_uuid in models {
            self.stop(&model_uuid).await;
        }
    }

    /// Models with a connecting or ready session.
    pub fn active_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().phase().is_terminal())
            .map(|entry| entry.key().clone())
            .collect();
        models.sort();
        models
    }

    /// Drops sessions that have stopped or errored. Returns how many went.
    pub fn prune(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, handle| !handle.phase().is_terminal());
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
