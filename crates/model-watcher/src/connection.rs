use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CallError;

/// Controller-assigned handle for one all-watcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatcherId(String);

impl WatcherId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote operations of an authenticated controller connection.
///
/// One connection may back many watch sessions at once, so implementations
/// must allow concurrent calls. `next` is a long poll and may stay pending
/// indefinitely; callers cancel it by dropping the future.
#[async_trait]
pub trait ControllerConnection: Send + Sync {
    /// Starts watching every entity in the model.
    async fn watch_all(&self, model_uuid: &str) -> Result<WatcherId, CallError>;

    /// Waits for the next batch of raw `[kind, operation, payload]` triples.
    async fn next(&self, watcher: &WatcherId) -> Result<Vec<Value>, CallError>;

    async fn stop(&self, watcher: &WatcherId) -> Result<(), CallError>;

    /// Keep-alive, not tied to any watcher.
    async fn ping(&self) -> Result<(), CallError>;
}

pub type SharedConnection = Arc<dyn ControllerConnection>;
