use tracing::debug;

use crate::connection::{ControllerConnection, WatcherId};
use crate::error::{WatchError, WatchResult};

/// Remote all-watcher obtained for one model, not yet driven.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedWatch {
    pub model_uuid: String,
    pub watcher_id: WatcherId,
}

/// Issues `WatchAll` for `model_uuid`. Starts neither the receive loop nor
/// the heartbeat; that is left to the session.
pub async fn start_watch(
    connection: &dyn ControllerConnection,
    model_uuid: &str,
) -> WatchResult<StartedWatch> {
    if model_uuid.trim().is_empty() {
        return Err(WatchError::InvalidModel(model_uuid.to_string()));
    }

    let watcher_id = connection.watch_all(model_uuid).await?;
    if watcher_id.as_str().trim().is_empty() {
        return Err(WatchError::Protocol(
            "WatchAll returned an empty watcher id".into(),
        ));
    }

    debug!(
        target = "model_watcher::session",
        model_uuid,
        watcher_id = %watcher_id,
        "all-watcher started"
    );
    Ok(StartedWatch {
        model_uuid: model_uuid.to_string(),
        watcher_id,
    })
}
