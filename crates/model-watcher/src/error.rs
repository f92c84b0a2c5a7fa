use thiserror::Error;
use watcher_proto::ProtoError;

/// Failure of a single remote call on a [`crate::ControllerConnection`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("connection closed")]
    Closed,
    #[error("connection is not authenticated")]
    Unauthenticated,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("controller rejected {request}: {message}")]
    Rejected {
        request: String,
        message: String,
        code: Option<String>,
    },
    #[error("malformed {request} response: {source}")]
    Malformed {
        request: String,
        #[source]
        source: ProtoError,
    },
}

/// Errors surfaced through a watch session's published state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("invalid model uuid {0:?}")]
    InvalidModel(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl WatchError {
    pub fn is_connection(&self) -> bool {
        matches!(self, WatchError::Connection(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, WatchError::Protocol(_))
    }
}

impl From<CallError> for WatchError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Closed | CallError::Unauthenticated | CallError::Transport(_) => {
                WatchError::Connection(err.to_string())
            }
            CallError::Rejected { .. } | CallError::Malformed { .. } => {
                WatchError::Protocol(err.to_string())
            }
        }
    }
}

impl From<ProtoError> for WatchError {
    fn from(err: ProtoError) -> Self {
        WatchError::Protocol(err.to_string())
    }
}

/// A single failed keep-alive. Logged, never surfaced as session state.
#[derive(Debug, Error)]
#[error("heartbeat ping failed: {0}")]
pub struct PingError(#[from] pub CallError);

pub type WatchResult<T> = Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_errors_map_onto_session_taxonomy() {
        assert!(WatchError::from(CallError::Closed).is_connection());
        assert!(WatchError::from(CallError::Unauthenticated).is_connection());
        assert!(WatchError::from(CallError::Transport("reset".into())).is_connection());
        assert!(WatchError::from(CallError::Rejected {
            request: "Client.WatchAll".into(),
            message: "model not found".into(),
            code: Some("not found".into()),
        })
        .is_protocol());
        assert!(WatchError::from(CallError::Malformed {
            request: "AllWatcher.Next".into(),
            source: ProtoError::MalformedDelta { index: 0 },
        })
        .is_protocol());
    }

    #[test]
    fn proto_errors_are_protocol_errors() {
        let err = WatchError::from(ProtoError::MissingWatcherId);
        assert_eq!(
            err,
            WatchError::Protocol("response is missing a watcher id".into())
        );
    }
}
