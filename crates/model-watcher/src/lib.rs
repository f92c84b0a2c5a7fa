//! Live model-state watcher.
//!
//! A [`WatchHandle`] asks the controller for an all-watcher on one model,
//! long-polls it for delta batches and folds each batch into an immutable
//! [`Snapshot`]. While the session is ready a [`Heartbeat`] keeps the shared
//! connection alive. Consumers read the latest [`WatchState`] through a watch
//! channel or follow every change as ordered [`WatchEvent`]s.
//!
//! The crate never opens sockets itself: callers supply a
//! [`ControllerConnection`], either their own or an [`RpcConnection`] over an
//! [`RpcTransport`].

pub mod config;
pub mod connection;
pub mod delta;
pub mod error;
pub mod heartbeat;
pub mod memory;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod snapshot;
pub mod starter;
pub mod view;

pub use config::{Facade, RpcFacades, WatcherConfig};
pub use connection::{ControllerConnection, SharedConnection, WatcherId};
pub use delta::{Delta, DeltaBatch, EntityKey, EntityKind, Operation, Payload};
pub use error::{CallError, PingError, WatchError, WatchResult};
pub use heartbeat::{Heartbeat, DEFAULT_PING_INTERVAL};
pub use memory::InMemoryConnection;
pub use registry::WatchRegistry;
pub use rpc::{RpcConnection, RpcTransport, UNAUTHORIZED_CODE};
pub use session::{SessionPhase, WatchEvent, WatchHandle, WatchState};
pub use snapshot::{apply, Snapshot};
pub use starter::{start_watch, StartedWatch};
pub use view::{ApplicationEntry, ModelView};

pub use watcher_proto as proto;
