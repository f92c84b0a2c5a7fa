//! [`ControllerConnection`] over the controller's JSON-RPC facades.
//!
//! The socket, login and request/response correlation belong to the
//! [`RpcTransport`] supplied by the caller; this adapter only shapes facade
//! calls and interprets their bodies.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;
use watcher_proto::{
    decode_body, NextResult, ProtoError, RpcRequest, RpcResponse, WatchAllResult,
};

use crate::config::{Facade, RpcFacades};
use crate::connection::{ControllerConnection, WatcherId};
use crate::error::CallError;

/// Error code the controller attaches to calls made without valid credentials.
pub const UNAUTHORIZED_CODE: &str = "unauthorized access";

#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, CallError>;
}

pub struct RpcConnection<T> {
    transport: T,
    facades: RpcFacades,
    next_request_id: AtomicU64,
}

impl<T: RpcTransport> RpcConnection<T> {
    pub fn new(transport: T) -> Self {
        Self::with_facades(transport, RpcFacades::default())
    }

    pub fn with_facades(transport: T, facades: RpcFacades) -> Self {
        Self {
            transport,
            facades,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn request(&self, facade: &Facade, request: &str) -> RpcRequest {
        let mut req = RpcRequest::new(facade.name.clone(), facade.version, request);
        req.request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        req
    }

    async fn invoke(&self, request: RpcRequest) -> Result<Value, CallError> {
        let label = format!("{}.{}", request.facade, request.request);
        let request_id = request.request_id;
        trace!(
            target = "model_watcher::rpc",
            request = %label,
            request_id,
            "issuing facade call"
        );

        let response = self.transport.call(request).await?;
        if response.request_id != request_id {
            return Err(CallError::Malformed {
                request: label,
                source: ProtoError::Decode(format!(
                    "response id {} does not match request id {request_id}",
                    response.request_id
                )),
            });
        }

        response.into_result().map_err(|failure| {
            if failure.code.as_deref() == Some(UNAUTHORIZED_CODE) {
                CallError::Unauthenticated
            } else {
                CallError::Rejected {
                    request: label,
                    message: failure.message,
                    code: failure.code,
                }
            }
        })
    }
}

fn malformed(request: &Facade, call: &str, source: ProtoError) -> CallError {
    CallError::Malformed {
        request: format!("{}.{call}", request.name),
        source,
    }
}

#[async_trait]
impl<T: RpcTransport> ControllerConnection for RpcConnection<T> {
    async fn watch_all(&self, model_uuid: &str) -> Result<WatcherId, CallError> {
        let facade = &self.facades.client;
        let request = self.request(facade, "WatchAll").for_model(model_uuid);
        let body = self.invoke(request).await?;
        let result: WatchAllResult =
            decode_body(body).map_err(|err| malformed(facade, "WatchAll", err))?;
        result
            .watcher_id()
            .map(WatcherId::new)
            .map_err(|err| malformed(facade, "WatchAll", err))
    }

    async fn next(&self, watcher: &WatcherId) -> Result<Vec<Value>, CallError> {
        let facade = &self.facades.all_watcher;
        let request = self.request(facade, "Next").with_id(watcher.as_str());
        let body = self.invoke(request).await?;
        let result: NextResult = decode_body(body).map_err(|err| malformed(facade, "Next", err))?;
        Ok(result.deltas)
    }

    async fn stop(&self, watcher: &WatcherId) -> Result<(), CallError> {
        let request = self
            .request(&self.facades.all_watcher, "Stop")
            .with_id(watcher.as_str());
        self.invoke(request).await.map(|_| ())
    }

    async fn ping(&self) -> Result<(), CallError> {
        let request = self.request(&self.facades.pinger, "Ping");
        self.invoke(request).await.map(|_| ())
    }
}
