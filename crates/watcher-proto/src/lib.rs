//! Wire definitions for the controller's JSON-RPC watcher facades.
//! Kept in a dedicated crate so transports can build and parse envelopes
//! without pulling in the async watcher runtime.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Entity kind names as the controller spells them in delta triples.
pub mod kinds {
    pub const ACTION: &str = "action";
    pub const ANNOTATION: &str = "annotation";
    pub const APPLICATION: &str = "application";
    pub const APPLICATION_OFFER: &str = "applicationOffer";
    pub const CHARM: &str = "charm";
    pub const MACHINE: &str = "machine";
    pub const MODEL: &str = "model";
    pub const RELATION: &str = "relation";
    pub const REMOTE_APPLICATION: &str = "remoteApplication";
    pub const UNIT: &str = "unit";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("response is missing a watcher id")]
    MissingWatcherId,
    #[error("watcher id must be a string or integer, got {0}")]
    InvalidWatcherId(String),
    #[error("delta {index} is not a [kind, operation, payload] triple")]
    MalformedDelta { index: usize },
    #[error("delta {index} has unknown operation {operation:?}")]
    UnknownOperation { index: usize, operation: String },
    #[error("delta {index} payload must be an object")]
    PayloadNotObject { index: usize },
    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// One outbound call on a facade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    #[serde(rename = "request-id")]
    pub request_id: u64,
    #[serde(rename = "type")]
    pub facade: String,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub request: String,
    pub params: Value,
    /// Routing hint for transports that keep one socket per model. Never sent.
    #[serde(skip)]
    pub target_model: Option<String>,
}

impl RpcRequest {
    pub fn new(facade: impl Into<String>, version: u32, request: impl Into<String>) -> Self {
        Self {
            request_id: 0,
            facade: facade.into(),
            version,
            id: None,
            request: request.into(),
            params: Value::Object(Map::new()),
            target_model: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn for_model(mut self, model_uuid: impl Into<String>) -> Self {
        self.target_model = Some(model_uuid.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcResponse {
    #[serde(rename = "request-id")]
    pub request_id: u64,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "error-code")]
    pub error_code: Option<String>,
}

/// Error half of an [`RpcResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFailure {
    pub message: String,
    pub code: Option<String>,
}

impl RpcResponse {
    pub fn ok(request_id: u64, response: Value) -> Self {
        Self {
            request_id,
            response: Some(response),
            error: None,
            error_code: None,
        }
    }

    pub fn failed(request_id: u64, message: impl Into<String>, code: Option<String>) -> Self {
        Self {
            request_id,
            response: None,
            error: Some(message.into()),
            error_code: code,
        }
    }

    /// Splits the envelope into its body or the controller-reported failure.
    /// An empty error string is treated as success, matching the controller.
    pub fn into_result(self) -> Result<Value, RpcFailure> {
        match self.error {
            Some(message) if !message.is_empty() => Err(RpcFailure {
                message,
                code: self.error_code.filter(|code| !code.is_empty()),
            }),
            _ => Ok(self.response.unwrap_or(Value::Null)),
        }
    }
}

/// Body of `Client.WatchAll`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WatchAllResult {
    #[serde(default, rename = "watcher-id")]
    pub watcher_id: Option<Value>,
}

impl WatchAllResult {
    /// Normalizes the watcher id; controllers have sent both strings and integers.
    pub fn watcher_id(&self) -> Result<String, ProtoError> {
        match &self.watcher_id {
            None | Some(Value::Null) => Err(ProtoError::MissingWatcherId),
            Some(Value::String(id)) if id.trim().is_empty() => Err(ProtoError::MissingWatcherId),
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(n)) if n.is_u64() || n.is_i64() => Ok(n.to_string()),
            Some(other) => Err(ProtoError::InvalidWatcherId(other.to_string())),
        }
    }
}

/// Body of `AllWatcher.Next`. A null delta list is an empty batch.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NextResult {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub deltas: Vec<Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireOperation {
    Change,
    Remove,
}

impl WireOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            WireOperation::Change => "change",
            WireOperation::Remove => "remove",
        }
    }
}

/// A validated `[kind, operation, payload]` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct WireDelta {
    pub kind: String,
    pub operation: WireOperation,
    pub payload: Map<String, Value>,
}

impl WireDelta {
    pub fn new(kind: impl Into<String>, operation: WireOperation, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind: kind.into(),
            operation,
            payload,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.kind.clone()),
            Value::String(self.operation.as_str().to_string()),
            Value::Object(self.payload.clone()),
        ])
    }
}

/// Validates every triple of a `Next` body, failing on the first bad entry.
pub fn decode_deltas(values: Vec<Value>) -> Result<Vec<WireDelta>, ProtoError> {
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| decode_delta(index, value))
        .collect()
}

fn decode_delta(index: usize, value: Value) -> Result<WireDelta, ProtoError> {
    let Value::Array(parts) = value else {
        return Err(ProtoError::MalformedDelta { index });
    };
    let [kind, operation, payload]: [Value; 3] = parts
        .try_into()
        .map_err(|_| ProtoError::MalformedDelta { index })?;

    let Value::String(kind) = kind else {
        return Err(ProtoError::MalformedDelta { index });
    };
    let operation = match operation {
        Value::String(op) if op == "change" => WireOperation::Change,
        Value::String(op) if op == "remove" => WireOperation::Remove,
        Value::String(op) => {
            return Err(ProtoError::UnknownOperation {
                index,
                operation: op,
            })
        }
        _ => return Err(ProtoError::MalformedDelta { index }),
    };
    let Value::Object(payload) = payload else {
        return Err(ProtoError::PayloadNotObject { index });
    };

    Ok(WireDelta {
        kind,
        operation,
        payload,
    })
}

/// Decodes a facade response body into its typed result.
pub fn decode_body<T: DeserializeOwned>(body: Value) -> Result<T, ProtoError> {
    let body = if body.is_null() {
        Value::Object(Map::new())
    } else {
        body
    };
    serde_json::from_value(body).map_err(|err| ProtoError::Decode(err.to_string()))
}
