use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use watcher_proto::{kinds, WireDelta, WireOperation};

use crate::error::{WatchError, WatchResult};

/// Opaque, kind-specific record carried by a delta. Never interpreted by the
/// reconciler, only stored and handed back out.
pub type Payload = Arc<Map<String, Value>>;

/// Kind of entity a delta describes. The controller owns this set, so kinds
/// this crate has no name for are kept verbatim in [`EntityKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Model,
    Application,
    Unit,
    Machine,
    Relation,
    ApplicationOffer,
    RemoteApplication,
    Annotation,
    Action,
    Charm,
    Other(String),
}

const FALLBACK_IDENTITY: &[&str] = &["id", "name", "key", "tag", "uuid"];

impl EntityKind {
    pub fn from_wire(name: &str) -> Self {
        match name {
            kinds::MODEL => EntityKind::Model,
            kinds::APPLICATION => EntityKind::Application,
            kinds::UNIT => EntityKind::Unit,
            kinds::MACHINE => EntityKind::Machine,
            kinds::RELATION => EntityKind::Relation,
            kinds::APPLICATION_OFFER => EntityKind::ApplicationOffer,
            kinds::REMOTE_APPLICATION => EntityKind::RemoteApplication,
            kinds::ANNOTATION => EntityKind::Annotation,
            kinds::ACTION => EntityKind::Action,
            kinds::CHARM => EntityKind::Charm,
            other => EntityKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::Model => kinds::MODEL,
            EntityKind::Application => kinds::APPLICATION,
            EntityKind::Unit => kinds::UNIT,
            EntityKind::Machine => kinds::MACHINE,
            EntityKind::Relation => kinds::RELATION,
            EntityKind::ApplicationOffer => kinds::APPLICATION_OFFER,
            EntityKind::RemoteApplication => kinds::REMOTE_APPLICATION,
            EntityKind::Annotation => kinds::ANNOTATION,
            EntityKind::Action => kinds::ACTION,
            EntityKind::Charm => kinds::CHARM,
            EntityKind::Other(name) => name,
        }
    }

    /// Payload fields holding the natural identifier, in lookup order.
    fn identity_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Model => &["model-uuid"],
            EntityKind::Application | EntityKind::Unit | EntityKind::RemoteApplication => {
                &["name"]
            }
            EntityKind::Machine | EntityKind::Action => &["id"],
            EntityKind::Relation => &["key"],
            EntityKind::Charm => &["charm-url"],
            EntityKind::Annotation => &["tag"],
            EntityKind::ApplicationOffer => &["offer-uuid", "offer-name"],
            EntityKind::Other(_) => FALLBACK_IDENTITY,
        }
    }

    /// Extracts the natural identifier from a payload. Integers are accepted
    /// since some controllers number machines and actions.
    pub fn identity_of(&self, payload: &Map<String, Value>) -> Option<String> {
        self.identity_fields()
            .iter()
            .find_map(|field| match payload.get(*field) {
                Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one entity within a model's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, operation: Operation, payload: Value) -> WatchResult<Self> {
        match payload {
            Value::Object(map) => Self::keyed(kind, operation, map),
            other => Err(WatchError::Protocol(format!(
                "{kind} payload must be an object, got {other}"
            ))),
        }
    }

    pub fn change(kind: EntityKind, payload: Value) -> WatchResult<Self> {
        Self::new(kind, Operation::Change, payload)
    }

    pub fn remove(kind: EntityKind, payload: Value) -> WatchResult<Self> {
        Self::new(kind, Operation::Remove, payload)
    }

    pub fn from_wire(wire: WireDelta) -> WatchResult<Self> {
        Self::keyed(
            EntityKind::from_wire(&wire.kind),
            wire.operation.into(),
            wire.payload,
        )
    }

    fn keyed(kind: EntityKind, operation: Operation, payload: Map<String, Value>) -> WatchResult<Self> {
        let id = kind
            .identity_of(&payload)
            .ok_or_else(|| WatchError::Protocol(format!("{kind} delta has no identifier")))?;
        Ok(Self {
            key: EntityKey::new(kind, id),
            operation,
            payload: Arc::new(payload),
        })
    }

    pub fn kind(&self) -> &EntityKind {
        &self.key.kind
    }
}

/// Deltas delivered together by one `Next` call, in controller order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaBatch {
    deltas: Vec<Delta>,
}

impl DeltaBatch {
    pub fn new(deltas: Vec<Delta>) -> Self {
        Self { deltas }
    }

    /// Decodes the raw triples of a `Next` body. Any malformed entry fails the
    /// whole batch; a partially applied batch would break ordering.
    pub fn decode(values: Vec<Value>) -> WatchResult<Self> {
        let wire = watcher_proto::decode_deltas(values)?;
        wire.into_iter()
            .map(Delta::from_wire)
            .collect::<WatchResult<Vec<_>>>()
            .map(Self::new)
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Delta> {
        self.deltas.iter()
    }

    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }
}

impl FromIterator<Delta> for DeltaBatch {
    fn from_iter<I: IntoIterator<Item = Delta>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a DeltaBatch {
    type Item = &'a Delta;
    type IntoIter = std::slice::Iter<'a, Delta>;

    fn into_iter(self) -> Self::IntoIter {
        self.deltas.iter()
    }
}
