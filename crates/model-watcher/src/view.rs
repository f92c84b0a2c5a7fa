//! Grouped read model derived from a [`Snapshot`], shaped the way dashboards
//! consume a model: one map per entity kind plus a few derived fields.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::delta::{EntityKind, Payload};
use crate::snapshot::Snapshot;

const APPLICATION_TAG_PREFIX: &str = "application-";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationEntry {
    /// `None` while units of the application have arrived but the
    /// application delta itself has not.
    pub payload: Option<Payload>,
    pub unit_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelView {
    pub model: Option<Payload>,
    pub applications: BTreeMap<String, ApplicationEntry>,
    pub units: BTreeMap<String, Payload>,
    pub machines: BTreeMap<String, Payload>,
    pub relations: BTreeMap<String, Payload>,
    pub charms: BTreeMap<String, Payload>,
    pub actions: BTreeMap<String, Payload>,
    pub offers: BTreeMap<String, Payload>,
    pub remote_applications: BTreeMap<String, Payload>,
    /// Keyed by application name for application tags, by raw tag otherwise.
    pub annotations: BTreeMap<String, Map<String, Value>>,
    pub other: BTreeMap<String, BTreeMap<String, Payload>>,
}

impl ModelView {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut view = ModelView::default();

        for (key, payload) in snapshot.iter() {
            let id = key.id.clone();
            let payload = payload.clone();
            match &key.kind {
                EntityKind::Model => view.model = Some(payload),
                EntityKind::Application => {
                    view.applications.entry(id).or_default().payload = Some(payload);
                }
                EntityKind::Unit => {
                    view.units.insert(id, payload);
                }
                EntityKind::Machine => {
                    view.machines.insert(id, payload);
                }
                EntityKind::Relation => {
                    view.relations.insert(id, payload);
                }
                EntityKind::Charm => {
                    view.charms.insert(id, payload);
                }
                EntityKind::Action => {
                    view.actions.insert(id, payload);
                }
                EntityKind::ApplicationOffer => {
                    view.offers.insert(id, payload);
                }
                EntityKind::RemoteApplication => {
                    view.remote_applications.insert(id, payload);
                }
                EntityKind::Annotation => {
                    let name = id
                        .strip_prefix(APPLICATION_TAG_PREFIX)
                        .map(str::to_string)
                        .unwrap_or(id);
                    let annotations = match payload.get("annotations") {
                        Some(Value::Object(map)) => map.clone(),
                        _ => Map::new(),
                    };
                    view.annotations.insert(name, annotations);
                }
                EntityKind::Other(kind) => {
                    view.other
                        .entry(kind.clone())
                        .or_default()
                        .insert(id, payload);
                }
            }
        }

        for name in view.units.keys() {
            let application = application_of_unit(name);
            view.applications
                .entry(application.to_string())
                .or_default()
                .unit_count += 1;
        }

        view
    }

    pub fn unit_count(&self, application: &str) -> usize {
        self.applications
            .get(application)
            .map(|entry| entry.unit_count)
            .unwrap_or(0)
    }

    pub fn units_of<'a>(
        &'a self,
        application: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Payload)> + 'a {
        self.units
            .iter()
            .filter(move |(name, _)| application_of_unit(name) == application)
            .map(|(name, payload)| (name.as_str(), payload))
    }
}

/// `etcd/0` belongs to `etcd`.
fn application_of_unit(unit: &str) -> &str {
    unit.split('/').next().unwrap_or(unit)
}
