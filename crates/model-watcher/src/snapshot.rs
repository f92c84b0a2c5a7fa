use std::collections::BTreeMap;
use std::sync::Arc;

use crate::delta::{DeltaBatch, EntityKey, EntityKind, Operation, Payload};

/// Reconciled view of every entity in one watched model.
///
/// Cloning is cheap and clones share storage. A published snapshot is never
/// mutated: [`apply`] always builds the successor in fresh storage, so holders
/// of an older snapshot cannot observe a half-applied batch.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: Arc<BTreeMap<EntityKey, Payload>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&Payload> {
        self.entries.get(key)
    }

    pub fn lookup(&self, kind: EntityKind, id: &str) -> Option<&Payload> {
        self.entries.get(&EntityKey::new(kind, id))
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, &Payload)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }

    /// True when both snapshots share the same storage.
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.entries == other.entries
    }
}

impl FromIterator<(EntityKey, Payload)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (EntityKey, Payload)>>(iter: I) -> Self {
        Self {
            entries: Arc::new(iter.into_iter().collect()),
        }
    }
}

/// Applies one batch, in order, producing the next snapshot.
///
/// `Change` overwrites the entry for its key and `Remove` drops it when
/// present. Removing an absent key is a no-op. An empty batch hands back the
/// same storage.
pub fn apply(snapshot: &Snapshot, batch: &DeltaBatch) -> Snapshot {
    if batch.is_empty() {
        return snapshot.clone();
    }

    let mut entries = BTreeMap::clone(&snapshot.entries);
    for delta in batch {
        match delta.operation {
            Operation::Change => {
                entries.insert(delta.key.clone(), Arc::clone(&delta.payload));
            }
            Operation::Remove => {
                entries.remove(&delta.key);
            }
        }
    }

    Snapshot {
        entries: Arc::new(entries),
    }
}
