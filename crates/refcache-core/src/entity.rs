//! The flat entity table.
//!
//! Entities are addressed by `(entity_type, key)` and hold a shallow
//! attribute record. Nested entity-valued fields hold keys, not records, so
//! the table never contains an ownership cycle even when the entity graph
//! does.
//!
//! Two representations share one lookup contract (`EntitySource`):
//! - `EntityTable`: plain nested maps, owned outright. Used for normalization
//!   deltas and ad-hoc tables in tests.
//! - `Snapshot`: `Arc`-shared maps with copy-on-write updates. Cloning is
//!   O(1) and records untouched by a merge keep their pointer identity, which
//!   is what `ViewCache` keys its referential stability on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One entity's attribute record.
pub type Record = serde_json::Map<String, Value>;

/// Reference pair identifying one entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub key: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.key)
    }
}

/// Read access to entity records by `(type, key)`.
///
/// The denormalizer is written against this capability only, so any
/// associative representation can back a view.
pub trait EntitySource {
    /// Lookup one record.
    fn record(&self, entity_type: &str, key: &str) -> Option<&Record>;

    /// Lookup one record as a shared handle.
    ///
    /// Representations without pointer identity return `None`; callers then
    /// fall back to value comparison or recomputation.
    fn shared_record(&self, _entity_type: &str, _key: &str) -> Option<Arc<Record>> {
        None
    }
}

impl<S: EntitySource + ?Sized> EntitySource for &S {
    fn record(&self, entity_type: &str, key: &str) -> Option<&Record> {
        (**self).record(entity_type, key)
    }

    fn shared_record(&self, entity_type: &str, key: &str) -> Option<Arc<Record>> {
        (**self).shared_record(entity_type, key)
    }
}

/// Shallow merge: fields in `incoming` win, fields only in `existing` stay.
pub(crate) fn merge_record(existing: &mut Record, incoming: Record) {
    for (field, value) in incoming {
        existing.insert(field, value);
    }
}

/// Plain entity table: `entity_type -> key -> record`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityTable {
    entities: BTreeMap<String, BTreeMap<String, Record>>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all entity types.
    pub fn len(&self) -> usize {
        self.entities.values().map(BTreeMap::len).sum()
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.entities.values().all(BTreeMap::is_empty)
    }

    pub fn get(&self, entity_type: &str, key: &str) -> Option<&Record> {
        self.entities.get(entity_type)?.get(key)
    }

    pub fn contains(&self, entity_ref: &EntityRef) -> bool {
        self.get(&entity_ref.entity_type, &entity_ref.key).is_some()
    }

    /// Insert or replace a record outright.
    ///
    /// Returns the previous record if present.
    pub fn insert(&mut self, entity_ref: EntityRef, record: Record) -> Option<Record> {
        self.entities
            .entry(entity_ref.entity_type)
            .or_default()
            .insert(entity_ref.key, record)
    }

    /// Shallow-merge `record` into the entry for `entity_ref`.
    pub fn merge(&mut self, entity_ref: EntityRef, record: Record) {
        let table = self.entities.entry(entity_ref.entity_type).or_default();
        match table.get_mut(&entity_ref.key) {
            Some(existing) => merge_record(existing, record),
            None => {
                table.insert(entity_ref.key, record);
            }
        }
    }

    pub fn remove(&mut self, entity_ref: &EntityRef) -> Option<Record> {
        let table = self.entities.get_mut(&entity_ref.entity_type)?;
        let removed = table.remove(&entity_ref.key);
        if table.is_empty() {
            self.entities.remove(&entity_ref.entity_type);
        }
        removed
    }

    /// Iterate records in deterministic `(type, key)` order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityRef, &Record)> {
        self.entities.iter().flat_map(|(entity_type, table)| {
            table
                .iter()
                .map(move |(key, record)| (EntityRef::new(entity_type.as_str(), key.as_str()), record))
        })
    }

    /// Entity type names present in the table.
    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}

impl EntitySource for EntityTable {
    fn record(&self, entity_type: &str, key: &str) -> Option<&Record> {
        self.get(entity_type, key)
    }
}

type TypeTable = BTreeMap<String, Arc<Record>>;

/// Persistent entity table with structural sharing.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    types: Arc<BTreeMap<String, Arc<TypeTable>>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.types.values().map(|table| table.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.types.values().all(|table| table.is_empty())
    }

    pub fn get(&self, entity_type: &str, key: &str) -> Option<&Record> {
        self.get_shared(entity_type, key).map(Arc::as_ref)
    }

    pub fn get_shared(&self, entity_type: &str, key: &str) -> Option<&Arc<Record>> {
        self.types.get(entity_type)?.get(key)
    }

    /// Shallow-merge `record` into the entry for `entity_ref`.
    ///
    /// A merge that changes no field keeps the existing record handle, so
    /// re-applying identical data does not disturb pointer identity.
    pub fn merge(&mut self, entity_ref: EntityRef, record: Record) {
        if let Some(existing) = self.get_shared(&entity_ref.entity_type, &entity_ref.key) {
            let unchanged = record
                .iter()
                .all(|(field, value)| existing.get(field) == Some(value));
            if unchanged {
                return;
            }
        }

        let types = Arc::make_mut(&mut self.types);
        let table = Arc::make_mut(types.entry(entity_ref.entity_type).or_default());
        let merged = match table.get(&entity_ref.key) {
            Some(existing) => {
                let mut merged = existing.as_ref().clone();
                merge_record(&mut merged, record);
                merged
            }
            None => record,
        };
        table.insert(entity_ref.key, Arc::new(merged));
    }

    /// Remove one entry. Returns whether it was present.
    pub fn remove(&mut self, entity_ref: &EntityRef) -> bool {
        if self
            .get_shared(&entity_ref.entity_type, &entity_ref.key)
            .is_none()
        {
            return false;
        }
        let types = Arc::make_mut(&mut self.types);
        let emptied = match types.get_mut(&entity_ref.entity_type) {
            Some(table) => {
                let table = Arc::make_mut(table);
                table.remove(&entity_ref.key);
                table.is_empty()
            }
            None => false,
        };
        if emptied {
            types.remove(&entity_ref.entity_type);
        }
        true
    }

    /// Materialize a plain table with the same contents.
    pub fn to_table(&self) -> EntityTable {
        let mut table = EntityTable::new();
        for (entity_type, records) in self.types.iter() {
            for (key, record) in records.iter() {
                table.insert(
                    EntityRef::new(entity_type.as_str(), key.as_str()),
                    record.as_ref().clone(),
                );
            }
        }
        table
    }
}

impl From<&EntityTable> for Snapshot {
    fn from(table: &EntityTable) -> Self {
        let mut snapshot = Snapshot::new();
        for (entity_ref, record) in table.iter() {
            snapshot.merge(entity_ref, record.clone());
        }
        snapshot
    }
}

impl EntitySource for Snapshot {
    fn record(&self, entity_type: &str, key: &str) -> Option<&Record> {
        self.get(entity_type, key)
    }

    fn shared_record(&self, entity_type: &str, key: &str) -> Option<Arc<Record>> {
        self.get_shared(entity_type, key).cloned()
    }
}
