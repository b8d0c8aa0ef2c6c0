//! Referentially stable views over persistent snapshots.
//!
//! Consumers that compare views by identity (to skip re-rendering, say)
//! need the same `Arc` back when nothing they depend on changed. A cached
//! view stays valid while its input tree and schema are the same and every
//! record its resolution read is pointer-identical in the new snapshot;
//! `Snapshot` keeps handles for untouched records, so unrelated writes do
//! not invalidate it.
//!
//! Entries hold only the record handles they read, never a whole snapshot,
//! and the cache drops its least recently used entry once it is full.

use crate::denormalize::{Denormalized, Unvisit};
use crate::entity::{EntityRef, Record, Snapshot};
use crate::schema::Schema;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Views kept before the least recently used one is evicted.
pub const DEFAULT_VIEW_CAPACITY: usize = 512;

/// A view handle that is pointer-stable across unchanged snapshots.
#[derive(Debug, Clone)]
pub struct SharedView {
    pub value: Arc<Value>,
    pub found: bool,
}

impl SharedView {
    pub fn missing() -> Self {
        Self {
            value: Arc::new(Value::Null),
            found: false,
        }
    }
}

impl From<Denormalized> for SharedView {
    fn from(view: Denormalized) -> Self {
        Self {
            value: Arc::new(view.value),
            found: view.found,
        }
    }
}

#[derive(Debug)]
struct CachedView {
    input: Value,
    schema: Schema,
    /// Handle of every record the resolution read; `None` where it missed.
    reads: BTreeMap<EntityRef, Option<Arc<Record>>>,
    view: SharedView,
    last_used: u64,
}

impl CachedView {
    fn is_current(&self, input: &Value, schema: &Schema, snapshot: &Snapshot) -> bool {
        self.input == *input
            && self.schema.same(schema)
            && self.reads.iter().all(|(entity_ref, before)| {
                let after = snapshot.get_shared(&entity_ref.entity_type, &entity_ref.key);
                match (before, after) {
                    (None, None) => true,
                    (Some(before), Some(after)) => Arc::ptr_eq(before, after),
                    _ => false,
                }
            })
    }
}

/// Memoized views keyed by a caller-chosen cache key, bounded by capacity.
#[derive(Debug)]
pub struct ViewCache {
    views: BTreeMap<String, CachedView>,
    capacity: usize,
    clock: u64,
}

impl Default for ViewCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_VIEW_CAPACITY)
    }
}

impl ViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache holding at most `capacity` views (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            views: BTreeMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Denormalize `input`, reusing the previous view for `cache_key` when
    /// it is still current.
    pub fn view(
        &mut self,
        cache_key: &str,
        input: &Value,
        schema: &Schema,
        snapshot: &Snapshot,
    ) -> SharedView {
        self.clock += 1;
        let tick = self.clock;
        if let Some(cached) = self.views.get_mut(cache_key) {
            if cached.is_current(input, schema, snapshot) {
                cached.last_used = tick;
                tracing::trace!(key = cache_key, "view_cache.hit");
                return cached.view.clone();
            }
        }

        let mut unvisit = Unvisit::new(snapshot);
        let view = SharedView::from(schema.denormalize(input, &mut unvisit));
        let reads = unvisit
            .into_reads()
            .into_iter()
            .map(|entity_ref| {
                let handle = snapshot
                    .get_shared(&entity_ref.entity_type, &entity_ref.key)
                    .cloned();
                (entity_ref, handle)
            })
            .collect();
        self.views.insert(
            cache_key.to_string(),
            CachedView {
                input: input.clone(),
                schema: schema.clone(),
                reads,
                view: view.clone(),
                last_used: tick,
            },
        );
        self.evict_least_recent();
        view
    }

    pub fn evict(&mut self, cache_key: &str) -> bool {
        self.views.remove(cache_key).is_some()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    fn evict_least_recent(&mut self) {
        while self.views.len() > self.capacity {
            let Some(oldest) = self
                .views
                .iter()
                .min_by_key(|(_, cached)| cached.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.views.remove(&oldest);
            tracing::trace!(key = %oldest, "view_cache.evict");
        }
    }
}
