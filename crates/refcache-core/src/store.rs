//! Shared entity store.
//!
//! The store publishes immutable `StoreSnapshot`s through an `ArcSwap`:
//! readers load the current snapshot without locking and denormalize against
//! it; writers are serialized by a mutex, clone the (structurally shared)
//! snapshot, apply a normalization delta and publish the result.
//!
//! Besides entities, the store keeps one result slot per read cache key: the
//! normalized result tree plus fetch metadata, so a view can be rebuilt
//! without refetching.

use crate::denormalize::{Denormalized, denormalize};
use crate::entity::{EntityRef, Record, Snapshot};
use crate::normalize::Normalized;
use crate::schema::Schema;
use crate::view_cache::{SharedView, ViewCache};
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Fetch metadata for one result slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMeta {
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ResultMeta {
    /// Metadata for a result fetched now, valid for `ttl`.
    ///
    /// A `ttl` reaching past the representable range never expires.
    pub fn fresh(ttl: Duration) -> Self {
        Self::fetched_at(Utc::now(), ttl)
    }

    pub fn fetched_at(fetched_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            fetched_at,
            expires_at: fetched_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
struct ResultSlot {
    result: Value,
    meta: ResultMeta,
}

/// Immutable view of the store at one point in time.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    entities: Snapshot,
    results: Arc<BTreeMap<String, ResultSlot>>,
}

impl StoreSnapshot {
    pub fn entities(&self) -> &Snapshot {
        &self.entities
    }

    /// Normalized result recorded for a read cache key.
    pub fn result(&self, cache_key: &str) -> Option<&Value> {
        self.results.get(cache_key).map(|slot| &slot.result)
    }

    pub fn meta(&self, cache_key: &str) -> Option<&ResultMeta> {
        self.results.get(cache_key).map(|slot| &slot.meta)
    }

    /// Cache keys with a recorded result, in sorted order.
    pub fn result_keys(&self) -> impl Iterator<Item = &str> {
        self.results.keys().map(String::as_str)
    }

    fn apply(&mut self, normalized: &Normalized) -> (usize, usize) {
        let mut merged = 0;
        for (entity_ref, record) in normalized.entities.iter() {
            self.entities.merge(entity_ref, record.clone());
            merged += 1;
        }
        let mut removed = 0;
        for entity_ref in &normalized.deleted {
            if self.entities.remove(entity_ref) {
                removed += 1;
            }
        }
        (merged, removed)
    }
}

/// Process-wide normalized store.
///
/// Consistency unit: concurrent deltas for the same entity interleave per
/// field. Each `apply` is atomic with respect to readers, but two fetches
/// that complete in either order leave the fields of whichever applied last,
/// merged over the fields only the other one carried. There is no
/// whole-entity or per-request isolation.
#[derive(Debug, Default)]
pub struct EntityStore {
    current: ArcSwap<StoreSnapshot>,
    writer: Mutex<()>,
    views: Mutex<ViewCache>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose view cache keeps at most `capacity` views.
    pub fn with_view_capacity(capacity: usize) -> Self {
        Self {
            views: Mutex::new(ViewCache::with_capacity(capacity)),
            ..Self::default()
        }
    }

    /// Current snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.current.load_full()
    }

    /// Shared handle to one stored record.
    pub fn entity(&self, entity_type: &str, key: &str) -> Option<Arc<Record>> {
        self.snapshot().entities().get_shared(entity_type, key).cloned()
    }

    /// Merge a normalization delta into the store.
    pub fn apply(&self, normalized: &Normalized) {
        let (merged, removed) = self.write(|next| next.apply(normalized));
        tracing::debug!(merged, removed, "store.apply");
    }

    /// Merge a delta and record its result tree under `cache_key`.
    pub fn apply_result(&self, cache_key: &str, normalized: &Normalized, meta: ResultMeta) {
        let (merged, removed) = self.write(|next| {
            let counts = next.apply(normalized);
            Arc::make_mut(&mut next.results).insert(
                cache_key.to_string(),
                ResultSlot {
                    result: normalized.result.clone(),
                    meta,
                },
            );
            counts
        });
        tracing::debug!(key = cache_key, merged, removed, "store.apply_result");
    }

    /// Drop the result slot for `cache_key`. Entities stay.
    pub fn invalidate(&self, cache_key: &str) -> bool {
        let removed = self.write(|next| {
            if next.results.contains_key(cache_key) {
                Arc::make_mut(&mut next.results).remove(cache_key);
                true
            } else {
                false
            }
        });
        if removed {
            self.views.lock().evict(cache_key);
            tracing::debug!(key = cache_key, "store.invalidate");
        }
        removed
    }

    /// Remove one entity outright.
    pub fn remove(&self, entity_ref: &EntityRef) -> bool {
        self.write(|next| next.entities.remove(entity_ref))
    }

    /// Denormalize `input` against the current snapshot.
    pub fn denormalize(&self, input: &Value, schema: &Schema) -> Denormalized {
        let snapshot = self.snapshot();
        denormalize(input, schema, snapshot.entities())
    }

    /// Referentially stable view of `input`, memoized under `cache_key`.
    pub fn view(&self, cache_key: &str, input: &Value, schema: &Schema) -> SharedView {
        let snapshot = self.snapshot();
        self.views
            .lock()
            .view(cache_key, input, schema, snapshot.entities())
    }

    /// View of the result recorded for `cache_key`, or not-found if no
    /// result has been recorded.
    pub fn view_result(&self, cache_key: &str, schema: &Schema) -> SharedView {
        let snapshot = self.snapshot();
        match snapshot.result(cache_key) {
            Some(result) => self
                .views
                .lock()
                .view(cache_key, result, schema, snapshot.entities()),
            None => SharedView::missing(),
        }
    }

    fn write<R>(&self, update: impl FnOnce(&mut StoreSnapshot) -> R) -> R {
        let _writer = self.writer.lock();
        let mut next = StoreSnapshot::clone(&self.current.load());
        let outcome = update(&mut next);
        self.current.store(Arc::new(next));
        outcome
    }
}
