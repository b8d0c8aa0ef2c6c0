//! Single-flight request coordination.
//!
//! At most one fetch runs per cache key. The first `request` for a key admits
//! it and spawns a worker task; every later `request` for the same key joins
//! the pending one and observes the same outcome. Once the worker settles,
//! the key is released and the next `request` fetches again.
//!
//! ```text
//! Idle ──request──▶ Pending ──settle──▶ Idle
//!                      ▲  │
//!                request  └─▶ watch: Some(Ok(result)) | Some(Err(e))
//!                  (join)
//! ```
//!
//! The worker owns the fetch: dropping every `RequestHandle` does not cancel
//! it, and a successful payload is still merged into the store. A payload
//! that fails normalization part way merges the entities that completed and
//! records no result.

use crate::error::RequestError;
use crate::shape::{FetchShape, OperationKind, Params};
use parking_lot::Mutex;
use refcache_core::{EntityStore, NormalizeVisitor, ResultMeta, normalize_into};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

type Outcome = Option<Result<Value, RequestError>>;

#[derive(Debug)]
struct Inner {
    store: Arc<EntityStore>,
    in_flight: Mutex<HashMap<String, watch::Receiver<Outcome>>>,
    data_expiry: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct RequestCoordinator {
    inner: Arc<Inner>,
}

impl RequestCoordinator {
    /// Coordinator merging into `store`; read results stay fresh for
    /// `data_expiry`.
    pub fn new(store: Arc<EntityStore>, data_expiry: chrono::Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                in_flight: Mutex::new(HashMap::new()),
                data_expiry,
            }),
        }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.inner.store
    }

    /// Start or join the request for `shape` at `params`.
    ///
    /// Must be called from within a tokio runtime. Fails without side
    /// effects if the URL cannot be resolved.
    pub fn request(
        &self,
        shape: &FetchShape,
        params: &Params,
        body: Option<Value>,
    ) -> Result<RequestHandle, RequestError> {
        let key = shape.key(params)?;
        let method = shape.method();

        let receiver = {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(receiver) = in_flight.get(&key) {
                tracing::trace!(key = %key, %method, "request.join");
                return Ok(RequestHandle {
                    key,
                    receiver: receiver.clone(),
                    joined: true,
                });
            }
            let (sender, receiver) = watch::channel(None);
            in_flight.insert(key.clone(), receiver.clone());
            self.spawn(key.clone(), shape.clone(), params.clone(), body, sender);
            receiver
        };
        tracing::debug!(key = %key, %method, "request.admit");

        Ok(RequestHandle {
            key,
            receiver,
            joined: false,
        })
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    /// Keys with a fetch in flight, sorted.
    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.in_flight.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn spawn(
        &self,
        key: String,
        shape: FetchShape,
        params: Params,
        body: Option<Value>,
        sender: watch::Sender<Outcome>,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let release = Release {
                inner: Arc::clone(&inner),
                key: key.clone(),
            };
            let outcome = inner.settle(&key, &shape, &params, body.as_ref()).await;
            drop(release);

            match &outcome {
                Ok(_) => tracing::debug!(key = %key, method = %shape.method(), "request.settled"),
                Err(err) => {
                    tracing::warn!(key = %key, method = %shape.method(), error = %err, "request.failed")
                }
            }
            sender.send_replace(Some(outcome));
        });
    }
}

impl Inner {
    async fn settle(
        &self,
        key: &str,
        shape: &FetchShape,
        params: &Params,
        body: Option<&Value>,
    ) -> Result<Value, RequestError> {
        let payload = shape.fetch(params, body).await?;
        let mut visitor = NormalizeVisitor::new();
        let result = match normalize_into(&payload, shape.schema(), &mut visitor) {
            Ok(result) => result,
            Err(err) => {
                // Entities that normalized before the failure still land.
                self.store.apply(&visitor.finish(Value::Null));
                return Err(err.into());
            }
        };
        let normalized = visitor.finish(result);
        match shape.kind() {
            OperationKind::Read => {
                self.store
                    .apply_result(key, &normalized, ResultMeta::fresh(self.data_expiry))
            }
            OperationKind::Mutate => self.store.apply(&normalized),
        }
        Ok(normalized.result)
    }
}

/// Releases the in-flight entry when the worker finishes or unwinds.
struct Release {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.key);
    }
}

/// A caller's interest in one pending key.
#[derive(Debug)]
pub struct RequestHandle {
    key: String,
    receiver: watch::Receiver<Outcome>,
    joined: bool,
}

impl RequestHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this handle joined a request that was already pending.
    pub fn joined(&self) -> bool {
        self.joined
    }

    pub fn is_settled(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Wait for the outcome: the normalized result tree, or the error every
    /// waiter on this key sees.
    pub async fn wait(self) -> Result<Value, RequestError> {
        let RequestHandle {
            key, mut receiver, ..
        } = self;
        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(settled) => Option::clone(&settled),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(RequestError::Abandoned { key }))
    }
}
