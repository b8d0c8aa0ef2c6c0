//! Client facade: one store, one coordinator, one config.

use crate::config::ClientConfig;
use crate::coordinator::RequestCoordinator;
use crate::error::{RequestError, ResourceError};
use crate::resource::Resource;
use crate::shape::{FetchShape, Params};
use crate::transport::Transport;
use chrono::Utc;
use refcache_core::{EntitySchema, EntityStore, SharedView};
use serde_json::Value;
use std::sync::Arc;

/// What a view consumer needs to decide whether to render, wait or refetch.
#[derive(Debug, Clone)]
pub struct View {
    pub value: Arc<Value>,
    /// Every referenced entity was present.
    pub found: bool,
    /// A fetch for this key is in flight.
    pub pending: bool,
    /// The recorded result is past its expiry.
    pub expired: bool,
}

impl View {
    /// Usable without fetching.
    pub fn is_fresh(&self) -> bool {
        self.found && !self.expired
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    store: Arc<EntityStore>,
    coordinator: RequestCoordinator,
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let store = EntityStore::with_view_capacity(config.view_capacity);
        Self::with_store(Arc::new(store), config)
    }

    pub fn with_store(store: Arc<EntityStore>, config: ClientConfig) -> Self {
        let coordinator = RequestCoordinator::new(Arc::clone(&store), config.data_expiry());
        Self {
            store,
            coordinator,
            config,
        }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resource whose fetches run under this client's timeout policy.
    pub fn resource<T: Transport + 'static>(
        &self,
        root: impl Into<String>,
        entity: Arc<EntitySchema>,
        transport: T,
    ) -> Resource {
        Resource::new(root, entity, self.config.wrap_transport(transport))
    }

    /// Run `shape` through the coordinator and wait for its result tree.
    pub async fn fetch(
        &self,
        shape: &FetchShape,
        params: &Params,
        body: Option<Value>,
    ) -> Result<Value, RequestError> {
        self.coordinator.request(shape, params, body)?.wait().await
    }

    /// Current view for a read shape. Never waits.
    ///
    /// Without a recorded result, a detail shape still renders from any
    /// stored entity its params name; such a view is never expired.
    pub fn read(&self, shape: &FetchShape, params: &Params) -> Result<View, ResourceError> {
        let key = shape.key(params)?;
        let snapshot = self.store.snapshot();
        let (input, expired) = match snapshot.result(&key) {
            Some(result) => {
                let expired = snapshot
                    .meta(&key)
                    .is_some_and(|meta| meta.is_expired(Utc::now()));
                (Some(result.clone()), expired)
            }
            None => (shape.infer_result(params), false),
        };

        let view = match input {
            Some(input) => self.store.view(&key, &input, shape.schema()),
            None => SharedView::missing(),
        };
        Ok(View {
            value: view.value,
            found: view.found,
            pending: self.coordinator.is_pending(&key),
            expired,
        })
    }

    /// Current view, fetching first when it is missing or expired.
    pub async fn read_or_fetch(
        &self,
        shape: &FetchShape,
        params: &Params,
    ) -> Result<View, RequestError> {
        let view = self.read(shape, params)?;
        if view.is_fresh() {
            return Ok(view);
        }
        self.fetch(shape, params, None).await?;
        Ok(self.read(shape, params)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::shape::Method;
    use async_trait::async_trait;
    use refcache_core::{Schema, normalize};
    use serde_json::json;

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn fetch(
            &self,
            _method: Method,
            _url: &str,
            _body: Option<&Value>,
        ) -> Result<Value, FetchError> {
            Err(FetchError::new("offline").with_status(503))
        }
    }

    fn id(value: &str) -> Params {
        Params::from([("id".to_string(), value.to_string())])
    }

    #[test]
    fn read_without_data_is_not_found() {
        let client = Client::new(ClientConfig::default());
        let users = client.resource("/users", Arc::new(EntitySchema::new("users")), Offline);
        let view = client
            .read(&users.list_shape(), &Params::new())
            .expect("list url resolves");
        assert!(!view.found);
        assert!(!view.pending);
        assert_eq!(*view.value, Value::Null);
    }

    #[test]
    fn detail_read_renders_from_list_entities() {
        let client = Client::new(ClientConfig::default());
        let user = Arc::new(EntitySchema::new("users"));
        let users = client.resource("/users", Arc::clone(&user), Offline);
        let normalized = normalize(
            &json!([{"id": 3, "name": "Grace"}]),
            users.list_shape().schema(),
        )
        .expect("list should normalize");
        client.store().apply(&normalized);

        let view = client
            .read(&users.detail_shape(), &id("3"))
            .expect("detail url resolves");
        assert!(view.is_fresh());
        assert_eq!(view.value["name"], "Grace");
    }

    #[test]
    fn reshaped_read_does_not_reuse_view() {
        let client = Client::new(ClientConfig::default());
        let user = Arc::new(EntitySchema::new("users"));
        let admin = Arc::new(EntitySchema::new("admins"));
        let users = client.resource("/users", Arc::clone(&user), Offline);
        let normalized = normalize(&json!({"id": 3}), users.detail_shape().schema())
            .expect("user should normalize");
        client.store().apply(&normalized);

        let detail = users.detail_shape();
        let as_admin = detail.clone().with_schema(Schema::entity(&admin));
        assert_eq!(detail.key(&id("3")), as_admin.key(&id("3")));

        assert!(client.read(&detail, &id("3")).expect("detail").found);
        assert!(!client.read(&as_admin, &id("3")).expect("admin detail").found);
    }

    #[tokio::test]
    async fn failed_fetch_surfaces_transport_error() {
        let client = Client::new(ClientConfig::default());
        let users = client.resource("/users", Arc::new(EntitySchema::new("users")), Offline);
        let err = client
            .read_or_fetch(&users.detail_shape(), &id("1"))
            .await
            .expect_err("offline transport must fail");
        match err {
            RequestError::Fetch(fetch) => assert_eq!(fetch.status, Some(503)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(client.store().snapshot().entities().is_empty());
    }
}
