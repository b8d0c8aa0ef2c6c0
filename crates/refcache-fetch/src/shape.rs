//! Fetch descriptors.
//!
//! A `FetchShape` says everything the coordinator needs to run one logical
//! request: whether it reads or mutates, the verb, the schema its response
//! normalizes with, and the collaborators resolving the URL and executing
//! the fetch. Shapes are immutable and cheap to clone.

use crate::error::{RequestError, ResourceError};
use crate::resource::Endpoint;
use crate::transport::Transport;
use refcache_core::{DEFAULT_ID_ATTRIBUTE, Schema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// URL parameters. Ordered, so derived URLs and cache keys are stable.
pub type Params = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Response is recorded as a result slot under the request key.
    Read,
    /// Response only merges entities.
    Mutate,
}

/// Which endpoint URL a shape targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlTarget {
    Detail,
    List,
}

#[derive(Clone)]
pub struct FetchShape {
    kind: OperationKind,
    method: Method,
    target: UrlTarget,
    schema: Schema,
    endpoint: Arc<dyn Endpoint>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for FetchShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchShape")
            .field("kind", &self.kind)
            .field("method", &self.method)
            .field("target", &self.target)
            .field("schema", &self.schema.kind())
            .field("endpoint", &self.endpoint.name())
            .finish()
    }
}

impl FetchShape {
    pub fn new(
        kind: OperationKind,
        method: Method,
        target: UrlTarget,
        schema: Schema,
        endpoint: Arc<dyn Endpoint>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            kind,
            method,
            target,
            schema,
            endpoint,
            transport,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn target(&self) -> UrlTarget {
        self.target
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Same shape, different response schema.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn url(&self, params: &Params) -> Result<String, ResourceError> {
        match self.target {
            UrlTarget::Detail => self.endpoint.url(params),
            UrlTarget::List => self.endpoint.list_url(params),
        }
    }

    /// Cache key: `"{METHOD} {url}"`. Request bodies never participate.
    pub fn key(&self, params: &Params) -> Result<String, ResourceError> {
        Ok(format!("{} {}", self.method, self.url(params)?))
    }

    /// Execute the fetch through the transport.
    ///
    /// A tombstone shape whose response carries nothing gets the params
    /// object instead, so the deleted entity's key can still be derived.
    pub async fn fetch(&self, params: &Params, body: Option<&Value>) -> Result<Value, RequestError> {
        let url = self.url(params)?;
        let response = self.transport.fetch(self.method, &url, body).await?;
        if matches!(self.schema, Schema::Delete(_)) && is_empty_response(&response) {
            return Ok(params_object(params));
        }
        Ok(response)
    }

    /// Result tree a detail read would produce, derived from params alone.
    ///
    /// Lets a view render from entities another request already stored.
    pub fn infer_result(&self, params: &Params) -> Option<Value> {
        if self.kind != OperationKind::Read || self.target != UrlTarget::Detail {
            return None;
        }
        let Schema::Entity(entity) = &self.schema else {
            return None;
        };
        let attribute = entity.id_attribute().unwrap_or(DEFAULT_ID_ATTRIBUTE);
        params.get(attribute).cloned().map(Value::String)
    }
}

fn is_empty_response(response: &Value) -> bool {
    match response {
        Value::Null => true,
        Value::Object(members) => members.is_empty(),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

fn params_object(params: &Params) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect::<Map<String, Value>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::resource::Resource;
    use async_trait::async_trait;
    use refcache_core::EntitySchema;
    use serde_json::json;

    struct Fixed(Value);

    #[async_trait]
    impl Transport for Fixed {
        async fn fetch(
            &self,
            _method: Method,
            _url: &str,
            _body: Option<&Value>,
        ) -> Result<Value, FetchError> {
            Ok(self.0.clone())
        }
    }

    fn users(response: Value) -> Resource {
        let user = Arc::new(EntitySchema::new("users"));
        Resource::new("/api/users", user, Arc::new(Fixed(response)))
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn method_renders_upper_case() {
        assert_eq!(Method::Patch.to_string(), "PATCH");
        assert_eq!(
            serde_json::to_value(Method::Delete).expect("method should serialize"),
            json!("DELETE")
        );
    }

    #[test]
    fn key_is_verb_and_url() {
        let resource = users(Value::Null);
        let p = params(&[("id", "5")]);
        assert_eq!(
            resource.detail_shape().key(&p).expect("detail key"),
            "GET /api/users/5"
        );
        assert_eq!(
            resource.update_shape().key(&p).expect("update key"),
            "PUT /api/users/5"
        );
        assert_ne!(
            resource.detail_shape().key(&p),
            resource.delete_shape().key(&p)
        );
    }

    #[test]
    fn infer_result_only_for_detail_reads() {
        let resource = users(Value::Null);
        let p = params(&[("id", "5")]);
        assert_eq!(resource.detail_shape().infer_result(&p), Some(json!("5")));
        assert_eq!(resource.list_shape().infer_result(&p), None);
        assert_eq!(resource.update_shape().infer_result(&p), None);
        assert_eq!(resource.detail_shape().infer_result(&Params::new()), None);
    }

    #[tokio::test]
    async fn empty_delete_response_becomes_params() {
        let resource = users(Value::Null);
        let p = params(&[("id", "5")]);
        let response = resource
            .delete_shape()
            .fetch(&p, None)
            .await
            .expect("delete should succeed");
        assert_eq!(response, json!({"id": "5"}));
    }

    #[tokio::test]
    async fn non_delete_responses_pass_through() {
        let resource = users(json!({}));
        let response = resource
            .detail_shape()
            .fetch(&params(&[("id", "5")]), None)
            .await
            .expect("detail should succeed");
        assert_eq!(response, json!({}));
    }
}
