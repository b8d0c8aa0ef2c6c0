//! URL resolution and the canonical REST shapes.

use crate::error::ResourceError;
use crate::shape::{FetchShape, Method, OperationKind, Params, UrlTarget};
use crate::transport::Transport;
use refcache_core::{DEFAULT_ID_ATTRIBUTE, EntitySchema, Schema};
use std::fmt;
use std::sync::Arc;
use url::form_urlencoded;

/// Resolves request URLs from params.
///
/// Both operations are optional; an endpoint that does not provide one
/// reports `ResourceError::NotImplemented`.
pub trait Endpoint: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    fn url(&self, _params: &Params) -> Result<String, ResourceError> {
        Err(ResourceError::NotImplemented {
            resource: self.name().to_string(),
            operation: "url",
        })
    }

    fn list_url(&self, _params: &Params) -> Result<String, ResourceError> {
        Err(ResourceError::NotImplemented {
            resource: self.name().to_string(),
            operation: "list_url",
        })
    }
}

/// REST collection rooted at one URL, holding entities of one type.
///
/// - detail: `{root}/{pk}`
/// - list: `{root}` plus the params as a sorted query string
#[derive(Clone)]
pub struct Resource {
    root: String,
    entity: Arc<EntitySchema>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("root", &self.root)
            .field("entity", &self.entity.entity_type())
            .finish()
    }
}

impl Resource {
    pub fn new(
        root: impl Into<String>,
        entity: Arc<EntitySchema>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self {
            root,
            entity,
            transport,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn entity(&self) -> &Arc<EntitySchema> {
        &self.entity
    }

    /// Param naming the primary key in detail URLs.
    pub fn pk_param(&self) -> &str {
        self.entity.id_attribute().unwrap_or(DEFAULT_ID_ATTRIBUTE)
    }

    pub fn detail_shape(&self) -> FetchShape {
        self.shape(
            OperationKind::Read,
            Method::Get,
            UrlTarget::Detail,
            Schema::entity(&self.entity),
        )
    }

    pub fn list_shape(&self) -> FetchShape {
        self.shape(
            OperationKind::Read,
            Method::Get,
            UrlTarget::List,
            Schema::array(Schema::entity(&self.entity)),
        )
    }

    pub fn create_shape(&self) -> FetchShape {
        self.shape(
            OperationKind::Mutate,
            Method::Post,
            UrlTarget::List,
            Schema::entity(&self.entity),
        )
    }

    pub fn update_shape(&self) -> FetchShape {
        self.shape(
            OperationKind::Mutate,
            Method::Put,
            UrlTarget::Detail,
            Schema::entity(&self.entity),
        )
    }

    pub fn partial_update_shape(&self) -> FetchShape {
        self.shape(
            OperationKind::Mutate,
            Method::Patch,
            UrlTarget::Detail,
            Schema::entity(&self.entity),
        )
    }

    pub fn delete_shape(&self) -> FetchShape {
        self.shape(
            OperationKind::Mutate,
            Method::Delete,
            UrlTarget::Detail,
            Schema::delete(&self.entity),
        )
    }

    fn shape(
        &self,
        kind: OperationKind,
        method: Method,
        target: UrlTarget,
        schema: Schema,
    ) -> FetchShape {
        FetchShape::new(
            kind,
            method,
            target,
            schema,
            Arc::new(self.clone()),
            Arc::clone(&self.transport),
        )
    }
}

impl Endpoint for Resource {
    fn name(&self) -> &str {
        self.entity.entity_type()
    }

    fn url(&self, params: &Params) -> Result<String, ResourceError> {
        let param = self.pk_param();
        let pk = params
            .get(param)
            .ok_or_else(|| ResourceError::MissingParam {
                resource: self.name().to_string(),
                param: param.to_string(),
            })?;
        Ok(format!("{}/{}", self.root, pk))
    }

    fn list_url(&self, params: &Params) -> Result<String, ResourceError> {
        if params.is_empty() {
            return Ok(self.root.clone());
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        Ok(format!("{}?{}", self.root, query))
    }
}
