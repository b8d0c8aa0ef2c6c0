//! Error types for the request layer.
//!
//! Every error here is `Clone`: a settled request replays its outcome to
//! every waiter that joined it.

use refcache_core::SchemaError;

/// The transport rejected a fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("fetch failed: {message}")]
pub struct FetchError {
    pub message: String,
    /// Status reported by the transport, if it has one.
    pub status: Option<u16>,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// An endpoint cannot resolve a URL for the given operation or params.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    /// The endpoint does not provide this operation.
    #[error("{resource} does not implement {operation}")]
    NotImplemented {
        resource: String,
        operation: &'static str,
    },

    #[error("{resource} requires url parameter `{param}`")]
    MissingParam { resource: String, param: String },
}

/// Outcome of a coordinated request that did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The worker settling this key went away without an outcome.
    #[error("request `{key}` was abandoned before settling")]
    Abandoned { key: String },
}
