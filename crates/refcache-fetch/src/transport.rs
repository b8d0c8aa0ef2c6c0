//! The external fetch collaborator.

use crate::error::FetchError;
use crate::shape::Method;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Executes one fetch. Implementations own the wire format; the request
/// layer only distinguishes success from failure.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, FetchError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn fetch(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, FetchError> {
        (**self).fetch(method, url, body).await
    }
}

/// Fails any fetch that does not settle within `timeout`.
#[derive(Debug, Clone)]
pub struct TimeoutTransport<T> {
    inner: T,
    timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Timeout in whole milliseconds, saturating at `u64::MAX`.
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

#[async_trait]
impl<T: Transport> Transport for TimeoutTransport<T> {
    async fn fetch(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, FetchError> {
        match tokio::time::timeout(self.timeout, self.inner.fetch(method, url, body)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let timeout_ms = self.timeout_ms();
                tracing::warn!(%method, url, timeout_ms, "transport.timeout");
                Err(FetchError::new(format!(
                    "{method} {url} timed out after {timeout_ms}ms"
                )))
            }
        }
    }
}
