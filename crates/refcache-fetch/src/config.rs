//! Client configuration.
//!
//! ```toml
//! data_expiry_ms = 60000
//! fetch_timeout_ms = 5000
//! view_capacity = 512
//! ```

use crate::transport::{TimeoutTransport, Transport};
use refcache_core::DEFAULT_VIEW_CAPACITY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_DATA_EXPIRY_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read client config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse client config TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ClientConfig {
    /// How long a recorded read result stays fresh.
    pub data_expiry_ms: u64,
    /// Upper bound on a single transport fetch. Unbounded when absent.
    pub fetch_timeout_ms: Option<u64>,
    /// Memoized views kept by the store.
    pub view_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_expiry_ms: DEFAULT_DATA_EXPIRY_MS,
            fetch_timeout_ms: None,
            view_capacity: DEFAULT_VIEW_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Saturates at the largest representable duration.
    pub fn data_expiry(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.data_expiry_ms).unwrap_or(i64::MAX))
    }

    pub fn fetch_timeout(&self) -> Option<std::time::Duration> {
        self.fetch_timeout_ms.map(std::time::Duration::from_millis)
    }

    /// Apply the configured timeout policy to a transport.
    pub fn wrap_transport<T: Transport + 'static>(&self, transport: T) -> Arc<dyn Transport> {
        match self.fetch_timeout() {
            Some(timeout) => Arc::new(TimeoutTransport::new(transport, timeout)),
            None => Arc::new(transport),
        }
    }
}
