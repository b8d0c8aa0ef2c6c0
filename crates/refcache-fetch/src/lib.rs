//! # refcache-fetch
//!
//! Request layer over `refcache-core`.
//!
//! This crate provides:
//! - `FetchShape`: a declarative fetch descriptor (method, schema, endpoint,
//!   transport) and the canonical read/mutate shapes built by `Resource`
//! - `Transport`: the external fetch collaborator, plus a timeout wrapper
//! - `RequestCoordinator`: single-flight execution per cache key, merging
//!   every settled payload into the shared `EntityStore`
//! - `Client`: store + coordinator + config, with the `View` signal a
//!   consumer needs to decide whether to wait, render or refetch
//!
//! It does not speak HTTP. Callers supply a `Transport`.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod resource;
pub mod shape;
pub mod transport;

pub use client::{Client, View};
pub use config::{ClientConfig, ConfigError};
pub use coordinator::{RequestCoordinator, RequestHandle};
pub use error::{FetchError, RequestError, ResourceError};
pub use resource::{Endpoint, Resource};
pub use shape::{FetchShape, Method, OperationKind, Params, UrlTarget};
pub use transport::{TimeoutTransport, Transport};
