//! # refcache-core
//!
//! Normalization layer for tree-shaped API payloads.
//!
//! This crate provides:
//! - `Schema`: a closed description of nested payload shapes
//! - `EntityTable` / `Snapshot`: the flat `(type, key) -> record` table, in a
//!   plain and a persistent (structurally shared) representation
//! - `normalize`: payload tree -> reference tree + entity delta
//! - `denormalize`: reference tree + entity source -> view + `found` flag
//! - `EntityStore`: the shared, snapshot-publishing store and its view cache
//!
//! It does not fetch anything. Request coordination lives in
//! `refcache-fetch`.
//!
//! ## Data flow
//!
//! ```text
//! payload ──normalize──▶ Normalized { result, entities, deleted }
//!                              │
//!                        EntityStore::apply
//!                              │
//!                          Snapshot ──denormalize──▶ (view, found)
//! ```

pub mod denormalize;
pub mod entity;
pub mod error;
pub mod normalize;
pub mod schema;
pub mod store;
pub mod view_cache;

pub use denormalize::{Denormalized, Unvisit, denormalize};
pub use entity::{EntityRef, EntitySource, EntityTable, Record, Snapshot};
pub use error::SchemaError;
pub use normalize::{NormalizeVisitor, Normalized, normalize, normalize_into};
pub use schema::{
    DEFAULT_ID_ATTRIBUTE, Discriminator, EntitySchema, Schema, UnionSchema, key_from_value,
};
pub use store::{EntityStore, ResultMeta, StoreSnapshot};
pub use view_cache::{DEFAULT_VIEW_CAPACITY, SharedView, ViewCache};
