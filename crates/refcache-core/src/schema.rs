//! Schema descriptions of nested payload shapes.
//!
//! A `Schema` is a closed set of variants. Traversal is a `match` over the
//! variant (see `normalize` and `denormalize`), so adding a variant is a
//! compile error everywhere it must be handled.
//!
//! Entity schemas are shared behind `Arc` and their nested fields can be
//! (re)defined after construction, which is how an entity refers to itself:
//!
//! ```
//! use refcache_core::{EntitySchema, Schema};
//! use std::sync::Arc;
//!
//! let user = Arc::new(EntitySchema::new("users"));
//! user.define([("friends", Schema::array(Schema::entity(&user)))]);
//! ```

use crate::error::SchemaError;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Key derivation: `(attributes, parent, key in parent) -> key`.
pub type KeyFn = Arc<dyn Fn(&Value, Option<&Value>, Option<&str>) -> Option<String> + Send + Sync>;

/// Pre-normalization transform: `(attributes, parent, key in parent) -> attributes`.
pub type ProcessFn = Arc<dyn Fn(&Value, Option<&Value>, Option<&str>) -> Value + Send + Sync>;

/// Union branch selection: `(value, parent, key in parent) -> branch name`.
pub type DiscriminatorFn =
    Arc<dyn Fn(&Value, Option<&Value>, Option<&str>) -> Option<String> + Send + Sync>;

/// Default attribute holding an entity's primary key.
pub const DEFAULT_ID_ATTRIBUTE: &str = "id";

/// Render a scalar as an entity key.
///
/// Numbers render in decimal, so `0` is a perfectly good key.
pub fn key_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(key) => Some(key.clone()),
        Value::Number(key) => Some(key.to_string()),
        _ => None,
    }
}

#[derive(Clone)]
enum KeyStrategy {
    Attribute(String),
    Function(KeyFn),
}

/// One addressable record type.
pub struct EntitySchema {
    entity_type: String,
    key: KeyStrategy,
    process: Option<ProcessFn>,
    fields: RwLock<Arc<BTreeMap<String, Schema>>>,
}

impl EntitySchema {
    /// Entity keyed by its `id` attribute, with no nested fields.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            key: KeyStrategy::Attribute(DEFAULT_ID_ATTRIBUTE.to_string()),
            process: None,
            fields: RwLock::new(Arc::new(BTreeMap::new())),
        }
    }

    /// Key the entity by a different attribute.
    pub fn with_id_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.key = KeyStrategy::Attribute(attribute.into());
        self
    }

    /// Key the entity with a custom derivation.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Value, Option<&Value>, Option<&str>) -> Option<String> + Send + Sync + 'static,
    {
        self.key = KeyStrategy::Function(Arc::new(key_fn));
        self
    }

    /// Transform raw attributes before the key is derived and fields are
    /// normalized.
    pub fn with_process<F>(mut self, process: F) -> Self
    where
        F: Fn(&Value, Option<&Value>, Option<&str>) -> Value + Send + Sync + 'static,
    {
        self.process = Some(Arc::new(process));
        self
    }

    /// Declare one nested field at construction time.
    pub fn with_field(self, name: impl Into<String>, schema: Schema) -> Self {
        self.define([(name, schema)]);
        self
    }

    /// Add or replace nested field schemas.
    ///
    /// Existing fields not named here are kept.
    pub fn define<I, K>(&self, fields: I)
    where
        I: IntoIterator<Item = (K, Schema)>,
        K: Into<String>,
    {
        let mut guard = self.fields.write();
        let next = Arc::make_mut(&mut *guard);
        for (name, schema) in fields {
            next.insert(name.into(), schema);
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Attribute holding the key, if the key is attribute-derived.
    pub fn id_attribute(&self) -> Option<&str> {
        match &self.key {
            KeyStrategy::Attribute(attribute) => Some(attribute),
            KeyStrategy::Function(_) => None,
        }
    }

    /// Current nested field schemas.
    pub fn fields(&self) -> Arc<BTreeMap<String, Schema>> {
        self.fields.read().clone()
    }

    pub(crate) fn process(&self, value: &Value, parent: Option<&Value>, key: Option<&str>) -> Value {
        match &self.process {
            Some(process) => process(value, parent, key),
            None => value.clone(),
        }
    }

    /// Derive the primary key for raw (processed) attributes.
    pub fn key_of(
        &self,
        value: &Value,
        parent: Option<&Value>,
        key: Option<&str>,
    ) -> Result<String, SchemaError> {
        let derived = match &self.key {
            KeyStrategy::Attribute(attribute) => value.get(attribute).and_then(key_from_value),
            KeyStrategy::Function(key_fn) => key_fn(value, parent, key),
        };
        derived.ok_or_else(|| SchemaError::MissingKey {
            entity_type: self.entity_type.clone(),
        })
    }
}

impl fmt::Debug for EntitySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Field schemas may point back at this entity; print names only.
        let fields = self.fields();
        f.debug_struct("EntitySchema")
            .field("entity_type", &self.entity_type)
            .field("id_attribute", &self.id_attribute())
            .field("fields", &fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// How a union picks its branch.
#[derive(Clone)]
pub enum Discriminator {
    /// Branch name is the string value of this attribute.
    Attribute(String),
    /// Branch name is computed from `(value, parent, key in parent)`.
    ///
    /// Denormalization passes the same triple, with `parent` being the
    /// container as stored (nested entities appear as keys).
    Function(DiscriminatorFn),
}

impl Discriminator {
    pub fn function<F>(select: F) -> Self
    where
        F: Fn(&Value, Option<&Value>, Option<&str>) -> Option<String> + Send + Sync + 'static,
    {
        Self::Function(Arc::new(select))
    }

    fn describe(&self) -> String {
        match self {
            Self::Attribute(attribute) => attribute.clone(),
            Self::Function(_) => "<fn>".to_string(),
        }
    }
}

impl fmt::Debug for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attribute(attribute) => f.debug_tuple("Attribute").field(attribute).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Tagged union over named branches.
#[derive(Debug, Clone)]
pub struct UnionSchema {
    discriminator: Discriminator,
    branches: BTreeMap<String, Schema>,
}

impl UnionSchema {
    pub fn new<I, K>(discriminator: Discriminator, branches: I) -> Self
    where
        I: IntoIterator<Item = (K, Schema)>,
        K: Into<String>,
    {
        Self {
            discriminator,
            branches: branches
                .into_iter()
                .map(|(name, schema)| (name.into(), schema))
                .collect(),
        }
    }

    pub fn branch(&self, name: &str) -> Option<&Schema> {
        self.branches.get(name)
    }

    pub fn branch_names(&self) -> impl Iterator<Item = &str> {
        self.branches.keys().map(String::as_str)
    }

    /// Run the discriminator, without checking the result names a branch.
    pub fn discriminate(
        &self,
        value: &Value,
        parent: Option<&Value>,
        key: Option<&str>,
    ) -> Option<String> {
        match &self.discriminator {
            Discriminator::Attribute(attribute) => value
                .get(attribute)
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            Discriminator::Function(select) => select(value, parent, key),
        }
    }

    /// Select the branch for a raw value.
    pub fn select(
        &self,
        value: &Value,
        parent: Option<&Value>,
        key: Option<&str>,
    ) -> Result<(String, &Schema), SchemaError> {
        let name = self.discriminate(value, parent, key);
        let schema = name.as_deref().and_then(|name| self.branches.get(name));
        match (name, schema) {
            (Some(name), Some(schema)) => Ok((name, schema)),
            (found, _) => Err(SchemaError::UnionMismatch {
                discriminator: self.discriminator.describe(),
                found,
            }),
        }
    }
}

/// Shape of a value inside a payload.
#[derive(Debug, Clone)]
pub enum Schema {
    /// One addressable record.
    Entity(Arc<EntitySchema>),
    /// Fixed-shape object; unlisted members pass through.
    Object(Arc<BTreeMap<String, Schema>>),
    /// Homogeneous list.
    Array(Arc<Schema>),
    /// Keyed collection with homogeneous values.
    Values(Arc<Schema>),
    /// Discriminated choice between branches.
    Union(Arc<UnionSchema>),
    /// Tombstone: the entity is removed from the table instead of merged.
    Delete(Arc<EntitySchema>),
}

impl Schema {
    pub fn entity(schema: &Arc<EntitySchema>) -> Self {
        Self::Entity(Arc::clone(schema))
    }

    pub fn object<I, K>(members: I) -> Self
    where
        I: IntoIterator<Item = (K, Schema)>,
        K: Into<String>,
    {
        Self::Object(Arc::new(
            members
                .into_iter()
                .map(|(name, schema)| (name.into(), schema))
                .collect(),
        ))
    }

    pub fn array(element: Schema) -> Self {
        Self::Array(Arc::new(element))
    }

    pub fn values(value: Schema) -> Self {
        Self::Values(Arc::new(value))
    }

    pub fn union(union: UnionSchema) -> Self {
        Self::Union(Arc::new(union))
    }

    pub fn delete(schema: &Arc<EntitySchema>) -> Self {
        Self::Delete(Arc::clone(schema))
    }

    /// The entity schema at this position, looking through `Delete`.
    pub fn as_entity(&self) -> Option<&Arc<EntitySchema>> {
        match self {
            Self::Entity(entity) | Self::Delete(entity) => Some(entity),
            _ => None,
        }
    }

    /// Whether `other` describes the same shape: the same entity and union
    /// definitions, reached through structurally equal containers.
    pub fn same(&self, other: &Schema) -> bool {
        match (self, other) {
            (Self::Entity(a), Self::Entity(b)) | (Self::Delete(a), Self::Delete(b)) => {
                Arc::ptr_eq(a, b)
            }
            (Self::Union(a), Self::Union(b)) => Arc::ptr_eq(a, b),
            (Self::Array(a), Self::Array(b)) | (Self::Values(a), Self::Values(b)) => {
                Arc::ptr_eq(a, b) || a.same(b)
            }
            (Self::Object(a), Self::Object(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.len() == b.len()
                        && a.iter()
                            .zip(b.iter())
                            .all(|((name_a, a), (name_b, b))| name_a == name_b && a.same(b)))
            }
            _ => false,
        }
    }

    /// Variant name, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Entity(_) => "entity",
            Self::Object(_) => "object",
            Self::Array(_) => "array",
            Self::Values(_) => "values",
            Self::Union(_) => "union",
            Self::Delete(_) => "delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_keys_render_in_decimal() {
        let user = EntitySchema::new("users");
        assert_eq!(user.key_of(&json!({"id": 0}), None, None), Ok("0".to_string()));
        assert_eq!(user.key_of(&json!({"id": "abc"}), None, None), Ok("abc".to_string()));
    }

    #[test]
    fn missing_key_is_schema_error() {
        let user = EntitySchema::new("users");
        let err = user
            .key_of(&json!({"name": "Ada"}), None, None)
            .expect_err("missing id must error");
        assert_eq!(
            err,
            SchemaError::MissingKey {
                entity_type: "users".to_string()
            }
        );
    }

    #[test]
    fn key_fn_sees_parent_context() {
        let comment = EntitySchema::new("comments").with_key_fn(|value, parent, _| {
            let post = parent?.get("id").and_then(key_from_value)?;
            let local = value.get("n").and_then(key_from_value)?;
            Some(format!("{post}-{local}"))
        });
        let parent = json!({"id": 7});
        assert_eq!(
            comment.key_of(&json!({"n": 2}), Some(&parent), Some("comments")),
            Ok("7-2".to_string())
        );
    }

    #[test]
    fn define_keeps_existing_fields() {
        let user = Arc::new(EntitySchema::new("users"));
        user.define([("best_friend", Schema::entity(&user))]);
        user.define([("friends", Schema::array(Schema::entity(&user)))]);
        let names: Vec<String> = user.fields().keys().cloned().collect();
        assert_eq!(names, vec!["best_friend".to_string(), "friends".to_string()]);
    }

    #[test]
    fn union_selects_by_attribute() {
        let cat = Arc::new(EntitySchema::new("cats"));
        let dog = Arc::new(EntitySchema::new("dogs"));
        let pet = UnionSchema::new(
            Discriminator::Attribute("kind".to_string()),
            [("cats", Schema::entity(&cat)), ("dogs", Schema::entity(&dog))],
        );

        let (name, schema) = pet
            .select(&json!({"kind": "dogs", "id": 1}), None, None)
            .expect("dogs branch should match");
        assert_eq!(name, "dogs");
        assert_eq!(schema.as_entity().map(|e| e.entity_type()), Some("dogs"));

        let err = pet
            .select(&json!({"kind": "fish", "id": 1}), None, None)
            .expect_err("fish has no branch");
        assert!(matches!(err, SchemaError::UnionMismatch { found: Some(ref f), .. } if f == "fish"));
    }

    #[test]
    fn same_compares_definitions_not_wrappers() {
        let user = Arc::new(EntitySchema::new("users"));
        let admin = Arc::new(EntitySchema::new("users"));

        assert!(Schema::entity(&user).same(&Schema::entity(&user)));
        assert!(!Schema::entity(&user).same(&Schema::entity(&admin)));
        assert!(
            Schema::array(Schema::entity(&user)).same(&Schema::array(Schema::entity(&user)))
        );
        assert!(
            Schema::object([("owner", Schema::entity(&user))])
                .same(&Schema::object([("owner", Schema::entity(&user))]))
        );
        assert!(
            !Schema::object([("owner", Schema::entity(&user))])
                .same(&Schema::object([("admin", Schema::entity(&user))]))
        );
        assert!(!Schema::entity(&user).same(&Schema::delete(&user)));
    }
}
