//! Error types for normalization.
//!
//! Denormalization has no error type: missing data is reported through the
//! `found` flag, never raised.

/// A payload does not fit the schema it is being normalized against.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The key derivation for an entity produced nothing usable.
    #[error("entity `{entity_type}` has no usable primary key")]
    MissingKey { entity_type: String },

    /// A union discriminator did not select any of its branches.
    #[error("union discriminator `{discriminator}` matched no schema (got {found:?})")]
    UnionMismatch {
        discriminator: String,
        found: Option<String>,
    },

    /// The value at a schema position has the wrong JSON kind.
    #[error("unexpected input given to normalize: expected {expected}, found {found}")]
    InvalidInput {
        expected: &'static str,
        found: &'static str,
    },
}

/// JSON kind name used in `InvalidInput` messages.
pub(crate) fn kind_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
