//! Payload tree -> reference tree + entity delta.
//!
//! Traversal writes into a `NormalizeVisitor` that owns a fresh delta table;
//! nothing touches a shared store until the caller applies the finished
//! `Normalized` (see `EntityStore::apply`). Within one traversal, repeated
//! writes to the same `(type, key)` merge field by field, last write in
//! traversal order winning.
//!
//! A failing entity never reaches the delta, but entities that completed
//! before the failure stay in the visitor. `normalize` discards them along
//! with the error; `normalize_into` leaves them with the caller.

use crate::entity::{EntityRef, EntityTable, Record};
use crate::error::{SchemaError, kind_of};
use crate::schema::{EntitySchema, Schema, key_from_value};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeSet;

/// Result of normalizing one payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Normalized {
    /// Payload shape with entities replaced by their keys.
    pub result: Value,
    /// Every entity record reached during traversal.
    pub entities: EntityTable,
    /// Entities tombstoned by a `Delete` schema.
    pub deleted: BTreeSet<EntityRef>,
}

/// Accumulates the entity delta for one traversal.
#[derive(Debug, Default)]
pub struct NormalizeVisitor {
    entities: EntityTable,
    deleted: BTreeSet<EntityRef>,
}

impl NormalizeVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a finished entity record into the delta.
    pub fn merge(&mut self, entity_ref: EntityRef, record: Record) {
        self.entities.merge(entity_ref, record);
    }

    /// Mark an entity for removal.
    pub fn delete(&mut self, entity_ref: EntityRef) {
        self.entities.remove(&entity_ref);
        self.deleted.insert(entity_ref);
    }

    pub fn finish(self, result: Value) -> Normalized {
        Normalized {
            result,
            entities: self.entities,
            deleted: self.deleted,
        }
    }
}

/// Normalize `payload` against `schema`.
///
/// The root must be an object or an array; scalars cannot carry entities.
pub fn normalize(payload: &Value, schema: &Schema) -> Result<Normalized, SchemaError> {
    let mut visitor = NormalizeVisitor::new();
    let result = normalize_into(payload, schema, &mut visitor)?;
    let normalized = visitor.finish(result);
    tracing::debug!(
        schema = schema.kind(),
        entities = normalized.entities.len(),
        deleted = normalized.deleted.len(),
        "normalize.done"
    );
    Ok(normalized)
}

/// Normalize `payload` into a caller-owned visitor.
///
/// On error the visitor still holds every entity that completed before the
/// failure, ready to `finish` and apply.
pub fn normalize_into(
    payload: &Value,
    schema: &Schema,
    visitor: &mut NormalizeVisitor,
) -> Result<Value, SchemaError> {
    if !(payload.is_object() || payload.is_array()) {
        return Err(SchemaError::InvalidInput {
            expected: "object or array",
            found: kind_of(payload),
        });
    }
    schema
        .normalize(payload, None, None, visitor)
        .inspect_err(|err| {
            tracing::debug!(
                schema = schema.kind(),
                entities = visitor.entities.len(),
                error = %err,
                "normalize.failed"
            );
        })
}

impl Schema {
    /// Normalize one value at this schema position.
    ///
    /// `parent` and `key` describe where the value sits in its container and
    /// are handed to key functions, process strategies and discriminators.
    pub fn normalize(
        &self,
        value: &Value,
        parent: Option<&Value>,
        key: Option<&str>,
        visitor: &mut NormalizeVisitor,
    ) -> Result<Value, SchemaError> {
        match self {
            Schema::Entity(entity) => normalize_entity(entity, value, parent, key, visitor),
            Schema::Delete(entity) => normalize_delete(entity, value, parent, key, visitor),
            Schema::Object(members) => {
                let Value::Object(input) = value else {
                    return Ok(value.clone());
                };
                let mut output = input.clone();
                for (name, member) in members.iter() {
                    let Some(current) = input.get(name) else {
                        continue;
                    };
                    let normalized = member.normalize(current, Some(value), Some(name), visitor)?;
                    if normalized.is_null() {
                        output.remove(name);
                    } else {
                        output.insert(name.clone(), normalized);
                    }
                }
                Ok(Value::Object(output))
            }
            Schema::Array(element) => {
                let Value::Array(items) = value else {
                    return Ok(value.clone());
                };
                let mut output = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let position = index.to_string();
                    output.push(element.normalize(item, Some(value), Some(&position), visitor)?);
                }
                Ok(Value::Array(output))
            }
            Schema::Values(member) => {
                let Value::Object(input) = value else {
                    return Ok(value.clone());
                };
                let mut output = serde_json::Map::new();
                for (name, current) in input {
                    let normalized = member.normalize(current, Some(value), Some(name), visitor)?;
                    if !normalized.is_null() {
                        output.insert(name.clone(), normalized);
                    }
                }
                Ok(Value::Object(output))
            }
            Schema::Union(union) => {
                if value.is_null() {
                    return Ok(Value::Null);
                }
                let (branch_name, branch) = union.select(value, parent, key)?;
                let id = branch.normalize(value, parent, key, visitor)?;
                if id.is_null() {
                    return Ok(Value::Null);
                }
                Ok(json!({ "id": id, "schema": branch_name }))
            }
        }
    }
}

fn normalize_entity(
    entity: &EntitySchema,
    value: &Value,
    parent: Option<&Value>,
    key: Option<&str>,
    visitor: &mut NormalizeVisitor,
) -> Result<Value, SchemaError> {
    match value {
        Value::Object(_) => {}
        // Already a reference.
        Value::Null | Value::String(_) | Value::Number(_) => return Ok(value.clone()),
        other => {
            return Err(SchemaError::InvalidInput {
                expected: "object or key",
                found: kind_of(other),
            });
        }
    }

    let processed = entity.process(value, parent, key);
    let entity_key = entity.key_of(&processed, parent, key)?;
    let mut record = match processed {
        Value::Object(record) => record,
        other => {
            return Err(SchemaError::InvalidInput {
                expected: "object",
                found: kind_of(&other),
            });
        }
    };

    // Nested entities merge as they are reached; this record is only merged
    // once every field normalized, so a failure here leaves no partial row.
    let fields = entity.fields();
    for (field, field_schema) in fields.iter() {
        let Some(current) = record.get(field) else {
            continue;
        };
        if !(current.is_object() || current.is_array()) {
            continue;
        }
        let normalized = field_schema.normalize(current, Some(value), Some(field), visitor)?;
        record.insert(field.clone(), normalized);
    }

    visitor.merge(EntityRef::new(entity.entity_type(), entity_key.as_str()), record);
    Ok(Value::String(entity_key))
}

fn normalize_delete(
    entity: &EntitySchema,
    value: &Value,
    parent: Option<&Value>,
    key: Option<&str>,
    visitor: &mut NormalizeVisitor,
) -> Result<Value, SchemaError> {
    let entity_key = match value {
        Value::Null => return Ok(Value::Null),
        Value::Object(_) => {
            let processed = entity.process(value, parent, key);
            entity.key_of(&processed, parent, key)?
        }
        other => key_from_value(other).ok_or_else(|| SchemaError::InvalidInput {
            expected: "object or key",
            found: kind_of(other),
        })?,
    };
    visitor.delete(EntityRef::new(entity.entity_type(), entity_key.as_str()));
    Ok(Value::String(entity_key))
}
