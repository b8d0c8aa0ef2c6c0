//! Reference tree + entity source -> consumer view.
//!
//! Denormalization never fails. A reference whose entity is not in the
//! source resolves to `null` and clears `found`, telling the caller a fetch
//! is needed; explicit `null` in the input is valid data and stays found.
//!
//! Entity graphs may be cyclic. Each call threads an `Unvisit` context that
//! tracks which `(type, key)` pairs are being resolved on the current path
//! and which are already done:
//! - re-entering an in-progress entity yields its shallow record (nested
//!   references left as keys), still `found`;
//! - an entity already resolved in this call is reused, never resolved
//!   twice.

use crate::entity::{EntityRef, EntitySource, Record};
use crate::schema::{EntitySchema, Schema, UnionSchema, key_from_value};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A view plus whether every reference it needed was present.
#[derive(Debug, Clone, PartialEq)]
pub struct Denormalized {
    pub value: Value,
    pub found: bool,
}

impl Denormalized {
    pub fn found(value: Value) -> Self {
        Self { value, found: true }
    }

    pub fn missing() -> Self {
        Self {
            value: Value::Null,
            found: false,
        }
    }
}

/// Traversal context for one denormalization call.
pub struct Unvisit<'a, S: EntitySource + ?Sized> {
    source: &'a S,
    in_progress: BTreeSet<EntityRef>,
    resolved: BTreeMap<EntityRef, Denormalized>,
    reads: BTreeSet<EntityRef>,
}

impl<'a, S: EntitySource + ?Sized> Unvisit<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            in_progress: BTreeSet::new(),
            resolved: BTreeMap::new(),
            reads: BTreeSet::new(),
        }
    }

    /// Every entity looked up so far, present or not.
    pub fn reads(&self) -> &BTreeSet<EntityRef> {
        &self.reads
    }

    pub fn into_reads(self) -> BTreeSet<EntityRef> {
        self.reads
    }

    fn entity(&mut self, schema: &EntitySchema, input: &Value) -> Denormalized {
        let entity_key = match input {
            Value::Null => return Denormalized::found(Value::Null),
            // Inlined record rather than a reference.
            Value::Object(record) => return self.fields(schema, record.clone()),
            other => match key_from_value(other) {
                Some(entity_key) => entity_key,
                None => return Denormalized::found(other.clone()),
            },
        };

        let entity_ref = EntityRef::new(schema.entity_type(), entity_key);
        if let Some(done) = self.resolved.get(&entity_ref) {
            return done.clone();
        }
        self.reads.insert(entity_ref.clone());
        let Some(record) = self
            .source
            .record(&entity_ref.entity_type, &entity_ref.key)
            .cloned()
        else {
            return Denormalized::missing();
        };

        if self.in_progress.contains(&entity_ref) {
            return Denormalized::found(Value::Object(record));
        }

        self.in_progress.insert(entity_ref.clone());
        let view = self.fields(schema, record);
        self.in_progress.remove(&entity_ref);
        self.resolved.insert(entity_ref, view.clone());
        view
    }

    fn fields(&mut self, schema: &EntitySchema, mut record: Record) -> Denormalized {
        let mut found = true;
        let fields = schema.fields();
        if fields.is_empty() {
            return Denormalized::found(Value::Object(record));
        }
        // Nested fields see the record as stored, like normalize saw the raw one.
        let parent = Value::Object(record.clone());
        for (field, field_schema) in fields.iter() {
            let Some(current) = parent.get(field) else {
                continue;
            };
            if current.is_null() {
                continue;
            }
            let nested = field_schema.denormalize_at(current, Some(&parent), Some(field), self);
            found &= nested.found;
            record.insert(field.clone(), nested.value);
        }
        Denormalized {
            value: Value::Object(record),
            found,
        }
    }

    fn union(
        &mut self,
        union: &UnionSchema,
        input: &Value,
        parent: Option<&Value>,
        key: Option<&str>,
    ) -> Denormalized {
        if input.is_null() {
            return Denormalized::found(Value::Null);
        }

        if let Some((id, name)) = reference_pair(input) {
            if let Some(branch) = union.branch(name) {
                return branch.denormalize_at(id, parent, key, self);
            }
        }

        let selected = union
            .discriminate(input, parent, key)
            .and_then(|name| union.branch(&name).cloned());
        match selected {
            Some(branch) => branch.denormalize_at(input, parent, key, self),
            None => {
                tracing::debug!("denormalize.union_unmatched");
                Denormalized::found(input.clone())
            }
        }
    }
}

/// `{"id": key, "schema": branch}` as written by union normalization.
fn reference_pair(input: &Value) -> Option<(&Value, &str)> {
    let object = input.as_object()?;
    if object.len() != 2 {
        return None;
    }
    let id = object.get("id")?;
    let name = object.get("schema")?.as_str()?;
    Some((id, name))
}

/// Denormalize `input` against `schema`, reading records from `source`.
///
/// `input` may be a normalized result or raw keys in the schema's shape:
/// `{"user": 1}` and `{"user": "1"}` resolve the same entity.
pub fn denormalize<S: EntitySource + ?Sized>(
    input: &Value,
    schema: &Schema,
    source: &S,
) -> Denormalized {
    let mut unvisit = Unvisit::new(source);
    schema.denormalize(input, &mut unvisit)
}

impl Schema {
    /// Denormalize one value at this schema position.
    pub fn denormalize<S: EntitySource + ?Sized>(
        &self,
        input: &Value,
        unvisit: &mut Unvisit<'_, S>,
    ) -> Denormalized {
        self.denormalize_at(input, None, None, unvisit)
    }

    /// Denormalize a value sitting under `key` in `parent`.
    ///
    /// Union discriminators receive the same `(value, parent, key)` triple
    /// they saw during normalization.
    pub fn denormalize_at<S: EntitySource + ?Sized>(
        &self,
        input: &Value,
        parent: Option<&Value>,
        key: Option<&str>,
        unvisit: &mut Unvisit<'_, S>,
    ) -> Denormalized {
        match self {
            Schema::Entity(entity) | Schema::Delete(entity) => unvisit.entity(entity, input),
            Schema::Union(union) => unvisit.union(union, input, parent, key),
            Schema::Object(members) => {
                let Value::Object(object) = input else {
                    return Denormalized::found(input.clone());
                };
                let mut output = object.clone();
                let mut found = true;
                for (name, member) in members.iter() {
                    let Some(current) = object.get(name) else {
                        continue;
                    };
                    if current.is_null() {
                        continue;
                    }
                    let nested = member.denormalize_at(current, Some(input), Some(name), unvisit);
                    found &= nested.found;
                    output.insert(name.clone(), nested.value);
                }
                Denormalized {
                    value: Value::Object(output),
                    found,
                }
            }
            Schema::Array(element) => {
                let Value::Array(items) = input else {
                    return Denormalized::found(input.clone());
                };
                let mut found = true;
                let mut output = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let position = index.to_string();
                    let nested = element.denormalize_at(item, Some(input), Some(&position), unvisit);
                    found &= nested.found;
                    output.push(nested.value);
                }
                Denormalized {
                    value: Value::Array(output),
                    found,
                }
            }
            Schema::Values(member) => {
                let Value::Object(object) = input else {
                    return Denormalized::found(input.clone());
                };
                let mut found = true;
                let mut output = serde_json::Map::new();
                for (name, current) in object {
                    let nested = member.denormalize_at(current, Some(input), Some(name), unvisit);
                    found &= nested.found;
                    output.insert(name.clone(), nested.value);
                }
                Denormalized {
                    value: Value::Object(output),
                    found,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityTable, Snapshot};
    use crate::schema::Discriminator;
    use serde_json::json;
    use std::sync::Arc;

    fn table(value: Value) -> EntityTable {
        serde_json::from_value(value).expect("table fixture should deserialize")
    }

    #[test]
    fn missing_entity_is_not_found() {
        let user = Arc::new(EntitySchema::new("users"));
        let schema = Schema::object([("user", Schema::entity(&user))]);

        let view = denormalize(&json!({"user": 1}), &schema, &EntityTable::new());
        assert!(!view.found);
        assert_eq!(view.value, json!({"user": null}));
    }

    #[test]
    fn zero_key_is_a_real_key() {
        let user = Arc::new(EntitySchema::new("users"));
        let schema = Schema::object([("user", Schema::entity(&user))]);
        let entities = table(json!({"users": {"0": {"id": 0, "name": "Root"}}}));

        let view = denormalize(&json!({"user": 0}), &schema, &entities);
        assert!(view.found);
        assert_eq!(view.value["user"]["name"], "Root");
    }

    #[test]
    fn null_member_short_circuits() {
        let user = Arc::new(EntitySchema::new("users"));
        let schema = Schema::object([("item", Schema::object([("user", Schema::entity(&user))]))]);

        let view = denormalize(&json!({"item": null}), &schema, &EntityTable::new());
        assert!(view.found);
        assert_eq!(view.value, json!({"item": null}));
    }

    #[test]
    fn self_reference_resolves_without_recursing_forever() {
        let user = Arc::new(EntitySchema::new("users"));
        user.define([("friend", Schema::entity(&user))]);
        let entities = table(json!({"users": {"1": {"id": 1, "friend": "1"}}}));

        let view = denormalize(&json!("1"), &Schema::entity(&user), &entities);
        assert!(view.found);
        assert_eq!(view.value, json!({"id": 1, "friend": {"id": 1, "friend": "1"}}));
    }

    #[test]
    fn mutual_cycle_resolves_each_entity_once() {
        let user = Arc::new(EntitySchema::new("users"));
        let team = Arc::new(EntitySchema::new("teams"));
        user.define([("team", Schema::entity(&team))]);
        team.define([("members", Schema::array(Schema::entity(&user)))]);
        let entities = table(json!({
            "users": {"a": {"id": "a", "team": "t"}, "b": {"id": "b", "team": "t"}},
            "teams": {"t": {"id": "t", "members": ["a", "b"]}}
        }));

        let mut unvisit = Unvisit::new(&entities);
        let view = Schema::entity(&user).denormalize(&json!("a"), &mut unvisit);
        assert!(view.found);
        assert_eq!(view.value["team"]["members"][0], json!({"id": "a", "team": "t"}));
        assert_eq!(view.value["team"]["members"][1]["team"], json!({"id": "t", "members": ["a", "b"]}));
        assert_eq!(unvisit.reads().len(), 3);
    }

    #[test]
    fn collection_found_is_conjunction() {
        let user = Arc::new(EntitySchema::new("users"));
        let users = Schema::array(Schema::entity(&user));
        let entities = table(json!({"users": {"1": {"id": 1}}}));

        let partial = denormalize(&json!(["1", "2"]), &users, &entities);
        assert!(!partial.found);
        assert_eq!(partial.value, json!([{"id": 1}, null]));

        let empty = denormalize(&json!([]), &users, &entities);
        assert!(empty.found);
    }

    #[test]
    fn nested_missing_entity_clears_found() {
        let user = Arc::new(EntitySchema::new("users"));
        let post = Arc::new(EntitySchema::new("posts").with_field("author", Schema::entity(&user)));
        let entities = table(json!({"posts": {"1": {"id": 1, "author": "9"}}}));

        let view = denormalize(&json!("1"), &Schema::entity(&post), &entities);
        assert!(!view.found);
        assert_eq!(view.value, json!({"id": 1, "author": null}));
    }

    #[test]
    fn union_accepts_reference_pair_or_raw_value() {
        let cat = Arc::new(EntitySchema::new("cats"));
        let dog = Arc::new(EntitySchema::new("dogs"));
        let pet = Schema::union(UnionSchema::new(
            Discriminator::Attribute("kind".to_string()),
            [("cats", Schema::entity(&cat)), ("dogs", Schema::entity(&dog))],
        ));
        let entities = table(json!({"dogs": {"1": {"id": 1, "kind": "dogs", "name": "Rex"}}}));

        let by_pair = denormalize(&json!({"id": "1", "schema": "dogs"}), &pet, &entities);
        assert!(by_pair.found);
        assert_eq!(by_pair.value["name"], "Rex");

        let missing = denormalize(&json!({"id": "1", "schema": "cats"}), &pet, &entities);
        assert!(!missing.found);

        let inline = denormalize(&json!({"kind": "dogs", "id": 2, "name": "Fido"}), &pet, &entities);
        assert!(inline.found);
        assert_eq!(inline.value["name"], "Fido");
    }

    #[test]
    fn function_discriminator_sees_member_key() {
        let cat = Arc::new(EntitySchema::new("cats"));
        let dog = Arc::new(EntitySchema::new("dogs"));
        let pets = Schema::values(Schema::union(UnionSchema::new(
            Discriminator::function(|_, _, key| {
                key.map(|key| {
                    if key.starts_with("cat") {
                        "cats".to_string()
                    } else {
                        "dogs".to_string()
                    }
                })
            }),
            [("cats", Schema::entity(&cat)), ("dogs", Schema::entity(&dog))],
        )));
        let entities = table(json!({
            "cats": {"1": {"id": 1, "name": "Tom"}},
            "dogs": {"2": {"id": 2, "name": "Rex"}}
        }));

        let view = denormalize(&json!({"cat_1": 1, "dog_2": 2}), &pets, &entities);
        assert!(view.found);
        assert_eq!(view.value["cat_1"]["name"], "Tom");
        assert_eq!(view.value["dog_2"]["name"], "Rex");
    }

    #[test]
    fn plain_and_persistent_sources_agree() {
        let user = Arc::new(EntitySchema::new("users"));
        user.define([("friends", Schema::array(Schema::entity(&user)))]);
        let schema = Schema::values(Schema::entity(&user));
        let plain = table(json!({"users": {
            "1": {"id": 1, "friends": ["2"]},
            "2": {"id": 2, "friends": ["1", "3"]}
        }}));
        let persistent = Snapshot::from(&plain);
        let input = json!({"first": "1", "second": 2});

        assert_eq!(
            denormalize(&input, &schema, &plain),
            denormalize(&input, &schema, &persistent)
        );
    }
}
