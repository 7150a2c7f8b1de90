//! Change sets: one entity's pending database operation.

use keel_core::snapshot::{EntitySnapshot, Payload, PayloadValue};
use keel_core::{EntityMetadata, EntityRef, PrimaryKey, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// The operation a change set performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSetType {
    Create,
    Update,
    Delete,
    /// Update executed before inserts to free a unique value.
    UpdateEarly,
    /// Delete executed before inserts to free a unique value or primary key.
    DeleteEarly,
}

impl ChangeSetType {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChangeSetType::Create => "create",
            ChangeSetType::Update => "update",
            ChangeSetType::Delete => "delete",
            ChangeSetType::UpdateEarly => "update_early",
            ChangeSetType::DeleteEarly => "delete_early",
        }
    }
}

impl fmt::Display for ChangeSetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entity's pending operation.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub entity: EntityRef,
    pub meta: Arc<EntityMetadata>,
    pub kind: ChangeSetType,
    /// Changed (update) or insertable (create) fields.
    pub payload: Payload,
    /// Primary key at computation time (absent for creates with generated keys).
    pub primary_key: Option<PrimaryKey>,
    pub serialized_primary_key: Option<String>,
    /// Persisted snapshot the payload was diffed against.
    pub original: Option<EntitySnapshot>,
    /// Effective schema.
    pub schema: Option<String>,
    /// Set once the statement for this change set has executed.
    pub persisted: bool,
}

impl ChangeSet {
    pub fn new(entity: &EntityRef, kind: ChangeSetType, payload: Payload) -> Self {
        let primary_key = entity.primary_key();
        Self {
            entity: entity.clone(),
            meta: entity.meta(),
            kind,
            payload,
            serialized_primary_key: primary_key.as_ref().map(PrimaryKey::serialize),
            primary_key,
            original: entity.original_snapshot(),
            schema: entity.effective_schema(),
            persisted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn root_name(&self) -> &str {
        self.meta.root_name()
    }

    /// Refresh the primary key from the entity (after the store generated it).
    pub fn refresh_primary_key(&mut self) {
        self.primary_key = self.entity.primary_key();
        self.serialized_primary_key = self.primary_key.as_ref().map(PrimaryKey::serialize);
    }

    /// Original (persisted) value of a field.
    pub fn original_value(&self, field: &str) -> Option<&Value> {
        self.original.as_ref().and_then(|o| o.get(field))
    }

    /// Payload value of a field as a concrete value, if resolved.
    pub fn payload_value(&self, field: &str) -> Option<Value> {
        self.payload.get(field).and_then(PayloadValue::resolve)
    }

    /// Fields whose forward references cannot be resolved yet.
    pub fn unresolved_fields(&self) -> Vec<String> {
        self.payload
            .iter()
            .filter(|(_, v)| v.has_pending() && v.resolve().is_none())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Entities the payload points at that are not persisted yet.
    pub fn pending_targets(&self) -> Vec<EntityRef> {
        self.payload
            .values()
            .flat_map(PayloadValue::pending_targets)
            .filter(|t| t.primary_key().is_none())
            .collect()
    }
}

/// Which phase an extra update runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraUpdatePhase {
    /// Before any delete: sets nullable references between removed rows to
    /// NULL so either row can go first.
    Detach,
    /// After early updates, before inserts: writes the final value of a
    /// unique field that was moved out of the way.
    Unique,
    /// After regular updates: writes a forward reference whose target did
    /// not exist when the owning row was inserted.
    Circular,
}

/// A deferred follow-up update for a subset of one entity's fields.
#[derive(Debug, Clone)]
pub struct ExtraUpdate {
    pub entity: EntityRef,
    pub meta: Arc<EntityMetadata>,
    /// Deferred field names.
    pub fields: Vec<String>,
    /// Values to write once the phase runs.
    pub values: Payload,
    /// Values the fields held in the store before the flush.
    pub previous_values: BTreeMap<String, Value>,
    /// Index of the change set the fields were stripped from.
    pub owning_change_set: Option<usize>,
    pub target_phase: ExtraUpdatePhase,
    pub schema: Option<String>,
}

impl ExtraUpdate {
    /// Strip `fields` from a change set payload into an extra update.
    pub fn strip(
        change_set: &mut ChangeSet,
        index: usize,
        fields: &[String],
        phase: ExtraUpdatePhase,
    ) -> Self {
        let mut values = Payload::new();
        let mut previous_values = BTreeMap::new();
        for field in fields {
            if let Some(value) = change_set.payload.remove(field) {
                values.insert(field.clone(), value);
            }
            if let Some(previous) = change_set.original_value(field) {
                previous_values.insert(field.clone(), previous.clone());
            }
        }
        Self {
            entity: change_set.entity.clone(),
            meta: Arc::clone(&change_set.meta),
            fields: fields.to_vec(),
            values,
            previous_values,
            owning_change_set: Some(index),
            target_phase: phase,
            schema: change_set.schema.clone(),
        }
    }

    /// Write NULL into `fields` of a row that is about to be deleted.
    pub fn detach(change_set: &ChangeSet, fields: &[String]) -> Self {
        let values = fields
            .iter()
            .map(|f| (f.clone(), PayloadValue::Value(Value::Null)))
            .collect();
        let previous_values = fields
            .iter()
            .filter_map(|f| Some((f.clone(), change_set.original_value(f)?.clone())))
            .collect();
        Self {
            entity: change_set.entity.clone(),
            meta: Arc::clone(&change_set.meta),
            fields: fields.to_vec(),
            values,
            previous_values,
            owning_change_set: None,
            target_phase: ExtraUpdatePhase::Detach,
            schema: change_set.schema.clone(),
        }
    }
}

/// Insertion-ordered set of entities (persist / remove / orphan stacks).
#[derive(Debug, Default, Clone)]
pub struct EntitySet {
    items: Vec<EntityRef>,
    index: HashSet<EntityRef>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert; returns `false` if already present.
    pub fn insert(&mut self, entity: &EntityRef) -> bool {
        if self.index.insert(entity.clone()) {
            self.items.push(entity.clone());
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, entity: &EntityRef) -> bool {
        if self.index.remove(entity) {
            self.items.retain(|e| e != entity);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.index.contains(entity)
    }

    pub fn to_vec(&self) -> Vec<EntityRef> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }
}

/// Summary of one executed change set, kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSetSummary {
    pub entity: String,
    pub kind: ChangeSetType,
    pub primary_key: Option<String>,
    /// Payload fields with resolved values (forward references as NULL).
    pub payload: BTreeMap<String, Value>,
}

impl From<&ChangeSet> for ChangeSetSummary {
    fn from(cs: &ChangeSet) -> Self {
        Self {
            entity: cs.meta.name.clone(),
            kind: cs.kind,
            primary_key: cs.serialized_primary_key.clone(),
            payload: cs
                .payload
                .iter()
                .map(|(k, v)| (k.clone(), v.resolve().unwrap_or(Value::Null)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{MetadataStorage, PropertyMeta};

    fn author() -> EntityRef {
        let storage = MetadataStorage::new([keel_core::EntityMetadata::new("Author")
            .property(PropertyMeta::id("id"))
            .property(PropertyMeta::scalar("code").unique().nullable())])
        .unwrap();
        storage.instantiate("Author").unwrap()
    }

    #[test]
    fn test_strip_moves_fields_into_extra_update() {
        let entity = author();
        entity.set_raw("id", Value::BigInt(1));
        entity.set_original(Some(BTreeMap::from([(
            "code".to_string(),
            Value::from("a"),
        )])));
        let mut payload = Payload::new();
        payload.insert("code".into(), PayloadValue::Value(Value::from("b")));
        let mut cs = ChangeSet::new(&entity, ChangeSetType::Update, payload);

        let extra = ExtraUpdate::strip(&mut cs, 0, &["code".to_string()], ExtraUpdatePhase::Unique);
        assert!(cs.payload.is_empty());
        assert_eq!(extra.values.get("code"), Some(&PayloadValue::Value(Value::from("b"))));
        assert_eq!(extra.previous_values.get("code"), Some(&Value::from("a")));
        assert_eq!(extra.owning_change_set, Some(0));
    }

    #[test]
    fn test_entity_set_keeps_insertion_order() {
        let a = author();
        let b = author();
        let mut set = EntitySet::new();
        assert!(set.insert(&b));
        assert!(set.insert(&a));
        assert!(!set.insert(&b));
        assert_eq!(set.to_vec(), vec![b.clone(), a.clone()]);
        assert!(set.remove(&b));
        assert_eq!(set.to_vec(), vec![a]);
    }
}
