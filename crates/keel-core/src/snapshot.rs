//! Entity snapshots and the field comparator.
//!
//! `prepare` flattens an entity into its persistable fields: scalar values,
//! owning to-one references as the target's primary key, and inline
//! many-to-many arrays. A reference whose target has no primary key yet is
//! kept as [`PayloadValue::Pending`] and resolved once the target row exists.
//! `diff` compares a prepared form with the stored snapshot.

use crate::entity::EntityRef;
use crate::metadata::{EntityMetadata, PropertyMeta, ReferenceKind};
use crate::value::Value;
use std::collections::BTreeMap;

/// Last-known persisted field values of one entity.
pub type EntitySnapshot = BTreeMap<String, Value>;

/// Changed or insertable fields of one change set.
pub type Payload = BTreeMap<String, PayloadValue>;

/// A payload field value.
#[derive(Debug, Clone)]
pub enum PayloadValue {
    /// A concrete value.
    Value(Value),
    /// Forward reference to an entity that is not persisted yet.
    Pending(EntityRef),
    /// Ordered identifiers of an inline to-many relation.
    List(Vec<PayloadValue>),
}

impl PartialEq for PayloadValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PayloadValue::Value(a), PayloadValue::Value(b)) => values_equal(a, b),
            (PayloadValue::Pending(a), PayloadValue::Pending(b)) => a == b,
            (PayloadValue::List(a), PayloadValue::List(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Value> for PayloadValue {
    fn from(value: Value) -> Self {
        PayloadValue::Value(value)
    }
}

impl PayloadValue {
    /// Resolve to a concrete value; `None` while a forward reference has no key.
    pub fn resolve(&self) -> Option<Value> {
        match self {
            PayloadValue::Value(v) => Some(v.clone()),
            PayloadValue::Pending(target) => target.primary_key().map(|pk| pk.as_value()),
            PayloadValue::List(items) => items
                .iter()
                .map(PayloadValue::resolve)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
        }
    }

    /// Entities this value waits for.
    pub fn pending_targets(&self) -> Vec<EntityRef> {
        match self {
            PayloadValue::Value(_) => Vec::new(),
            PayloadValue::Pending(target) => vec![target.clone()],
            PayloadValue::List(items) => {
                items.iter().flat_map(PayloadValue::pending_targets).collect()
            }
        }
    }

    /// Contains a forward reference (resolved or not).
    pub fn has_pending(&self) -> bool {
        !self.pending_targets().is_empty()
    }

    /// The concrete value, if this is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PayloadValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

fn reference_value(target: &EntityRef) -> PayloadValue {
    match target.primary_key() {
        Some(pk) => PayloadValue::Value(pk.as_value()),
        None => PayloadValue::Pending(target.clone()),
    }
}

/// Flatten an entity into its persistable fields.
///
/// Placeholder references (not initialised) contribute only their primary key
/// and the fields explicitly set since they were created.
pub fn prepare(entity: &EntityRef) -> Payload {
    let meta = entity.meta();
    let values = entity.values();
    let references = entity.references();
    let loaded = entity.loaded_properties();
    let dirty = entity.dirty_fields();
    let initialized = entity.is_initialized();

    let mut payload = Payload::new();
    for prop in meta.properties.iter().filter(|p| p.is_persisted()) {
        if !initialized && !prop.primary && !dirty.contains(&prop.name) {
            continue;
        }
        match prop.kind {
            ReferenceKind::Scalar => {
                if let Some(value) = values.get(&prop.name) {
                    payload.insert(prop.name.clone(), PayloadValue::Value(value.clone()));
                }
            }
            ReferenceKind::ManyToOne | ReferenceKind::OneToOne => {
                match references.get(&prop.name) {
                    Some(Some(target)) => {
                        payload.insert(prop.name.clone(), reference_value(target));
                    }
                    _ if loaded.contains(&prop.name) => {
                        payload.insert(prop.name.clone(), PayloadValue::Value(Value::Null));
                    }
                    _ => {}
                }
            }
            ReferenceKind::ManyToMany => {
                let items = entity.collection_items(&prop.name);
                payload.insert(
                    prop.name.clone(),
                    PayloadValue::List(items.iter().map(reference_value).collect()),
                );
            }
            ReferenceKind::OneToMany => {}
        }
    }
    payload
}

/// Persistable snapshot of an entity; unresolved forward references are omitted.
pub fn take(entity: &EntityRef) -> EntitySnapshot {
    to_snapshot(&prepare(entity))
}

/// Convert a prepared payload into a snapshot.
pub fn to_snapshot(payload: &Payload) -> EntitySnapshot {
    payload
        .iter()
        .filter_map(|(name, value)| value.resolve().map(|v| (name.clone(), v)))
        .collect()
}

/// Fields of `current` that differ from `original`.
///
/// Without an original snapshot every field is returned. Forward references
/// always count as changed.
pub fn diff(
    meta: &EntityMetadata,
    current: &Payload,
    original: Option<&EntitySnapshot>,
) -> Payload {
    let Some(original) = original else {
        return current.clone();
    };
    let mut changed = Payload::new();
    for (name, value) in current {
        let differs = match value.resolve() {
            Some(resolved) if !value.has_pending() => {
                let previous = original.get(name).unwrap_or(&Value::Null);
                !field_equals(meta.prop(name), &resolved, previous)
            }
            _ => true,
        };
        if differs {
            tracing::trace!(entity = %meta.name, field = %name, "Field changed");
            changed.insert(name.clone(), value.clone());
        }
    }
    changed
}

/// Compare two values of one property, honouring a custom comparator.
pub fn field_equals(prop: Option<&PropertyMeta>, a: &Value, b: &Value) -> bool {
    match prop.and_then(|p| p.comparator.as_ref()) {
        Some(cmp) => cmp(a, b),
        None => values_equal(a, b),
    }
}

/// Value equality where integer widths compare by magnitude.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (
            Value::Int(_) | Value::BigInt(_),
            Value::Int(_) | Value::BigInt(_),
        ) => a.as_i64() == b.as_i64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        _ => a == b,
    }
}
