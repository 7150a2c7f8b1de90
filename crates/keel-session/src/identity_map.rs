//! Identity Map: one live instance per entity identity.
//!
//! Entities are keyed by `(root entity name, schema, serialized primary key)`,
//! so subclasses sharing a table hierarchy share one identity space. Storing a
//! second instance under an occupied key is rejected; re-fetching the same row
//! must merge into the registered instance instead of replacing it.
//!
//! Iteration follows registration order so change-set discovery, and the
//! statements derived from it, stay reproducible.

use keel_core::{EntityRef, Error, Result, ValidationError, ValidationErrorKind};
use std::collections::HashMap;

/// Key for one entity identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    /// Root entity name.
    pub root: String,
    /// Effective schema.
    pub schema: Option<String>,
    /// Serialized primary key.
    pub hash: String,
}

impl IdentityKey {
    pub fn new(root: impl Into<String>, hash: impl Into<String>, schema: Option<String>) -> Self {
        Self {
            root: root.into(),
            schema,
            hash: hash.into(),
        }
    }

    /// Key of an entity's current primary key, if it has one.
    pub fn of(entity: &EntityRef) -> Option<Self> {
        let hash = entity.serialized_primary_key()?;
        Some(Self::new(
            entity.meta().root_name(),
            hash,
            entity.effective_schema(),
        ))
    }

    /// Key an entity was registered under (which may predate a key change).
    fn registered(entity: &EntityRef) -> Option<Self> {
        let hash = entity.identity()?;
        Some(Self::new(
            entity.meta().root_name(),
            hash,
            entity.effective_schema(),
        ))
    }
}

/// Session-scoped registry of managed entities.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, (u64, EntityRef)>,
    next_seq: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity under its current identity.
    ///
    /// Re-storing the same instance is a no-op; a different instance under an
    /// occupied key is an error.
    pub fn store(&mut self, entity: &EntityRef) -> Result<()> {
        let key = IdentityKey::of(entity).ok_or_else(|| {
            Error::Validation(
                ValidationError::new(
                    ValidationErrorKind::Invalid,
                    "cannot register an entity without a primary key",
                )
                .entity(entity.entity_name()),
            )
        })?;

        if let Some((_, existing)) = self.entries.get(&key) {
            if existing == entity {
                return Ok(());
            }
            return Err(Error::Validation(
                ValidationError::new(
                    ValidationErrorKind::Invalid,
                    format!("another instance is already registered as [{}]", key.hash),
                )
                .entity(entity.entity_name()),
            ));
        }

        // re-keying after a primary key change
        if let Some(previous) = IdentityKey::registered(entity) {
            if previous != key {
                self.entries.remove(&previous);
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        entity.set_identity(Some(key.hash.clone()));
        tracing::trace!(entity = %key.root, pk = %key.hash, "Identity registered");
        self.entries.insert(key, (seq, entity.clone()));
        Ok(())
    }

    /// Look up a registered instance.
    pub fn get_by_hash(&self, root: &str, hash: &str, schema: Option<&str>) -> Option<EntityRef> {
        let key = IdentityKey::new(root, hash, schema.map(str::to_string));
        self.entries.get(&key).map(|(_, e)| e.clone())
    }

    /// Look up by a prepared key.
    pub fn get(&self, key: &IdentityKey) -> Option<EntityRef> {
        self.entries.get(key).map(|(_, e)| e.clone())
    }

    /// Unregister an entity. Must happen before its primary key changes.
    pub fn delete(&mut self, entity: &EntityRef) -> bool {
        let Some(key) = IdentityKey::registered(entity).or_else(|| IdentityKey::of(entity)) else {
            return false;
        };
        let removed = match self.entries.get(&key) {
            Some((_, existing)) if existing == entity => self.entries.remove(&key).is_some(),
            _ => false,
        };
        if removed {
            entity.set_identity(None);
        }
        removed
    }

    /// Is this exact instance registered?
    pub fn contains(&self, entity: &EntityRef) -> bool {
        IdentityKey::registered(entity)
            .and_then(|key| self.entries.get(&key))
            .is_some_and(|(_, existing)| existing == entity)
    }

    /// Registered entities in registration order.
    pub fn entities(&self) -> Vec<EntityRef> {
        let mut all: Vec<&(u64, EntityRef)> = self.entries.values().collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every registration.
    pub fn clear(&mut self) -> Vec<EntityRef> {
        let all = self.entities();
        for entity in &all {
            entity.set_identity(None);
        }
        self.entries.clear();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{EntityMetadata, MetadataStorage, PropertyMeta, Value};

    fn storage() -> MetadataStorage {
        MetadataStorage::new([
            EntityMetadata::new("Author")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::scalar("name")),
            EntityMetadata::new("Editor")
                .root("Author")
                .property(PropertyMeta::id("id")),
        ])
        .unwrap()
    }

    fn author(storage: &MetadataStorage, id: i64) -> EntityRef {
        let entity = storage.instantiate("Author").unwrap();
        entity.set_raw("id", Value::BigInt(id));
        entity
    }

    #[test]
    fn test_store_and_get_returns_same_instance() {
        let storage = storage();
        let mut map = IdentityMap::new();
        let a = author(&storage, 1);
        map.store(&a).unwrap();
        map.store(&a).unwrap();

        assert_eq!(map.len(), 1);
        assert_eq!(map.get_by_hash("Author", "1", None), Some(a));
    }

    #[test]
    fn test_store_rejects_second_instance() {
        let storage = storage();
        let mut map = IdentityMap::new();
        map.store(&author(&storage, 1)).unwrap();
        assert!(map.store(&author(&storage, 1)).is_err());
    }

    #[test]
    fn test_subtypes_share_root_identity() {
        let storage = storage();
        let mut map = IdentityMap::new();
        let editor = storage.instantiate("Editor").unwrap();
        editor.set_raw("id", Value::Int(5));
        map.store(&editor).unwrap();
        assert_eq!(map.get_by_hash("Author", "5", None), Some(editor));
    }

    #[test]
    fn test_delete_uses_registered_key() {
        let storage = storage();
        let mut map = IdentityMap::new();
        let a = author(&storage, 1);
        map.store(&a).unwrap();

        a.set_raw("id", Value::BigInt(2));
        assert!(map.delete(&a));
        assert!(map.is_empty());
        assert!(a.identity().is_none());
    }

    #[test]
    fn test_entities_in_registration_order() {
        let storage = storage();
        let mut map = IdentityMap::new();
        let ids = [5, 3, 9, 1];
        for id in ids {
            map.store(&author(&storage, id)).unwrap();
        }
        let order: Vec<String> = map
            .entities()
            .iter()
            .filter_map(EntityRef::serialized_primary_key)
            .collect();
        assert_eq!(order, vec!["5", "3", "9", "1"]);
    }

    #[test]
    fn test_schema_partitions_identity() {
        let storage = storage();
        let mut map = IdentityMap::new();
        let a = author(&storage, 1);
        let b = author(&storage, 1);
        b.set_schema(Some("tenant".into()));
        map.store(&a).unwrap();
        map.store(&b).unwrap();
        assert_eq!(map.get_by_hash("Author", "1", Some("tenant")), Some(b));
        assert_eq!(map.get_by_hash("Author", "1", None), Some(a));
    }
}
