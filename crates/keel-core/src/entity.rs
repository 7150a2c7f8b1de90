//! Entity handles and per-entity change-tracking state.
//!
//! An [`EntityRef`] is a cheap, clonable shared handle to one in-memory
//! entity. Identity is by pointer: two handles are equal only if they point
//! at the same instance, which is what the identity map guarantees for one
//! primary key.
//!
//! All mutations go through explicit setters (`set`, `set_reference`,
//! `collection(..).add(..)`), which record the changed field in the entity's
//! dirty-field set and mark it touched. Methods suffixed `_raw` mutate without
//! propagating to the inverse side of a relation; they are used for the one
//! level of propagation and by the unit of work itself.
//!
//! Locking discipline: at most one entity lock is held at a time. Methods
//! collect what they need, release the lock, then visit related entities.

use crate::collection::{Collection, CollectionHandle};
use crate::error::{Result, ValidationError, ValidationErrorKind};
use crate::metadata::{EntityMetadata, ReferenceKind};
use crate::snapshot::EntitySnapshot;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Separator between primary key fragments in a serialized primary key.
pub const PRIMARY_KEY_SEPARATOR: &str = "~~~";

/// Callbacks an entity uses to reach the unit of work managing it.
pub trait SessionLink: Send + Sync {
    /// Unique id of the managing session.
    fn session_id(&self) -> u64;
    /// Queue an entity for deletion unless it is referenced again before commit.
    fn schedule_orphan_removal(&self, entity: &EntityRef);
    /// Drop an entity from the orphan-removal stack.
    fn cancel_orphan_removal(&self, entity: &EntityRef);
    /// Remove the entity from the identity map (its primary key is about to change).
    fn unregister(&self, entity: &EntityRef);
}

/// Primary key values in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrimaryKey(pub Vec<Value>);

impl PrimaryKey {
    /// The key values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Stable string form used as the identity-map hash.
    pub fn serialize(&self) -> String {
        self.0
            .iter()
            .map(Value::identity_fragment)
            .collect::<Vec<_>>()
            .join(PRIMARY_KEY_SEPARATOR)
    }

    /// Single value for simple keys, an array for composite keys.
    pub fn as_value(&self) -> Value {
        match self.0.as_slice() {
            [single] => single.clone(),
            many => Value::Array(many.to_vec()),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

impl From<Value> for PrimaryKey {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(values) => PrimaryKey(values),
            other => PrimaryKey(vec![other]),
        }
    }
}

impl From<Vec<Value>> for PrimaryKey {
    fn from(values: Vec<Value>) -> Self {
        PrimaryKey(values)
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        PrimaryKey(vec![Value::BigInt(value)])
    }
}

impl From<i32> for PrimaryKey {
    fn from(value: i32) -> Self {
        PrimaryKey(vec![Value::Int(value)])
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        PrimaryKey(vec![Value::Text(value.to_string())])
    }
}

/// The state behind an [`EntityRef`].
pub struct EntityData {
    meta: Arc<EntityMetadata>,
    values: BTreeMap<String, Value>,
    references: BTreeMap<String, Option<EntityRef>>,
    collections: BTreeMap<String, Collection>,
    managed: bool,
    initialized: bool,
    touched: bool,
    original: Option<EntitySnapshot>,
    loaded: BTreeSet<String>,
    dirty_fields: BTreeSet<String>,
    schema: Option<String>,
    identity: Option<String>,
    session: Option<Weak<dyn SessionLink>>,
}

impl EntityData {
    fn session(&self) -> Option<Arc<dyn SessionLink>> {
        self.session.as_ref().and_then(Weak::upgrade)
    }
}

/// Shared handle to one entity instance.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<EntityData>>);

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(data) => {
                let pk: Vec<String> = data
                    .meta
                    .primary_keys()
                    .iter()
                    .map(|p| {
                        data.values
                            .get(&p.name)
                            .map_or_else(|| "?".to_string(), Value::identity_fragment)
                    })
                    .collect();
                write!(f, "{}[{}]", data.meta.name, pk.join(PRIMARY_KEY_SEPARATOR))
            }
            Err(_) => write!(f, "EntityRef(<locked>)"),
        }
    }
}

impl EntityRef {
    /// Create a new, unmanaged entity with empty fields and empty collections.
    pub fn new(meta: Arc<EntityMetadata>) -> Self {
        let mut references = BTreeMap::new();
        let mut collections = BTreeMap::new();
        for prop in &meta.properties {
            if prop.kind.is_to_one() {
                references.insert(prop.name.clone(), None);
            } else if prop.kind.is_to_many() {
                let mut collection = Collection::new(&prop.name);
                if prop.read_only {
                    collection.set_read_only(true);
                }
                collections.insert(prop.name.clone(), collection);
            }
        }
        EntityRef(Arc::new(RwLock::new(EntityData {
            meta,
            values: BTreeMap::new(),
            references,
            collections,
            managed: false,
            initialized: true,
            touched: false,
            original: None,
            loaded: BTreeSet::new(),
            dirty_fields: BTreeSet::new(),
            schema: None,
            identity: None,
            session: None,
        })))
    }

    fn read(&self) -> RwLockReadGuard<'_, EntityData> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityData> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Entity metadata.
    pub fn meta(&self) -> Arc<EntityMetadata> {
        Arc::clone(&self.read().meta)
    }

    /// Entity type name.
    pub fn entity_name(&self) -> String {
        self.read().meta.name.clone()
    }

    // ------------------------------------------------------------------
    // Tracked mutation API
    // ------------------------------------------------------------------

    /// Get a scalar field value.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.read().values.get(name).cloned()
    }

    /// Set a scalar field, recording it as dirty.
    ///
    /// Changing a primary key of a registered entity unregisters it from the
    /// identity map first.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let (primary_changed, session) = {
            let data = self.read();
            let prop = data.meta.require_prop(name)?;
            if prop.kind != ReferenceKind::Scalar {
                return Err(ValidationError::new(
                    ValidationErrorKind::Invalid,
                    "relations are changed with set_reference or collection",
                )
                .entity(&data.meta.name)
                .property(name)
                .into());
            }
            let changed = data.values.get(name) != Some(&value);
            (prop.primary && changed && data.identity.is_some(), data.session())
        };

        if primary_changed {
            if let Some(session) = session {
                session.unregister(self);
            }
        }

        let mut data = self.write();
        data.values.insert(name.to_string(), value);
        data.loaded.insert(name.to_string());
        data.dirty_fields.insert(name.to_string());
        data.touched = true;
        Ok(())
    }

    /// Current target of a to-one reference.
    pub fn reference(&self, name: &str) -> Option<EntityRef> {
        self.read().references.get(name).cloned().flatten()
    }

    /// Set a to-one reference and propagate to the inverse side.
    ///
    /// Clearing a non-nullable many-to-one whose inverse collection neither
    /// removes orphans nor cascades deletes in the store is rejected with
    /// [`ValidationErrorKind::OrphanRemovalRequired`].
    pub fn set_reference(&self, name: &str, target: Option<&EntityRef>) -> Result<()> {
        let (prop, old, session) = {
            let data = self.read();
            let prop = data.meta.require_prop(name)?.clone();
            if !prop.kind.is_to_one() {
                return Err(ValidationError::new(
                    ValidationErrorKind::Invalid,
                    "not a to-one reference",
                )
                .entity(&data.meta.name)
                .property(name)
                .into());
            }
            let old = data.references.get(name).cloned().flatten();
            (prop, old, data.session())
        };

        if old.as_ref() == target {
            return Ok(());
        }
        if let Some(target) = target {
            self.check_same_session(target)?;
        }

        let mut schedule_old_as_orphan = prop.is_owning_to_one() && prop.orphan_removal;
        if target.is_none() && prop.kind == ReferenceKind::ManyToOne && !prop.nullable {
            if let (Some(old), Some(inverse)) = (&old, prop.inversed_by.as_deref()) {
                let inverse_orphans = old
                    .meta()
                    .prop(inverse)
                    .is_some_and(|p| p.orphan_removal);
                if !inverse_orphans && !prop.delete_cascade {
                    return Err(ValidationError::new(
                        ValidationErrorKind::OrphanRemovalRequired,
                        "cannot clear a non-nullable reference without orphan removal",
                    )
                    .entity(self.entity_name())
                    .property(name)
                    .into());
                }
                schedule_old_as_orphan = false;
                if inverse_orphans {
                    if let Some(session) = &session {
                        session.schedule_orphan_removal(self);
                    }
                }
            }
        }

        self.set_reference_raw(name, target);

        if let Some(inverse) = prop.inverse_name() {
            match prop.kind {
                ReferenceKind::ManyToOne => {
                    if let Some(old) = &old {
                        old.collection_remove_raw(inverse, self);
                    }
                    if let Some(target) = target {
                        target.collection_add_raw(inverse, self);
                    }
                }
                ReferenceKind::OneToOne if prop.owner => {
                    if let Some(old) = &old {
                        old.set_reference_raw(inverse, None);
                    }
                    if let Some(target) = target {
                        if let Some(previous_owner) = target.reference(inverse) {
                            if &previous_owner != self {
                                previous_owner.set_reference_raw(name, None);
                            }
                        }
                        target.set_reference_raw(inverse, Some(self));
                    }
                }
                ReferenceKind::OneToOne => {
                    if let Some(old) = &old {
                        old.set_reference_raw(inverse, None);
                    }
                    if let Some(target) = target {
                        target.set_reference_raw(inverse, Some(self));
                    }
                }
                _ => {}
            }
        }

        if let Some(session) = session {
            if schedule_old_as_orphan {
                if let Some(old) = &old {
                    session.schedule_orphan_removal(old);
                }
            }
            if let Some(target) = target {
                session.cancel_orphan_removal(target);
            }
        }
        Ok(())
    }

    /// Handle for a to-many collection.
    pub fn collection(&self, name: &str) -> Result<CollectionHandle> {
        let data = self.read();
        let prop = data.meta.require_prop(name)?;
        if !prop.kind.is_to_many() {
            return Err(ValidationError::new(ValidationErrorKind::Invalid, "not a collection")
                .entity(&data.meta.name)
                .property(name)
                .into());
        }
        Ok(CollectionHandle::new(self.clone(), name))
    }

    /// Fail if `other` is managed by a different session than this entity.
    pub fn check_same_session(&self, other: &EntityRef) -> Result<()> {
        match (self.session_id(), other.session_id()) {
            (Some(a), Some(b)) if a != b => Err(ValidationError::new(
                ValidationErrorKind::ForeignSession,
                "entity is managed by a different unit of work",
            )
            .entity(other.entity_name())
            .into()),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------

    /// Registered with a unit of work.
    pub fn is_managed(&self) -> bool {
        self.read().managed
    }

    /// Fully loaded (false for placeholder references).
    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Mutated since the last snapshot.
    pub fn is_touched(&self) -> bool {
        self.read().touched
    }

    /// Last-known persisted field values, absent for new entities.
    pub fn original_snapshot(&self) -> Option<EntitySnapshot> {
        self.read().original.clone()
    }

    /// Has a persisted snapshot.
    pub fn has_original(&self) -> bool {
        self.read().original.is_some()
    }

    /// Names of the properties that hold loaded or assigned values.
    pub fn loaded_properties(&self) -> BTreeSet<String> {
        self.read().loaded.clone()
    }

    /// Fields set through the tracked API since the last snapshot.
    pub fn dirty_fields(&self) -> BTreeSet<String> {
        self.read().dirty_fields.clone()
    }

    /// Schema override for this instance.
    pub fn schema(&self) -> Option<String> {
        self.read().schema.clone()
    }

    /// Effective schema: the instance override, else the metadata default.
    pub fn effective_schema(&self) -> Option<String> {
        let data = self.read();
        data.schema.clone().or_else(|| data.meta.schema.clone())
    }

    /// Primary key, if every key field holds a non-NULL value.
    pub fn primary_key(&self) -> Option<PrimaryKey> {
        let data = self.read();
        let mut values = Vec::new();
        for prop in data.meta.primary_keys() {
            match data.values.get(&prop.name) {
                Some(v) if !v.is_null() => values.push(v.clone()),
                _ => return None,
            }
        }
        Some(PrimaryKey(values))
    }

    /// Serialized primary key used as the identity-map hash.
    pub fn serialized_primary_key(&self) -> Option<String> {
        self.primary_key().map(|pk| pk.serialize())
    }

    /// Serialized key this entity is registered under in the identity map.
    pub fn identity(&self) -> Option<String> {
        self.read().identity.clone()
    }

    /// Id of the managing session, if any.
    pub fn session_id(&self) -> Option<u64> {
        let session = self.read().session();
        session.map(|s| s.session_id())
    }

    /// The managing session, if it is still alive.
    pub fn session(&self) -> Option<Arc<dyn SessionLink>> {
        self.read().session()
    }

    /// Every scalar value.
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.read().values.clone()
    }

    /// Every to-one reference (including empty ones).
    pub fn references(&self) -> BTreeMap<String, Option<EntityRef>> {
        self.read().references.clone()
    }

    // ------------------------------------------------------------------
    // Raw (non-propagating) state updates
    // ------------------------------------------------------------------

    pub fn set_managed(&self, managed: bool) {
        self.write().managed = managed;
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.write().initialized = initialized;
    }

    pub fn set_schema(&self, schema: Option<String>) {
        self.write().schema = schema;
    }

    pub fn set_identity(&self, identity: Option<String>) {
        self.write().identity = identity;
    }

    pub fn set_session(&self, session: Option<Weak<dyn SessionLink>>) {
        self.write().session = session;
    }

    pub fn set_original(&self, original: Option<EntitySnapshot>) {
        self.write().original = original;
    }

    /// Merge fields into the persisted snapshot.
    pub fn merge_original(&self, fields: &BTreeMap<String, Value>) {
        let mut data = self.write();
        let original = data.original.get_or_insert_with(BTreeMap::new);
        for (name, value) in fields {
            original.insert(name.clone(), value.clone());
        }
    }

    /// Forget the touched flag and the dirty-field set.
    pub fn clear_tracking(&self) {
        let mut data = self.write();
        data.touched = false;
        data.dirty_fields.clear();
    }

    /// Set a scalar value without tracking (hydration and store reconciliation).
    pub fn set_raw(&self, name: &str, value: Value) {
        let mut data = self.write();
        data.loaded.insert(name.to_string());
        data.values.insert(name.to_string(), value);
    }

    /// Remove a scalar value without tracking (undoing store reconciliation).
    pub fn unset_raw(&self, name: &str) {
        self.write().values.remove(name);
    }

    /// Set a to-one reference without inverse propagation; the field is tracked.
    pub fn set_reference_raw(&self, name: &str, target: Option<&EntityRef>) {
        let mut data = self.write();
        let slot = data.references.entry(name.to_string()).or_insert(None);
        if slot.as_ref() == target {
            return;
        }
        *slot = target.cloned();
        data.loaded.insert(name.to_string());
        data.dirty_fields.insert(name.to_string());
        data.touched = true;
    }

    /// Set a to-one reference without tracking (hydration).
    pub fn hydrate_reference(&self, name: &str, target: Option<&EntityRef>) {
        let mut data = self.write();
        data.references.insert(name.to_string(), target.cloned());
        data.loaded.insert(name.to_string());
    }

    // ------------------------------------------------------------------
    // Collection storage
    // ------------------------------------------------------------------

    pub(crate) fn with_collection<R>(
        &self,
        name: &str,
        f: impl FnOnce(&Collection) -> R,
    ) -> Option<R> {
        self.read().collections.get(name).map(f)
    }

    pub(crate) fn with_collection_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Collection) -> R,
    ) -> Option<R> {
        let mut data = self.write();
        data.collections.get_mut(name).map(f)
    }

    /// Current collection members.
    pub fn collection_items(&self, name: &str) -> Vec<EntityRef> {
        self.with_collection(name, |c| c.items().to_vec())
            .unwrap_or_default()
    }

    /// Collection members as last synchronised with the store.
    pub fn collection_snapshot(&self, name: &str) -> Option<Vec<EntityRef>> {
        self.with_collection(name, |c| c.snapshot().map(<[EntityRef]>::to_vec))
            .flatten()
    }

    pub fn collection_is_dirty(&self, name: &str) -> bool {
        self.with_collection(name, Collection::is_dirty)
            .unwrap_or(false)
    }

    /// Add without propagation; marks the owner touched when membership changes.
    pub fn collection_add_raw(&self, name: &str, item: &EntityRef) -> bool {
        let mut data = self.write();
        let added = data
            .collections
            .get_mut(name)
            .is_some_and(|c| c.add_raw(item));
        if added {
            data.touched = true;
        }
        added
    }

    /// Remove without propagation; marks the owner touched when membership changes.
    pub fn collection_remove_raw(&self, name: &str, item: &EntityRef) -> bool {
        let mut data = self.write();
        let removed = data
            .collections
            .get_mut(name)
            .is_some_and(|c| c.remove_raw(item));
        if removed {
            data.touched = true;
        }
        removed
    }

    /// Snapshot one collection without propagation.
    pub fn take_collection_snapshot_raw(&self, name: &str) {
        self.with_collection_mut(name, Collection::take_snapshot_raw);
    }

    /// Snapshot every collection of this entity without propagation.
    pub fn take_all_collection_snapshots(&self) {
        let mut data = self.write();
        for collection in data.collections.values_mut() {
            collection.take_snapshot_raw();
        }
    }

    /// Mark every collection as not yet loaded (the owner came from storage).
    pub fn mark_collections_uninitialized(&self) {
        let mut data = self.write();
        for collection in data.collections.values_mut() {
            collection.mark_uninitialized();
        }
    }

    /// Names of the collections whose membership changed.
    pub fn dirty_collections(&self) -> Vec<String> {
        self.read()
            .collections
            .iter()
            .filter(|(_, c)| c.is_dirty())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataStorage, PropertyMeta};
    use std::collections::HashSet;

    fn storage() -> MetadataStorage {
        MetadataStorage::new([
            EntityMetadata::new("Author")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::scalar("name"))
                .property(PropertyMeta::one_to_many("books", "Book", "author")),
            EntityMetadata::new("Book")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::scalar("title"))
                .property(
                    PropertyMeta::many_to_one("author", "Author")
                        .inversed_by("books")
                        .nullable(),
                ),
            EntityMetadata::new("User")
                .property(PropertyMeta::id("id"))
                .property(
                    PropertyMeta::one_to_one("profile", "Profile")
                        .inversed_by("user")
                        .nullable(),
                ),
            EntityMetadata::new("Profile")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::one_to_one_inverse("user", "User", "profile")),
        ])
        .unwrap()
    }

    #[test]
    fn test_identity_is_by_pointer() {
        let storage = storage();
        let a = storage.instantiate("Author").unwrap();
        let b = storage.instantiate("Author").unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);

        let set: HashSet<EntityRef> = [a.clone(), a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_set_tracks_dirty_field() {
        let author = storage().instantiate("Author").unwrap();
        author.set("name", "Ada").unwrap();
        assert!(author.is_touched());
        assert!(author.dirty_fields().contains("name"));
        assert_eq!(author.get("name"), Some(Value::Text("Ada".into())));
    }

    #[test]
    fn test_set_unknown_property_is_metadata_error() {
        let author = storage().instantiate("Author").unwrap();
        assert!(author.set("nickname", "A").unwrap_err().is_metadata());
    }

    #[test]
    fn test_primary_key_requires_all_fields() {
        let author = storage().instantiate("Author").unwrap();
        assert!(author.primary_key().is_none());
        author.set("id", 7_i64).unwrap();
        assert_eq!(author.serialized_primary_key().as_deref(), Some("7"));
    }

    #[test]
    fn test_composite_key_serialization() {
        let pk = PrimaryKey(vec![Value::BigInt(1), Value::Text("en".into())]);
        assert_eq!(pk.serialize(), "1~~~en");
        assert_eq!(
            pk.as_value(),
            Value::Array(vec![Value::BigInt(1), Value::Text("en".into())])
        );
    }

    #[test]
    fn test_many_to_one_propagates_to_inverse_collection() {
        let storage = storage();
        let first = storage.instantiate("Author").unwrap();
        let second = storage.instantiate("Author").unwrap();
        let book = storage.instantiate("Book").unwrap();

        book.set_reference("author", Some(&first)).unwrap();
        assert_eq!(first.collection_items("books"), vec![book.clone()]);

        book.set_reference("author", Some(&second)).unwrap();
        assert!(first.collection_items("books").is_empty());
        assert_eq!(second.collection_items("books"), vec![book.clone()]);
        assert!(second.collection_is_dirty("books"));
    }

    #[test]
    fn test_one_to_one_propagates_both_ways() {
        let storage = storage();
        let user = storage.instantiate("User").unwrap();
        let other = storage.instantiate("User").unwrap();
        let profile = storage.instantiate("Profile").unwrap();

        user.set_reference("profile", Some(&profile)).unwrap();
        assert_eq!(profile.reference("user"), Some(user.clone()));

        profile.set_reference("user", Some(&other)).unwrap();
        assert_eq!(other.reference("profile"), Some(profile.clone()));
        assert_eq!(user.reference("profile"), None);
    }

    #[test]
    fn test_set_on_relation_is_rejected() {
        let book = storage().instantiate("Book").unwrap();
        let err = book.set("author", 1_i64).unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::Invalid));
    }
}
