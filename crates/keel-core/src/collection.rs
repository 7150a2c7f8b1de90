//! Write-side bookkeeping for to-many relations.
//!
//! A [`Collection`] is the data stored inside the owning entity: an ordered,
//! de-duplicated member list, a snapshot of the members as last synchronised
//! with the store, and a dirty flag. A [`CollectionHandle`] is the user-facing
//! view that validates mutations and propagates them one level to the inverse
//! side of the relation using the non-propagating `_raw` operations.

use crate::entity::EntityRef;
use crate::error::{Result, ValidationError, ValidationErrorKind};
use crate::metadata::{Cascade, PropertyMeta, ReferenceKind};

/// Members of one to-many relation of one entity.
#[derive(Debug, Clone)]
pub struct Collection {
    property: String,
    items: Vec<EntityRef>,
    snapshot: Option<Vec<EntityRef>>,
    dirty: bool,
    read_only: bool,
    initialized: bool,
}

impl Collection {
    /// An empty collection for a newly created owner.
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            items: Vec::new(),
            snapshot: None,
            dirty: false,
            read_only: false,
            initialized: true,
        }
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn items(&self) -> &[EntityRef] {
        &self.items
    }

    /// Members as last synchronised, `None` if never initialised from storage.
    pub fn snapshot(&self) -> Option<&[EntityRef]> {
        self.snapshot.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn contains(&self, item: &EntityRef) -> bool {
        self.items.contains(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Append `item` unless present. Returns whether membership changed.
    pub fn add_raw(&mut self, item: &EntityRef) -> bool {
        if self.items.contains(item) {
            return false;
        }
        self.items.push(item.clone());
        self.dirty = true;
        true
    }

    /// Remove `item` if present. Returns whether membership changed.
    pub fn remove_raw(&mut self, item: &EntityRef) -> bool {
        let before = self.items.len();
        self.items.retain(|existing| existing != item);
        let removed = self.items.len() != before;
        if removed {
            self.dirty = true;
        }
        removed
    }

    /// Record current membership as the synchronised state.
    pub fn take_snapshot_raw(&mut self) {
        self.snapshot = Some(self.items.clone());
        self.dirty = false;
        self.initialized = true;
    }

    /// Replace members with loaded items and snapshot them.
    pub fn hydrate(&mut self, items: Vec<EntityRef>) {
        let mut unique: Vec<EntityRef> = Vec::with_capacity(items.len());
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        self.items = unique;
        self.take_snapshot_raw();
    }

    /// Mark a loaded owner's collection as not yet initialised from storage.
    pub fn mark_uninitialized(&mut self) {
        self.initialized = false;
        self.snapshot = None;
        self.dirty = false;
    }
}

/// Handle to one collection of one entity.
#[derive(Debug, Clone)]
pub struct CollectionHandle {
    owner: EntityRef,
    property: String,
}

impl CollectionHandle {
    pub(crate) fn new(owner: EntityRef, property: &str) -> Self {
        Self {
            owner,
            property: property.to_string(),
        }
    }

    /// The owning entity.
    pub fn owner(&self) -> &EntityRef {
        &self.owner
    }

    /// The relation property name.
    pub fn property(&self) -> &str {
        &self.property
    }

    fn prop(&self) -> Result<PropertyMeta> {
        Ok(self.owner.meta().require_prop(&self.property)?.clone())
    }

    fn ensure_writable(&self) -> Result<()> {
        let read_only = self
            .owner
            .with_collection(&self.property, Collection::is_read_only)
            .unwrap_or(false);
        if read_only {
            return Err(ValidationError::new(
                ValidationErrorKind::ReadOnlyCollection,
                "collection is read-only",
            )
            .entity(self.owner.entity_name())
            .property(&self.property)
            .into());
        }
        Ok(())
    }

    /// Add `item` and propagate to the inverse side. Adding a member twice is a no-op.
    pub fn add(&self, item: &EntityRef) -> Result<()> {
        self.ensure_writable()?;
        self.owner.check_same_session(item)?;
        let prop = self.prop()?;

        if !self.owner.collection_add_raw(&self.property, item) {
            return Ok(());
        }
        tracing::trace!(
            entity = %prop.target.as_deref().unwrap_or_default(),
            property = %self.property,
            "Collection member added"
        );

        if let Some(inverse) = prop.inverse_name() {
            match prop.kind {
                ReferenceKind::OneToMany => {
                    let previous = item.reference(inverse);
                    if let Some(previous) = previous {
                        if previous != self.owner {
                            previous.collection_remove_raw(&self.property, item);
                        }
                    }
                    item.set_reference_raw(inverse, Some(&self.owner));
                }
                ReferenceKind::ManyToMany => {
                    item.collection_add_raw(inverse, &self.owner);
                }
                _ => {}
            }
        }

        if let Some(session) = self.owner.session() {
            session.cancel_orphan_removal(item);
        }
        Ok(())
    }

    /// Add several items.
    pub fn add_all(&self, items: &[EntityRef]) -> Result<()> {
        for item in items {
            self.add(item)?;
        }
        Ok(())
    }

    /// Remove `item` and propagate to the inverse side. Removing an absent item is a no-op.
    ///
    /// Removing from a one-to-many whose owning reference is non-nullable
    /// requires orphan removal (or cascading removal): the item would
    /// otherwise be left pointing at an owner that no longer lists it.
    pub fn remove(&self, item: &EntityRef) -> Result<()> {
        self.ensure_writable()?;
        let prop = self.prop()?;
        if !self.contains(item) {
            return Ok(());
        }

        let delete_item = prop.orphan_removal || prop.cascade.contains(&Cascade::Remove);
        let mut clear_owning_reference = false;
        if prop.kind == ReferenceKind::OneToMany {
            if let Some(mapped_by) = prop.mapped_by.as_deref() {
                let owning = item.meta().require_prop(mapped_by)?.clone();
                if !owning.nullable && !delete_item {
                    return Err(ValidationError::new(
                        ValidationErrorKind::OrphanRemovalRequired,
                        format!(
                            "removing from '{}' requires orphan removal \
                             because '{}' is not nullable",
                            self.property, mapped_by
                        ),
                    )
                    .entity(self.owner.entity_name())
                    .property(&self.property)
                    .into());
                }
                clear_owning_reference = owning.nullable;
            }
        }

        self.owner.collection_remove_raw(&self.property, item);

        if let Some(inverse) = prop.inverse_name() {
            match prop.kind {
                ReferenceKind::OneToMany => {
                    if clear_owning_reference
                        && item.reference(inverse).as_ref() == Some(&self.owner)
                    {
                        item.set_reference_raw(inverse, None);
                    }
                }
                ReferenceKind::ManyToMany => {
                    item.collection_remove_raw(inverse, &self.owner);
                }
                _ => {}
            }
        }

        if delete_item {
            if let Some(session) = self.owner.session() {
                session.schedule_orphan_removal(item);
            }
        }
        Ok(())
    }

    /// Remove every member.
    pub fn remove_all(&self) -> Result<()> {
        for item in self.items() {
            self.remove(&item)?;
        }
        Ok(())
    }

    pub fn contains(&self, item: &EntityRef) -> bool {
        self.owner
            .with_collection(&self.property, |c| c.contains(item))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.owner
            .with_collection(&self.property, Collection::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn items(&self) -> Vec<EntityRef> {
        self.owner.collection_items(&self.property)
    }

    pub fn is_dirty(&self) -> bool {
        self.owner.collection_is_dirty(&self.property)
    }

    pub fn is_initialized(&self) -> bool {
        self.owner
            .with_collection(&self.property, Collection::is_initialized)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Option<Vec<EntityRef>> {
        self.owner.collection_snapshot(&self.property)
    }

    /// Record current membership as synchronised and propagate the snapshot
    /// to the counterpart collections of a many-to-many relation.
    pub fn take_snapshot(&self) -> Result<()> {
        let prop = self.prop()?;
        self.owner.take_collection_snapshot_raw(&self.property);
        if prop.kind == ReferenceKind::ManyToMany {
            if let Some(inverse) = prop.inverse_name() {
                for item in self.items() {
                    item.take_collection_snapshot_raw(inverse);
                }
            }
        }
        Ok(())
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.owner
            .with_collection_mut(&self.property, |c| c.set_read_only(read_only));
    }

    /// Load members from storage: replaces the contents and takes a snapshot.
    pub fn hydrate(&self, items: Vec<EntityRef>) {
        self.owner
            .with_collection_mut(&self.property, |c| c.hydrate(items));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMetadata, MetadataStorage};

    fn storage(nullable_author: bool, orphan_removal: bool) -> MetadataStorage {
        let mut author_ref = PropertyMeta::many_to_one("author", "Author").inversed_by("books");
        if nullable_author {
            author_ref = author_ref.nullable();
        }
        let mut books = PropertyMeta::one_to_many("books", "Book", "author");
        if orphan_removal {
            books = books.orphan_removal();
        }
        MetadataStorage::new([
            EntityMetadata::new("Author")
                .property(PropertyMeta::id("id"))
                .property(books)
                .property(PropertyMeta::many_to_many("tags", "Tag").inversed_by("authors")),
            EntityMetadata::new("Book")
                .property(PropertyMeta::id("id"))
                .property(author_ref),
            EntityMetadata::new("Tag")
                .property(PropertyMeta::id("id"))
                .property(PropertyMeta::many_to_many_inverse("authors", "Author", "tags")),
        ])
        .unwrap()
    }

    #[test]
    fn test_add_is_idempotent() {
        let storage = storage(true, false);
        let author = storage.instantiate("Author").unwrap();
        let book = storage.instantiate("Book").unwrap();
        let books = author.collection("books").unwrap();

        books.add(&book).unwrap();
        books.add(&book).unwrap();
        assert_eq!(books.len(), 1);
        assert!(books.is_dirty());
        assert_eq!(book.reference("author"), Some(author.clone()));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let storage = storage(false, false);
        let author = storage.instantiate("Author").unwrap();
        let book = storage.instantiate("Book").unwrap();
        let books = author.collection("books").unwrap();

        books.remove(&book).unwrap();
        assert!(books.is_empty());
        assert!(!books.is_dirty());
    }

    #[test]
    fn test_remove_nullable_clears_owning_reference() {
        let storage = storage(true, false);
        let author = storage.instantiate("Author").unwrap();
        let book = storage.instantiate("Book").unwrap();
        let books = author.collection("books").unwrap();

        books.add(&book).unwrap();
        books.remove(&book).unwrap();
        assert_eq!(book.reference("author"), None);
        assert!(book.dirty_fields().contains("author"));
    }

    #[test]
    fn test_remove_non_nullable_requires_orphan_removal() {
        let storage = storage(false, false);
        let author = storage.instantiate("Author").unwrap();
        let book = storage.instantiate("Book").unwrap();
        let books = author.collection("books").unwrap();
        books.add(&book).unwrap();

        let err = books.remove(&book).unwrap_err();
        assert_eq!(
            err.validation_kind(),
            Some(ValidationErrorKind::OrphanRemovalRequired)
        );
        assert!(books.contains(&book));
    }

    #[test]
    fn test_remove_non_nullable_with_orphan_removal_keeps_reference() {
        let storage = storage(false, true);
        let author = storage.instantiate("Author").unwrap();
        let book = storage.instantiate("Book").unwrap();
        let books = author.collection("books").unwrap();
        books.add(&book).unwrap();

        books.remove(&book).unwrap();
        assert!(books.is_empty());
        assert_eq!(book.reference("author"), Some(author.clone()));
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let storage = storage(true, false);
        let author = storage.instantiate("Author").unwrap();
        let book = storage.instantiate("Book").unwrap();
        let books = author.collection("books").unwrap();
        books.set_read_only(true);

        let err = books.add(&book).unwrap_err();
        assert_eq!(
            err.validation_kind(),
            Some(ValidationErrorKind::ReadOnlyCollection)
        );
    }

    #[test]
    fn test_many_to_many_propagates_and_snapshots_inverse() {
        let storage = storage(true, false);
        let author = storage.instantiate("Author").unwrap();
        let tag = storage.instantiate("Tag").unwrap();
        let tags = author.collection("tags").unwrap();

        tags.add(&tag).unwrap();
        assert_eq!(tag.collection_items("authors"), vec![author.clone()]);
        assert!(tag.collection_is_dirty("authors"));

        tags.take_snapshot().unwrap();
        assert!(!tags.is_dirty());
        assert_eq!(tags.snapshot(), Some(vec![tag.clone()]));
        assert!(!tag.collection_is_dirty("authors"));

        tags.remove(&tag).unwrap();
        assert!(tag.collection_items("authors").is_empty());
    }

    #[test]
    fn test_moving_item_between_owners() {
        let storage = storage(true, false);
        let first = storage.instantiate("Author").unwrap();
        let second = storage.instantiate("Author").unwrap();
        let book = storage.instantiate("Book").unwrap();

        first.collection("books").unwrap().add(&book).unwrap();
        second.collection("books").unwrap().add(&book).unwrap();
        assert!(first.collection_items("books").is_empty());
        assert_eq!(second.collection_items("books"), vec![book.clone()]);
    }
}
