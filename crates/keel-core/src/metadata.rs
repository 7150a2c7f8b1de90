//! Entity and property metadata.
//!
//! Metadata is the structural description of an entity type: its table,
//! primary key, scalar columns and relations. It is normally produced by a
//! discovery layer; here it is built explicitly with builder setters and then
//! registered in a [`MetadataStorage`], which validates relation consistency
//! and synthesises pivot-table metadata for owning many-to-many relations.

use crate::entity::EntityRef;
use crate::error::{Error, Result};
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Value initializer run by the change set computer (on create or on update).
pub type Initializer = Arc<dyn Fn() -> Value + Send + Sync>;

/// Field comparator: returns `true` when both values are considered equal.
pub type Comparator = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// The kind of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Plain column value.
    Scalar,
    /// Many-to-one reference (always the owning side).
    ManyToOne,
    /// One-to-one reference (owning side holds the foreign key).
    OneToOne,
    /// One-to-many collection (always the inverse side).
    OneToMany,
    /// Many-to-many collection.
    ManyToMany,
}

impl ReferenceKind {
    /// Is this a to-one reference?
    pub const fn is_to_one(self) -> bool {
        matches!(self, ReferenceKind::ManyToOne | ReferenceKind::OneToOne)
    }

    /// Is this a to-many collection?
    pub const fn is_to_many(self) -> bool {
        matches!(self, ReferenceKind::OneToMany | ReferenceKind::ManyToMany)
    }
}

/// State transitions propagated along a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Cascade {
    Persist,
    Remove,
    Merge,
}

/// Metadata about a single entity property.
#[derive(Clone)]
pub struct PropertyMeta {
    /// Property name (also the column key in driver rows).
    pub name: String,
    /// Scalar or relation kind.
    pub kind: ReferenceKind,
    /// Part of the primary key.
    pub primary: bool,
    /// Column accepts NULL.
    pub nullable: bool,
    /// Column carries a unique constraint.
    pub unique: bool,
    /// Optimistic-lock version column.
    pub version: bool,
    /// Compared against the stored value on update (optimistic locking without a version).
    pub concurrency_check: bool,
    /// Value generated by the store on insert.
    pub auto_increment: bool,
    /// Server-side default applied when the column is omitted on insert.
    pub default: Option<Value>,
    /// Initializer run before computing a CREATE change set when the field is empty.
    pub on_create: Option<Initializer>,
    /// Initializer run when an UPDATE change set already modifies another field.
    pub on_update: Option<Initializer>,
    /// Custom equality used when diffing snapshots.
    pub comparator: Option<Comparator>,
    /// Target entity name for relations.
    pub target: Option<String>,
    /// Owning side of the relation (holds the foreign key or the pivot rows).
    pub owner: bool,
    /// Name of the owning property on the target (inverse side).
    pub mapped_by: Option<String>,
    /// Name of the inverse property on the target (owning side).
    pub inversed_by: Option<String>,
    /// Cascaded state transitions.
    pub cascade: Vec<Cascade>,
    /// Delete items once they are detached from this relation.
    pub orphan_removal: bool,
    /// The store deletes referencing rows when the target row is deleted.
    pub delete_cascade: bool,
    /// Collection rejects mutation.
    pub read_only: bool,
    /// Collection order is significant and persisted.
    pub fixed_order: bool,
    /// Owning many-to-many stored as an inline array of target identifiers.
    pub inline: bool,
    /// Pivot entity name for owning many-to-many relations.
    pub pivot_table: Option<String>,
}

impl fmt::Debug for PropertyMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyMeta")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("primary", &self.primary)
            .field("nullable", &self.nullable)
            .field("unique", &self.unique)
            .field("version", &self.version)
            .field("target", &self.target)
            .field("owner", &self.owner)
            .field("mapped_by", &self.mapped_by)
            .field("inversed_by", &self.inversed_by)
            .field("cascade", &self.cascade)
            .field("orphan_removal", &self.orphan_removal)
            .field("pivot_table", &self.pivot_table)
            .finish_non_exhaustive()
    }
}

impl PropertyMeta {
    fn new(name: impl Into<String>, kind: ReferenceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            primary: false,
            nullable: false,
            unique: false,
            version: false,
            concurrency_check: false,
            auto_increment: false,
            default: None,
            on_create: None,
            on_update: None,
            comparator: None,
            target: None,
            owner: false,
            mapped_by: None,
            inversed_by: None,
            cascade: Vec::new(),
            orphan_removal: false,
            delete_cascade: false,
            read_only: false,
            fixed_order: false,
            inline: false,
            pivot_table: None,
        }
    }

    /// A plain column.
    pub fn scalar(name: impl Into<String>) -> Self {
        Self::new(name, ReferenceKind::Scalar)
    }

    /// An auto-increment primary key column.
    pub fn id(name: impl Into<String>) -> Self {
        Self::scalar(name).primary().auto_increment()
    }

    /// A many-to-one reference to `target`.
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut prop = Self::new(name, ReferenceKind::ManyToOne);
        prop.target = Some(target.into());
        prop.owner = true;
        prop
    }

    /// The owning side of a one-to-one reference to `target`.
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut prop = Self::new(name, ReferenceKind::OneToOne);
        prop.target = Some(target.into());
        prop.owner = true;
        prop
    }

    /// The inverse side of a one-to-one reference, mapped by `mapped_by` on `target`.
    pub fn one_to_one_inverse(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut prop = Self::new(name, ReferenceKind::OneToOne);
        prop.target = Some(target.into());
        prop.mapped_by = Some(mapped_by.into());
        prop.nullable = true;
        prop
    }

    /// A one-to-many collection mapped by the many-to-one `mapped_by` on `target`.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut prop = Self::new(name, ReferenceKind::OneToMany);
        prop.target = Some(target.into());
        prop.mapped_by = Some(mapped_by.into());
        prop
    }

    /// The owning side of a many-to-many collection.
    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut prop = Self::new(name, ReferenceKind::ManyToMany);
        prop.target = Some(target.into());
        prop.owner = true;
        prop
    }

    /// The inverse side of a many-to-many collection.
    pub fn many_to_many_inverse(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut prop = Self::new(name, ReferenceKind::ManyToMany);
        prop.target = Some(target.into());
        prop.mapped_by = Some(mapped_by.into());
        prop
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn version(mut self) -> Self {
        self.version = true;
        self
    }

    pub fn concurrency_check(mut self) -> Self {
        self.concurrency_check = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn on_create(mut self, init: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.on_create = Some(Arc::new(init));
        self
    }

    pub fn on_update(mut self, init: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(init));
        self
    }

    pub fn comparator(
        mut self,
        cmp: impl Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.comparator = Some(Arc::new(cmp));
        self
    }

    pub fn inversed_by(mut self, inverse: impl Into<String>) -> Self {
        self.inversed_by = Some(inverse.into());
        self
    }

    pub fn cascade(mut self, cascade: &[Cascade]) -> Self {
        for c in cascade {
            if !self.cascade.contains(c) {
                self.cascade.push(*c);
            }
        }
        self
    }

    pub fn orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }

    pub fn delete_cascade(mut self) -> Self {
        self.delete_cascade = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn fixed_order(mut self) -> Self {
        self.fixed_order = true;
        self
    }

    pub fn inline(mut self) -> Self {
        self.inline = true;
        self
    }

    pub fn pivot_table(mut self, pivot: impl Into<String>) -> Self {
        self.pivot_table = Some(pivot.into());
        self
    }

    /// Does this property cascade the given transition?
    ///
    /// Orphan removal implies cascading removal.
    pub fn cascades(&self, cascade: Cascade) -> bool {
        self.cascade.contains(&cascade) || (cascade == Cascade::Remove && self.orphan_removal)
    }

    /// Owning to-one reference (holds a foreign key).
    pub fn is_owning_to_one(&self) -> bool {
        self.kind.is_to_one() && self.owner
    }

    /// Owning many-to-many synchronised through a pivot table.
    pub fn uses_pivot(&self) -> bool {
        self.kind == ReferenceKind::ManyToMany && self.owner && !self.inline
    }

    /// Name of the property on the other side of a bidirectional relation.
    pub fn inverse_name(&self) -> Option<&str> {
        if self.owner {
            self.inversed_by.as_deref()
        } else {
            self.mapped_by.as_deref()
        }
    }

    /// Part of the persisted payload (scalars, owning to-one, inline arrays).
    pub fn is_persisted(&self) -> bool {
        match self.kind {
            ReferenceKind::Scalar => true,
            ReferenceKind::ManyToOne | ReferenceKind::OneToOne => self.owner,
            ReferenceKind::OneToMany => false,
            ReferenceKind::ManyToMany => self.owner && self.inline,
        }
    }

    /// The store fills this column when it is omitted on insert.
    pub fn is_generated(&self) -> bool {
        self.auto_increment || self.default.is_some() || self.version
    }
}

/// Metadata about an entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    /// Entity type name.
    pub name: String,
    /// Table (or collection) name.
    pub table: String,
    /// Default schema.
    pub schema: Option<String>,
    /// Root entity name for single-table inheritance.
    pub root: Option<String>,
    /// Entities of this type are never written.
    pub read_only: bool,
    /// Synthesised pivot metadata for a many-to-many relation.
    pub pivot: bool,
    /// Properties in declaration order.
    pub properties: Vec<PropertyMeta>,
}

impl EntityMetadata {
    /// Create metadata for `name`; the table defaults to the snake-cased name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let table = to_snake_case(&name);
        Self {
            name,
            table,
            schema: None,
            root: None,
            read_only: false,
            pivot: false,
            properties: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn property(mut self, prop: PropertyMeta) -> Self {
        self.properties.push(prop);
        self
    }

    /// Root entity name used for identity map keys.
    pub fn root_name(&self) -> &str {
        self.root.as_deref().unwrap_or(&self.name)
    }

    /// Look up a property by name.
    pub fn prop(&self, name: &str) -> Option<&PropertyMeta> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Look up a property, failing with a [`MetadataError`](crate::MetadataError).
    pub fn require_prop(&self, name: &str) -> Result<&PropertyMeta> {
        self.prop(name).ok_or_else(|| {
            Error::metadata(&self.name, format!("unknown property '{}'", name))
        })
    }

    /// Primary key properties in declaration order.
    pub fn primary_keys(&self) -> Vec<&PropertyMeta> {
        self.properties.iter().filter(|p| p.primary).collect()
    }

    /// Primary key property names in declaration order.
    pub fn primary_key_names(&self) -> Vec<String> {
        self.primary_keys().iter().map(|p| p.name.clone()).collect()
    }

    /// The version property, if the entity is versioned.
    pub fn version_property(&self) -> Option<&PropertyMeta> {
        self.properties.iter().find(|p| p.version)
    }

    /// Properties compared on update when no version property exists.
    pub fn concurrency_properties(&self) -> Vec<&PropertyMeta> {
        self.properties
            .iter()
            .filter(|p| p.concurrency_check)
            .collect()
    }

    /// Does this entity use optimistic locking at all?
    pub fn has_optimistic_locking(&self) -> bool {
        self.version_property().is_some() || self.properties.iter().any(|p| p.concurrency_check)
    }

    /// Relation properties (everything but scalars).
    pub fn relations(&self) -> impl Iterator<Item = &PropertyMeta> {
        self.properties
            .iter()
            .filter(|p| p.kind != ReferenceKind::Scalar)
    }

    /// Owning to-one relations (foreign keys).
    pub fn owning_to_one(&self) -> impl Iterator<Item = &PropertyMeta> {
        self.properties.iter().filter(|p| p.is_owning_to_one())
    }

    /// Is the primary key generated by the store?
    pub fn has_generated_primary_key(&self) -> bool {
        self.primary_keys().iter().any(|p| p.auto_increment)
    }
}

/// Registry of entity metadata.
#[derive(Debug, Default)]
pub struct MetadataStorage {
    entities: HashMap<String, Arc<EntityMetadata>>,
    order: Vec<String>,
}

impl MetadataStorage {
    /// Register, complete and validate a set of entity types.
    ///
    /// Owning many-to-many relations without an inline mapping receive a
    /// synthesised pivot entity (two foreign keys forming a composite primary
    /// key, plus a `position` column for fixed-order relations).
    pub fn new(entities: impl IntoIterator<Item = EntityMetadata>) -> Result<Self> {
        let mut storage = Self::default();
        let mut metas: Vec<EntityMetadata> = entities.into_iter().collect();

        let mut pivots = Vec::new();
        for meta in &mut metas {
            for prop in &mut meta.properties {
                if prop.kind == ReferenceKind::ManyToMany && prop.owner && !prop.inline {
                    let pivot_name = prop
                        .pivot_table
                        .get_or_insert_with(|| format!("{}_{}", meta.table, prop.name))
                        .clone();
                    let target = prop.target.clone().unwrap_or_default();
                    pivots.push((meta.name.clone(), target, pivot_name, prop.fixed_order));
                }
            }
        }

        for meta in metas {
            if storage.entities.contains_key(&meta.name) {
                return Err(Error::metadata(&meta.name, "entity registered twice"));
            }
            storage.order.push(meta.name.clone());
            storage.entities.insert(meta.name.clone(), Arc::new(meta));
        }

        for (owner, target, pivot_name, fixed_order) in pivots {
            if storage.entities.contains_key(&pivot_name) {
                continue;
            }
            let (owner_col, target_col) = pivot_columns(&owner, &target);
            let mut pivot = EntityMetadata::new(&pivot_name).table(&pivot_name);
            pivot.pivot = true;
            pivot.schema = storage.entities.get(&owner).and_then(|m| m.schema.clone());
            pivot = pivot
                .property(
                    PropertyMeta::many_to_one(owner_col, &owner)
                        .primary()
                        .delete_cascade(),
                )
                .property(
                    PropertyMeta::many_to_one(target_col, &target)
                        .primary()
                        .delete_cascade(),
                );
            if fixed_order {
                pivot = pivot.property(PropertyMeta::scalar("position"));
            }
            storage.order.push(pivot_name.clone());
            storage.entities.insert(pivot_name, Arc::new(pivot));
        }

        storage.validate()?;
        tracing::debug!(entities = storage.order.len(), "Metadata registered");
        Ok(storage)
    }

    /// Look up metadata by entity name.
    pub fn get(&self, name: &str) -> Result<Arc<EntityMetadata>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| Error::metadata(name, "unknown entity"))
    }

    /// Look up metadata without failing.
    pub fn find(&self, name: &str) -> Option<Arc<EntityMetadata>> {
        self.entities.get(name).cloned()
    }

    /// All registered entities in registration order.
    pub fn all(&self) -> Vec<Arc<EntityMetadata>> {
        self.order
            .iter()
            .filter_map(|name| self.entities.get(name).cloned())
            .collect()
    }

    /// Create a new, unmanaged entity of the given type.
    pub fn instantiate(&self, name: &str) -> Result<EntityRef> {
        Ok(EntityRef::new(self.get(name)?))
    }

    /// Metadata of the pivot entity backing an owning many-to-many property.
    pub fn pivot_for(&self, prop: &PropertyMeta) -> Result<Arc<EntityMetadata>> {
        let name = prop.pivot_table.as_deref().ok_or_else(|| {
            Error::metadata(&prop.name, "many-to-many property has no pivot table")
        })?;
        self.get(name)
    }

    fn validate(&self) -> Result<()> {
        for meta in self.entities.values() {
            if meta.primary_keys().is_empty() {
                return Err(Error::metadata(&meta.name, "entity has no primary key"));
            }
            if !meta.pivot
                && meta
                    .primary_keys()
                    .iter()
                    .any(|p| p.kind != ReferenceKind::Scalar)
            {
                return Err(Error::metadata(
                    &meta.name,
                    "primary key properties must be scalar",
                ));
            }
            if meta.properties.iter().filter(|p| p.version).count() > 1 {
                return Err(Error::metadata(&meta.name, "more than one version property"));
            }
            if let Some(root) = &meta.root {
                if !self.entities.contains_key(root) {
                    return Err(Error::metadata(
                        &meta.name,
                        format!("unknown root entity '{}'", root),
                    ));
                }
            }
            for prop in meta.relations() {
                self.validate_relation(meta, prop)?;
            }
        }
        Ok(())
    }

    fn validate_relation(&self, meta: &EntityMetadata, prop: &PropertyMeta) -> Result<()> {
        let target_name = prop.target.as_deref().ok_or_else(|| {
            Error::metadata(&meta.name, format!("relation '{}' has no target", prop.name))
        })?;
        let target = self.entities.get(target_name).ok_or_else(|| {
            Error::metadata(
                &meta.name,
                format!("relation '{}' targets unknown entity '{}'", prop.name, target_name),
            )
        })?;

        if prop.kind == ReferenceKind::OneToMany && prop.mapped_by.is_none() {
            return Err(Error::metadata(
                &meta.name,
                format!("one-to-many '{}' requires mapped_by", prop.name),
            ));
        }
        if prop.version || (prop.primary && !meta.pivot) {
            return Err(Error::metadata(
                &meta.name,
                format!("relation '{}' cannot be a key or version", prop.name),
            ));
        }

        let Some(inverse_name) = prop.inverse_name() else {
            return Ok(());
        };
        let inverse = target.prop(inverse_name).ok_or_else(|| {
            Error::metadata(
                &meta.name,
                format!(
                    "relation '{}' references missing property '{}.{}'",
                    prop.name, target.name, inverse_name
                ),
            )
        })?;

        if inverse.target.as_deref() != Some(meta.name.as_str())
            && inverse.target.as_deref() != Some(meta.root_name())
        {
            return Err(Error::metadata(
                &meta.name,
                format!(
                    "relation '{}' and '{}.{}' target mismatched entities",
                    prop.name, target.name, inverse.name
                ),
            ));
        }

        let compatible = matches!(
            (prop.kind, inverse.kind),
            (ReferenceKind::OneToMany, ReferenceKind::ManyToOne)
                | (ReferenceKind::ManyToOne, ReferenceKind::OneToMany)
                | (ReferenceKind::OneToOne, ReferenceKind::OneToOne)
                | (ReferenceKind::ManyToMany, ReferenceKind::ManyToMany)
        );
        if !compatible || (!prop.owner && !inverse.owner) {
            return Err(Error::metadata(
                &meta.name,
                format!(
                    "relation '{}' is inconsistent with '{}.{}'",
                    prop.name, target.name, inverse.name
                ),
            ));
        }
        Ok(())
    }
}

/// Column names of a pivot table joining `owner` to `target`.
pub fn pivot_columns(owner: &str, target: &str) -> (String, String) {
    let owner_col = to_snake_case(owner);
    let target_col = to_snake_case(target);
    if owner_col == target_col {
        (format!("{}_1", owner_col), format!("{}_2", target_col))
    } else {
        (owner_col, target_col)
    }
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> EntityMetadata {
        EntityMetadata::new("Author")
            .property(PropertyMeta::id("id"))
            .property(PropertyMeta::scalar("name"))
            .property(
                PropertyMeta::one_to_many("books", "Book", "author").cascade(&[Cascade::Persist]),
            )
    }

    fn book() -> EntityMetadata {
        EntityMetadata::new("Book")
            .property(PropertyMeta::id("id"))
            .property(PropertyMeta::scalar("title"))
            .property(PropertyMeta::many_to_one("author", "Author").inversed_by("books"))
            .property(PropertyMeta::many_to_many("tags", "BookTag"))
    }

    fn tag() -> EntityMetadata {
        EntityMetadata::new("BookTag")
            .property(PropertyMeta::id("id"))
            .property(PropertyMeta::scalar("name").unique())
    }

    #[test]
    fn test_storage_synthesises_pivot() {
        let storage = MetadataStorage::new([author(), book(), tag()]).unwrap();
        let book = storage.get("Book").unwrap();
        let tags = book.prop("tags").unwrap();
        assert_eq!(tags.pivot_table.as_deref(), Some("book_tags"));

        let pivot = storage.pivot_for(tags).unwrap();
        assert!(pivot.pivot);
        assert_eq!(pivot.primary_key_names(), vec!["book", "book_tag"]);
        assert!(pivot.prop("position").is_none());
    }

    #[test]
    fn test_self_referencing_pivot_columns_are_distinct() {
        assert_eq!(
            pivot_columns("Tag", "Tag"),
            ("tag_1".to_string(), "tag_2".to_string())
        );
    }

    #[test]
    fn test_unknown_target_is_metadata_error() {
        let broken = EntityMetadata::new("Book")
            .property(PropertyMeta::id("id"))
            .property(PropertyMeta::many_to_one("author", "Writer"));
        let err = MetadataStorage::new([broken]).unwrap_err();
        assert!(err.is_metadata());
        assert!(err.to_string().contains("Writer"));
    }

    #[test]
    fn test_missing_inverse_is_metadata_error() {
        let broken_author = EntityMetadata::new("Author")
            .property(PropertyMeta::id("id"))
            .property(PropertyMeta::one_to_many("books", "Book", "writer"));
        let err = MetadataStorage::new([broken_author, book(), tag()]).unwrap_err();
        assert!(err.is_metadata());
    }

    #[test]
    fn test_entity_without_primary_key_rejected() {
        let keyless = EntityMetadata::new("Log").property(PropertyMeta::scalar("line"));
        assert!(MetadataStorage::new([keyless]).is_err());
    }

    #[test]
    fn test_orphan_removal_implies_cascade_remove() {
        let prop = PropertyMeta::one_to_many("books", "Book", "author").orphan_removal();
        assert!(prop.cascades(Cascade::Remove));
        assert!(!prop.cascades(Cascade::Persist));
    }

    #[test]
    fn test_table_defaults_to_snake_case() {
        assert_eq!(EntityMetadata::new("BookTag").table, "book_tag");
    }
}
