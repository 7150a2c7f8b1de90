//! Unit of Work: change tracking and ordered, atomic flushes.
//!
//! The unit of work owns the identity map and the persist/remove/orphan
//! stacks of one session. `commit` closes the stacks over the entity graph,
//! computes one change set per affected entity and writes them in a single
//! transaction:
//!
//! 1. DELETE_EARLY (reverse commit order)
//! 2. UPDATE_EARLY (commit order)
//! 3. unique-conflict extra updates
//! 4. CREATE (commit order)
//! 5. UPDATE (commit order)
//! 6. circular-reference extra updates
//! 7. pivot collection synchronisation
//! 8. DELETE (reverse commit order)
//!
//! Concurrent commits on one instance run one after another in call order.
//! Calling `commit` from a flush callback or a value initializer fails with
//! [`ValidationErrorKind::ReentrantCommit`].

use crate::change_set::{
    ChangeSet, ChangeSetSummary, ChangeSetType, EntitySet, ExtraUpdate, ExtraUpdatePhase,
};
use crate::change_set_computer::ChangeSetComputer;
use crate::commit_order::CommitOrderCalculator;
use crate::commit_queue::CommitQueue;
use crate::config::UnitOfWorkConfig;
use crate::events::{FlushEvent, FlushEventCallbacks};
use crate::identity_map::{IdentityKey, IdentityMap};
use crate::persister::{ChangeSetPersister, RestoreLog};
use keel_core::snapshot::{self, Payload, PayloadValue, values_equal};
use keel_core::{
    Cascade, Condition, Cx, Driver, EntityRef, Error, LockMode, MetadataStorage,
    OptimisticLockError, Outcome, PrimaryKey, ReferenceKind, Result, Row, SessionLink, Table,
    ValidationError, ValidationErrorKind, Value, try_outcome, try_result,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Instant;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// What a commit wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub extra_updates: usize,
    /// Pivot rows inserted or deleted.
    pub collection_rows: usize,
}

impl CommitStats {
    /// Nothing was written.
    pub fn is_empty(&self) -> bool {
        self.inserted + self.updated + self.deleted + self.extra_updates + self.collection_rows == 0
    }
}

/// Sizes of the session stacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub persist: usize,
    pub remove: usize,
    pub orphans: usize,
    /// Entities registered in the identity map.
    pub managed: usize,
}

#[derive(Debug, Default)]
struct State {
    identity_map: IdentityMap,
    persist_stack: EntitySet,
    remove_stack: EntitySet,
    orphan_stack: EntitySet,
    last_change_sets: Vec<ChangeSetSummary>,
}

struct Shared<D> {
    id: u64,
    driver: D,
    metadata: Arc<MetadataStorage>,
    config: UnitOfWorkConfig,
    state: Mutex<State>,
    queue: CommitQueue,
    events: Mutex<FlushEventCallbacks>,
    /// Thread currently running user code on behalf of a flush.
    hook_thread: Mutex<Option<ThreadId>>,
    committing: AtomicBool,
}

impl<D> Shared<D> {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D: Driver> SessionLink for Shared<D> {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn schedule_orphan_removal(&self, entity: &EntityRef) {
        tracing::trace!(entity = %entity.entity_name(), "Orphan removal scheduled");
        self.state().orphan_stack.insert(entity);
    }

    fn cancel_orphan_removal(&self, entity: &EntityRef) {
        self.state().orphan_stack.remove(entity);
    }

    fn unregister(&self, entity: &EntityRef) {
        self.state().identity_map.delete(entity);
    }
}

/// Clears the hook marker when user code returns.
struct HookGuard<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
    previous: Option<ThreadId>,
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = self.previous;
    }
}

/// Clears the committing flag even if the commit future is dropped.
struct CommittingGuard<'a>(&'a AtomicBool);

impl Drop for CommittingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Everything one commit will write.
#[derive(Debug, Default)]
struct Plan {
    change_sets: Vec<ChangeSet>,
    /// Execution order of `change_sets` within each (type, kind) group.
    sequence: Vec<usize>,
    extra: Vec<ExtraUpdate>,
    collection_updates: Vec<(EntityRef, String)>,
    /// Entity types in commit order.
    order: Vec<String>,
    persisted: Vec<EntityRef>,
    removed: Vec<EntityRef>,
    removed_set: HashSet<EntityRef>,
    remove_roots: Vec<EntityRef>,
    orphan_roots: Vec<EntityRef>,
}

impl Plan {
    fn is_empty(&self) -> bool {
        self.change_sets.is_empty() && self.collection_updates.is_empty() && self.extra.is_empty()
    }

    /// Index groups of one kind, one per (type, schema), in commit order.
    fn groups(&self, kind: ChangeSetType, reverse: bool) -> Vec<Vec<usize>> {
        let mut names: Vec<&String> = self.order.iter().collect();
        if reverse {
            names.reverse();
        }
        let mut groups = Vec::new();
        for name in names {
            let mut partitions: Vec<(Option<String>, Vec<usize>)> = Vec::new();
            for &idx in &self.sequence {
                let cs = &self.change_sets[idx];
                if cs.kind != kind || cs.meta.name != *name {
                    continue;
                }
                match partitions.iter_mut().find(|(schema, _)| *schema == cs.schema) {
                    Some((_, members)) => members.push(idx),
                    None => partitions.push((cs.schema.clone(), vec![idx])),
                }
            }
            groups.extend(partitions.into_iter().map(|(_, members)| members));
        }
        groups
    }
}

/// Tracks entity changes for one session and writes them atomically.
///
/// Cloning yields another handle to the same session.
pub struct UnitOfWork<D: Driver + 'static> {
    inner: Arc<Shared<D>>,
}

impl<D: Driver + 'static> Clone for UnitOfWork<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver + 'static> fmt::Debug for UnitOfWork<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = self.pending_counts();
        f.debug_struct("UnitOfWork")
            .field("id", &self.inner.id)
            .field("pending", &counts)
            .field("committing", &self.is_committing())
            .finish_non_exhaustive()
    }
}

impl<D: Driver + 'static> UnitOfWork<D> {
    /// Create a unit of work with the default configuration.
    pub fn new(driver: D, metadata: Arc<MetadataStorage>) -> Self {
        Self::with_config(driver, metadata, UnitOfWorkConfig::default())
    }

    pub fn with_config(
        driver: D,
        metadata: Arc<MetadataStorage>,
        config: UnitOfWorkConfig,
    ) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, ?config, "Unit of work created");
        Self {
            inner: Arc::new(Shared {
                id,
                driver,
                metadata,
                config,
                state: Mutex::new(State::default()),
                queue: CommitQueue::new(),
                events: Mutex::new(FlushEventCallbacks::default()),
                hook_thread: Mutex::new(None),
                committing: AtomicBool::new(false),
            }),
        }
    }

    /// Session id entities are tagged with.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    pub fn metadata(&self) -> &Arc<MetadataStorage> {
        &self.inner.metadata
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.inner.config
    }

    fn link(&self) -> Weak<dyn SessionLink> {
        let weak: Weak<Shared<D>> = Arc::downgrade(&self.inner);
        weak
    }

    fn ensure_own(&self, entity: &EntityRef) -> Result<()> {
        match entity.session_id() {
            Some(id) if id != self.inner.id => Err(ValidationError::new(
                ValidationErrorKind::ForeignSession,
                "entity is managed by a different unit of work",
            )
            .entity(entity.entity_name())
            .into()),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// Schedule an entity (and everything it cascades persist to) for writing.
    #[tracing::instrument(
        level = "debug",
        skip(self, entity),
        fields(entity = %entity.entity_name())
    )]
    pub fn persist(&self, entity: &EntityRef) -> Result<()> {
        let reached = persist_closure([entity.clone()], &HashSet::new());
        for e in &reached {
            self.ensure_own(e)?;
        }
        let link = self.link();
        for e in reached.iter().filter(|e| e.session().is_none()) {
            e.set_session(Some(link.clone()));
        }
        let mut state = self.inner.state();
        for e in &reached {
            state.persist_stack.insert(e);
            state.remove_stack.remove(e);
            state.orphan_stack.remove(e);
        }
        tracing::debug!(count = reached.len(), "Entities scheduled for persist");
        Ok(())
    }

    /// Schedule an entity (and everything it cascades remove to) for deletion.
    ///
    /// Entities never written are simply forgotten. Nullable references and
    /// collection memberships pointing at removed entities are cleared.
    #[tracing::instrument(
        level = "debug",
        skip(self, entity),
        fields(entity = %entity.entity_name())
    )]
    pub fn remove(&self, entity: &EntityRef) -> Result<()> {
        self.ensure_own(entity)?;
        let reached = cascade_closure([entity.clone()], Cascade::Remove, &HashSet::new());
        let mut managed = Vec::new();
        {
            let mut state = self.inner.state();
            for e in &reached {
                state.persist_stack.remove(e);
                state.orphan_stack.remove(e);
                if e.is_managed() {
                    state.remove_stack.insert(e);
                    managed.push(e.clone());
                }
            }
        }
        for e in &managed {
            detach_inverse_references(e);
        }
        tracing::debug!(count = managed.len(), "Entities scheduled for removal");
        Ok(())
    }

    /// Merge a detached entity into this session.
    ///
    /// When an instance with the same identity is already managed its fields
    /// are overwritten with the detached values and it is returned; otherwise
    /// the entity itself becomes managed with its current state as the
    /// persisted snapshot. Cascades along merge relations.
    #[tracing::instrument(
        level = "debug",
        skip(self, entity),
        fields(entity = %entity.entity_name())
    )]
    pub fn merge(&self, entity: &EntityRef) -> Result<EntityRef> {
        if entity.primary_key().is_none() {
            return Err(ValidationError::new(
                ValidationErrorKind::Invalid,
                "merge requires a primary key",
            )
            .entity(entity.entity_name())
            .into());
        }
        let reached = cascade_closure([entity.clone()], Cascade::Merge, &HashSet::new());
        let mut merged: HashMap<EntityRef, EntityRef> = HashMap::new();
        for e in &reached {
            self.ensure_own(e)?;
            if let Some(target) = self.merge_one(e)? {
                merged.insert(e.clone(), target);
            }
        }

        // point merged references at the managed instances
        for (source, target) in &merged {
            if source == target {
                continue;
            }
            for (name, reference) in source.references() {
                let resolved = reference.map(|r| merged.get(&r).cloned().unwrap_or(r));
                if target.reference(&name) != resolved {
                    target.set_reference_raw(&name, resolved.as_ref());
                }
            }
        }
        Ok(merged.get(entity).cloned().unwrap_or_else(|| entity.clone()))
    }

    fn merge_one(&self, entity: &EntityRef) -> Result<Option<EntityRef>> {
        let Some(key) = IdentityKey::of(entity) else {
            return Ok(None);
        };
        let existing = self.inner.state().identity_map.get(&key);
        match existing {
            Some(existing) if existing == *entity => Ok(Some(existing)),
            Some(existing) => {
                for (name, value) in entity.values() {
                    if existing.get(&name).as_ref() != Some(&value) {
                        existing.set(&name, value)?;
                    }
                }
                Ok(Some(existing))
            }
            None => {
                entity.set_session(Some(self.link()));
                entity.set_managed(true);
                entity.set_original(Some(snapshot::take(entity)));
                entity.clear_tracking();
                entity.take_all_collection_snapshots();
                self.inner.state().identity_map.store(entity)?;
                Ok(Some(entity.clone()))
            }
        }
    }

    /// Queue an entity for deletion unless it is referenced again before commit.
    pub fn schedule_orphan_removal(&self, entity: &EntityRef) {
        self.inner.schedule_orphan_removal(entity);
    }

    pub fn cancel_orphan_removal(&self, entity: &EntityRef) {
        self.inner.cancel_orphan_removal(entity);
    }

    /// Stop tracking an entity.
    pub fn detach(&self, entity: &EntityRef) {
        {
            let mut state = self.inner.state();
            state.identity_map.delete(entity);
            state.persist_stack.remove(entity);
            state.remove_stack.remove(entity);
            state.orphan_stack.remove(entity);
        }
        entity.set_managed(false);
        entity.set_session(None);
    }

    /// Forget every managed entity and every pending operation.
    pub fn clear(&self) {
        let entities = {
            let mut state = self.inner.state();
            let mut all = state.identity_map.clear();
            all.extend(state.persist_stack.to_vec());
            state.persist_stack.clear();
            state.remove_stack.clear();
            state.orphan_stack.clear();
            all
        };
        for entity in &entities {
            entity.set_managed(false);
            entity.set_session(None);
        }
        tracing::debug!(count = entities.len(), "Unit of work cleared");
    }

    // ========================================================================
    // Lookup and loading
    // ========================================================================

    /// Managed instance of `entity` with the given serialized primary key.
    pub fn get_by_hash(&self, entity: &str, hash: &str, schema: Option<&str>) -> Option<EntityRef> {
        let meta = self.inner.metadata.find(entity)?;
        let schema = schema.or(meta.schema.as_deref());
        self.inner
            .state()
            .identity_map
            .get_by_hash(meta.root_name(), hash, schema)
    }

    /// Managed instance of `entity` with primary key `pk`.
    pub fn get_by_id(
        &self,
        entity: &str,
        pk: impl Into<PrimaryKey>,
        schema: Option<&str>,
    ) -> Result<Option<EntityRef>> {
        self.inner.metadata.get(entity)?;
        Ok(self.get_by_hash(entity, &pk.into().serialize(), schema))
    }

    /// Registered, uninitialized placeholder for a row known by key only.
    pub fn reference(&self, entity: &str, pk: impl Into<PrimaryKey>) -> Result<EntityRef> {
        self.reference_in(entity, pk.into(), None)
    }

    fn reference_in(
        &self,
        entity: &str,
        pk: PrimaryKey,
        schema: Option<String>,
    ) -> Result<EntityRef> {
        let meta = self.inner.metadata.get(entity)?;
        let names = meta.primary_key_names();
        if names.len() != pk.0.len() || pk.0.iter().any(Value::is_null) {
            return Err(ValidationError::new(
                ValidationErrorKind::Invalid,
                format!("primary key [{}] does not match the key fields", pk),
            )
            .entity(&meta.name)
            .into());
        }
        let effective = schema.clone().or_else(|| meta.schema.clone());
        let key = IdentityKey::new(meta.root_name(), pk.serialize(), effective);
        if let Some(existing) = self.inner.state().identity_map.get(&key) {
            return Ok(existing);
        }

        let placeholder = EntityRef::new(Arc::clone(&meta));
        if schema.is_some() && schema != meta.schema {
            placeholder.set_schema(schema);
        }
        for (name, value) in names.iter().zip(pk.0) {
            placeholder.set_raw(name, value);
        }
        placeholder.set_initialized(false);
        placeholder.set_original(Some(snapshot::take(&placeholder)));
        placeholder.mark_collections_uninitialized();
        placeholder.set_managed(true);
        placeholder.set_session(Some(self.link()));

        let mut state = self.inner.state();
        if let Some(existing) = state.identity_map.get(&key) {
            return Ok(existing);
        }
        state.identity_map.store(&placeholder)?;
        tracing::trace!(entity = %meta.name, pk = %key.hash, "Placeholder reference registered");
        Ok(placeholder)
    }

    /// Materialise a row into a managed entity.
    ///
    /// A registered instance with the same identity receives the row's values
    /// (fields changed locally since loading win) and is returned; otherwise
    /// a new managed, initialized entity is created. Owning to-one columns
    /// become placeholder references.
    #[tracing::instrument(level = "trace", skip(self, row))]
    pub fn hydrate(&self, entity: &str, row: &Row, schema: Option<&str>) -> Result<EntityRef> {
        let meta = self.inner.metadata.get(entity)?;
        let mut key_values = Vec::new();
        for name in meta.primary_key_names() {
            match row.get(&name) {
                Some(value) if !value.is_null() => key_values.push(value.clone()),
                _ => {
                    return Err(ValidationError::new(
                        ValidationErrorKind::Invalid,
                        "row is missing a primary key field",
                    )
                    .entity(&meta.name)
                    .property(name)
                    .into());
                }
            }
        }
        let pk = PrimaryKey(key_values);
        let schema = schema.map(str::to_string);
        let effective = schema.clone().or_else(|| meta.schema.clone());
        let key = IdentityKey::new(meta.root_name(), pk.serialize(), effective);

        let existing = self.inner.state().identity_map.get(&key);
        let target = match existing {
            Some(existing) => existing,
            None => {
                let created = EntityRef::new(Arc::clone(&meta));
                if schema.is_some() && schema != meta.schema {
                    created.set_schema(schema.clone());
                }
                for (name, value) in meta.primary_key_names().iter().zip(&pk.0) {
                    created.set_raw(name, value.clone());
                }
                created.mark_collections_uninitialized();
                created.set_managed(true);
                created.set_session(Some(self.link()));
                self.inner.state().identity_map.store(&created)?;
                created
            }
        };

        let dirty = target.dirty_fields();
        let mut merged = BTreeMap::new();
        for prop in meta.properties.iter().filter(|p| p.is_persisted()) {
            let Some(value) = row.get(&prop.name) else {
                continue;
            };
            if dirty.contains(&prop.name) {
                continue;
            }
            match prop.kind {
                ReferenceKind::Scalar => target.set_raw(&prop.name, value.clone()),
                ReferenceKind::ManyToOne | ReferenceKind::OneToOne => {
                    let reference = match prop.target.as_deref() {
                        Some(target_name) if !value.is_null() => Some(self.reference_in(
                            target_name,
                            PrimaryKey::from(value.clone()),
                            schema.clone(),
                        )?),
                        _ => None,
                    };
                    target.hydrate_reference(&prop.name, reference.as_ref());
                }
                ReferenceKind::ManyToMany => {
                    let Some(target_name) = prop.target.as_deref() else {
                        continue;
                    };
                    let keys = match value {
                        Value::Array(keys) => keys.clone(),
                        Value::Null => Vec::new(),
                        other => vec![other.clone()],
                    };
                    let items = keys
                        .into_iter()
                        .map(|k| {
                            self.reference_in(target_name, PrimaryKey::from(k), schema.clone())
                        })
                        .collect::<Result<Vec<_>>>()?;
                    target.collection(&prop.name)?.hydrate(items);
                }
                ReferenceKind::OneToMany => {}
            }
            merged.insert(prop.name.clone(), value.clone());
        }
        target.merge_original(&merged);
        target.set_initialized(true);
        Ok(target)
    }

    /// Load one entity by primary key (the identity map is consulted first).
    #[tracing::instrument(level = "debug", skip(self, cx, pk))]
    pub async fn find_one(
        &self,
        cx: &Cx,
        entity: &str,
        pk: impl Into<PrimaryKey>,
    ) -> Outcome<Option<EntityRef>, Error> {
        let pk = pk.into();
        let meta = try_result!(self.inner.metadata.get(entity));
        if let Some(existing) = self.get_by_hash(entity, &pk.serialize(), None) {
            if existing.is_initialized() {
                return Outcome::Ok(Some(existing));
            }
        }
        let table = Table::new(&meta, meta.schema.as_deref());
        let rows = try_outcome!(
            self.inner
                .driver
                .find(cx, table, Condition::PrimaryKeyIn(vec![pk.0.clone()]), None)
                .await
        );
        match rows.first() {
            Some(row) => Outcome::Ok(Some(try_result!(self.hydrate(entity, row, None)))),
            None => Outcome::Ok(None),
        }
    }

    /// Lock a managed entity.
    ///
    /// Optimistic mode checks the loaded version against `expected_version`
    /// on the client. Pessimistic modes require an open transaction and lock
    /// the row through the driver.
    #[tracing::instrument(
        level = "debug",
        skip(self, cx, entity, expected_version),
        fields(entity = %entity.entity_name())
    )]
    pub async fn lock(
        &self,
        cx: &Cx,
        entity: &EntityRef,
        mode: LockMode,
        expected_version: Option<Value>,
    ) -> Outcome<(), Error> {
        let meta = entity.meta();
        if !entity.is_managed() {
            return Outcome::Err(
                ValidationError::new(ValidationErrorKind::NotManaged, "entity is not managed")
                    .entity(&meta.name)
                    .into(),
            );
        }

        if mode == LockMode::Optimistic || expected_version.is_some() {
            let Some(version) = meta.version_property() else {
                return Outcome::Err(
                    ValidationError::new(
                        ValidationErrorKind::NotVersioned,
                        "optimistic locking needs a version property",
                    )
                    .entity(&meta.name)
                    .into(),
                );
            };
            if let Some(expected) = expected_version {
                let actual = entity.get(&version.name).unwrap_or(Value::Null);
                if !values_equal(&actual, &expected) {
                    return Outcome::Err(Error::OptimisticLock(OptimisticLockError {
                        entity: meta.name.clone(),
                        primary_key: entity.serialized_primary_key(),
                        expected: Some(expected),
                        actual: Some(actual),
                        message: "version mismatch".to_string(),
                    }));
                }
            }
        }

        if mode.is_pessimistic() {
            if !self.inner.driver.in_transaction() {
                return Outcome::Err(
                    ValidationError::new(
                        ValidationErrorKind::TransactionRequired,
                        "pessimistic locking requires an active transaction",
                    )
                    .entity(&meta.name)
                    .into(),
                );
            }
            let Some(pk) = entity.primary_key() else {
                return Outcome::Err(
                    ValidationError::new(ValidationErrorKind::Invalid, "entity has no primary key")
                        .entity(&meta.name)
                        .into(),
                );
            };
            let schema = entity.effective_schema();
            let table = Table::new(&meta, schema.as_deref());
            try_outcome!(
                self.inner
                    .driver
                    .lock_rows(cx, table, Condition::PrimaryKeyIn(vec![pk.0]), mode)
                    .await
            );
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn pending_counts(&self) -> PendingCounts {
        let state = self.inner.state();
        PendingCounts {
            persist: state.persist_stack.len(),
            remove: state.remove_stack.len(),
            orphans: state.orphan_stack.len(),
            managed: state.identity_map.len(),
        }
    }

    pub fn is_committing(&self) -> bool {
        self.inner.committing.load(Ordering::SeqCst)
    }

    /// Commits waiting behind the running one.
    pub fn queued_commits(&self) -> usize {
        self.inner.queue.waiting()
    }

    /// Is this exact instance registered in the identity map?
    pub fn is_registered(&self, entity: &EntityRef) -> bool {
        self.inner.state().identity_map.contains(entity)
    }

    /// Change sets written by the last successful commit, with payloads as planned.
    pub fn change_sets_of_last_commit(&self) -> Vec<ChangeSetSummary> {
        self.inner.state().last_change_sets.clone()
    }

    /// Compute the change set `commit` would write for one entity.
    pub fn compute_change_set(&self, entity: &EntityRef) -> Result<Option<ChangeSet>> {
        let _hooks = self.enter_hooks();
        ChangeSetComputer::new().compute(entity)
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn on_before_flush(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.register(FlushEvent::BeforeFlush, f);
    }

    pub fn on_after_flush(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.register(FlushEvent::AfterFlush, f);
    }

    pub fn on_after_commit(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.register(FlushEvent::AfterCommit, f);
    }

    pub fn on_after_rollback(&self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.register(FlushEvent::AfterRollback, f);
    }

    fn register(&self, event: FlushEvent, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(event, f);
    }

    /// Fire callbacks outside the lock so they may register more or touch the session.
    fn fire(&self, event: FlushEvent) -> Result<()> {
        let mut callbacks = std::mem::take(
            &mut *self.inner.events.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let result = if callbacks.is_empty() {
            Ok(())
        } else {
            let _hooks = self.enter_hooks();
            callbacks.fire(event)
        };
        let mut slot = self.inner.events.lock().unwrap_or_else(PoisonError::into_inner);
        callbacks.absorb(std::mem::take(&mut *slot));
        *slot = callbacks;
        result
    }

    fn enter_hooks(&self) -> HookGuard<'_> {
        let previous = self
            .inner
            .hook_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(thread::current().id());
        HookGuard {
            slot: &self.inner.hook_thread,
            previous,
        }
    }

    fn in_hooks(&self) -> bool {
        *self
            .inner
            .hook_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(thread::current().id())
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Write every pending change in one transaction.
    ///
    /// A commit requested while another runs waits for it, preserving call
    /// order. On failure the transaction is rolled back, store-assigned values
    /// are taken back out of the entities and the pending stacks are kept so
    /// the commit can be retried.
    #[tracing::instrument(level = "info", skip(self, cx), fields(session = self.inner.id))]
    pub async fn commit(&self, cx: &Cx) -> Outcome<CommitStats, Error> {
        if self.in_hooks() {
            return Outcome::Err(
                ValidationError::new(
                    ValidationErrorKind::ReentrantCommit,
                    "commit called from inside a running flush",
                )
                .into(),
            );
        }

        let _turn = self.inner.queue.acquire().await;
        self.inner.committing.store(true, Ordering::SeqCst);
        let _committing = CommittingGuard(&self.inner.committing);
        let started = Instant::now();

        let outcome = self.run_commit(cx).await;
        if let Outcome::Ok(stats) = &outcome {
            tracing::info!(
                inserted = stats.inserted,
                updated = stats.updated,
                deleted = stats.deleted,
                extra_updates = stats.extra_updates,
                collection_rows = stats.collection_rows,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Commit completed"
            );
        }
        outcome
    }

    async fn run_commit(&self, cx: &Cx) -> Outcome<CommitStats, Error> {
        try_result!(self.fire(FlushEvent::BeforeFlush));
        let mut plan = try_result!(self.compute_plan());

        if plan.is_empty() {
            tracing::debug!("Nothing to flush");
            self.finish_commit(&plan, Vec::new());
            return Outcome::Ok(CommitStats::default());
        }

        let planned: Vec<ChangeSetSummary> =
            plan.change_sets.iter().map(ChangeSetSummary::from).collect();

        let driver = &self.inner.driver;
        let began = self.inner.config.implicit_transactions && !driver.in_transaction();
        if began {
            try_outcome!(driver.begin(cx).await);
        }

        let mut restore = RestoreLog::new();
        let mut outcome = self.execute(cx, &mut plan, &mut restore).await;
        if matches!(outcome, Outcome::Ok(_)) {
            if let Err(err) = self.fire(FlushEvent::AfterFlush) {
                outcome = Outcome::Err(err);
            }
        }
        if began && matches!(outcome, Outcome::Ok(_)) {
            if let Some(failed) = failure(driver.commit(cx).await) {
                outcome = failed;
            }
        }

        match outcome {
            Outcome::Ok(stats) => {
                self.finish_commit(&plan, planned);
                if let Err(err) = self.fire(FlushEvent::AfterCommit) {
                    return Outcome::Err(err);
                }
                Outcome::Ok(stats)
            }
            failed => {
                tracing::warn!(session = self.inner.id, "Commit failed, rolling back");
                if began {
                    if let Some(Outcome::Err(err)) = failure::<()>(driver.rollback(cx).await) {
                        tracing::warn!(error = %err, "Rollback failed");
                    }
                }
                restore.restore();
                if let Err(err) = self.fire(FlushEvent::AfterRollback) {
                    tracing::warn!(error = %err, "after_rollback callback failed");
                }
                failed
            }
        }
    }

    async fn execute(
        &self,
        cx: &Cx,
        plan: &mut Plan,
        restore: &mut RestoreLog,
    ) -> Outcome<CommitStats, Error> {
        let persister = ChangeSetPersister::new(
            &self.inner.driver,
            &self.inner.metadata,
            &self.inner.config,
        );
        let mut stats = CommitStats::default();

        stats.extra_updates += try_outcome!(
            persister
                .execute_extra_updates(cx, &plan.extra, ExtraUpdatePhase::Detach)
                .await
        );
        for group in plan.groups(ChangeSetType::DeleteEarly, true) {
            stats.deleted +=
                try_outcome!(persister.execute_deletes(cx, &mut plan.change_sets, &group).await);
        }
        for group in plan.groups(ChangeSetType::UpdateEarly, false) {
            stats.updated += try_outcome!(
                persister
                    .execute_updates(cx, &mut plan.change_sets, &group, &mut plan.extra, restore)
                    .await
            );
        }
        stats.extra_updates += try_outcome!(
            persister
                .execute_extra_updates(cx, &plan.extra, ExtraUpdatePhase::Unique)
                .await
        );
        for group in plan.groups(ChangeSetType::Create, false) {
            stats.inserted += try_outcome!(
                persister
                    .execute_inserts(cx, &mut plan.change_sets, &group, &mut plan.extra, restore)
                    .await
            );
        }
        for group in plan.groups(ChangeSetType::Update, false) {
            stats.updated += try_outcome!(
                persister
                    .execute_updates(cx, &mut plan.change_sets, &group, &mut plan.extra, restore)
                    .await
            );
        }
        stats.extra_updates += try_outcome!(
            persister
                .execute_extra_updates(cx, &plan.extra, ExtraUpdatePhase::Circular)
                .await
        );
        stats.collection_rows += try_outcome!(
            persister
                .execute_collection_updates(cx, &plan.collection_updates, &plan.removed_set)
                .await
        );
        for group in plan.groups(ChangeSetType::Delete, true) {
            stats.deleted +=
                try_outcome!(persister.execute_deletes(cx, &mut plan.change_sets, &group).await);
        }
        Outcome::Ok(stats)
    }

    /// Close the stacks over the entity graph and compute every change set.
    #[tracing::instrument(level = "debug", skip(self))]
    fn compute_plan(&self) -> Result<Plan> {
        let _hooks = self.enter_hooks();
        let (persist_roots, remove_roots, orphan_roots, managed) = {
            let state = self.inner.state();
            (
                state.persist_stack.to_vec(),
                state.remove_stack.to_vec(),
                state.orphan_stack.to_vec(),
                state.identity_map.entities(),
            )
        };

        // orphans still held through a removing relation survive
        let removing: HashSet<EntityRef> = remove_roots.iter().cloned().collect();
        let orphaned: HashSet<EntityRef> = orphan_roots.iter().cloned().collect();
        let mut still_referenced = HashSet::new();
        for owner in persist_roots.iter().chain(&managed) {
            if removing.contains(owner) || orphaned.contains(owner) {
                continue;
            }
            still_referenced.extend(cascade_targets(owner, Cascade::Remove));
        }
        let mut remove_seeds = remove_roots.clone();
        for orphan in &orphan_roots {
            if still_referenced.contains(orphan) {
                tracing::trace!(entity = %orphan.entity_name(), "Orphan is referenced again");
            } else {
                remove_seeds.push(orphan.clone());
            }
        }

        let removed: Vec<EntityRef> =
            cascade_closure(remove_seeds, Cascade::Remove, &HashSet::new())
                .into_iter()
                .filter(|e| e.is_managed() && e.has_original())
                .collect();
        let removed_set: HashSet<EntityRef> = removed.iter().cloned().collect();

        let seeds: Vec<EntityRef> = persist_roots
            .iter()
            .chain(&managed)
            .filter(|e| !removed_set.contains(*e))
            .cloned()
            .collect();
        let persisted = persist_closure(seeds, &removed_set);
        for e in &persisted {
            self.ensure_own(e)?;
        }

        let mut computer = ChangeSetComputer::new();
        let mut change_sets = Vec::new();
        for entity in &persisted {
            if let Some(cs) = computer.compute(entity)? {
                change_sets.push(cs);
            }
        }
        let collection_updates = computer.take_collection_updates();
        for entity in &removed {
            if entity.meta().read_only {
                tracing::warn!(
                    entity = %entity.entity_name(),
                    "Skipping removal of read-only entity"
                );
                continue;
            }
            change_sets.push(ChangeSet::new(entity, ChangeSetType::Delete, Payload::new()));
        }

        let mut extra = Vec::new();
        let sequence = resolve_unique_conflicts(&mut change_sets, &mut extra);
        let order = commit_order(&change_sets);
        detach_removed_references(&change_sets, &order, &mut extra);
        tracing::debug!(
            change_sets = change_sets.len(),
            collections = collection_updates.len(),
            order = ?order,
            "Flush planned"
        );

        Ok(Plan {
            change_sets,
            sequence,
            extra,
            collection_updates,
            order,
            persisted,
            removed,
            removed_set,
            remove_roots,
            orphan_roots,
        })
    }

    /// Refresh in-memory state after a successful commit and clear the stacks.
    fn finish_commit(&self, plan: &Plan, planned: Vec<ChangeSetSummary>) {
        let link = self.link();
        {
            let mut state = self.inner.state();
            for entity in &plan.removed {
                state.identity_map.delete(entity);
            }
        }
        for entity in &plan.removed {
            entity.set_managed(false);
            entity.set_session(None);
            entity.set_original(None);
            entity.clear_tracking();
        }

        let written: HashSet<&EntityRef> = plan.change_sets.iter().map(|cs| &cs.entity).collect();
        let mut refreshed = Vec::new();
        for entity in &plan.persisted {
            if !(written.contains(entity) || entity.is_touched() || !entity.is_managed()) {
                continue;
            }
            let snapshot = snapshot::take(entity);
            if entity.is_initialized() {
                entity.set_original(Some(snapshot));
            } else {
                entity.merge_original(&snapshot);
            }
            entity.clear_tracking();
            entity.set_managed(true);
            entity.set_session(Some(link.clone()));
            entity.take_all_collection_snapshots();
            for target in entity.references().into_values().flatten() {
                target.take_all_collection_snapshots();
            }
            refreshed.push(entity.clone());
        }

        let summaries: Vec<ChangeSetSummary> = planned
            .into_iter()
            .zip(&plan.change_sets)
            .map(|(mut summary, cs)| {
                summary.primary_key = cs.entity.serialized_primary_key();
                summary
            })
            .collect();

        let mut state = self.inner.state();
        for entity in &refreshed {
            if let Err(err) = state.identity_map.store(entity) {
                tracing::warn!(
                    entity = %entity.entity_name(),
                    error = %err,
                    "Could not register written entity"
                );
            }
        }
        for entity in plan.persisted.iter().chain(&plan.removed) {
            state.persist_stack.remove(entity);
            state.remove_stack.remove(entity);
            state.orphan_stack.remove(entity);
        }
        for entity in plan.remove_roots.iter().chain(&plan.orphan_roots) {
            state.remove_stack.remove(entity);
            state.orphan_stack.remove(entity);
        }
        state.last_change_sets = summaries;
    }
}

fn failure<T>(outcome: Outcome<(), Error>) -> Option<Outcome<T, Error>> {
    match outcome {
        Outcome::Ok(()) => None,
        Outcome::Err(err) => Some(Outcome::Err(err)),
        Outcome::Cancelled(reason) => Some(Outcome::Cancelled(reason)),
        Outcome::Panicked(payload) => Some(Outcome::Panicked(payload)),
    }
}

/// Targets of the relations of `entity` that cascade `cascade`.
fn cascade_targets(entity: &EntityRef, cascade: Cascade) -> Vec<EntityRef> {
    let meta = entity.meta();
    let mut targets = Vec::new();
    for prop in meta.relations().filter(|p| p.cascades(cascade)) {
        if prop.kind.is_to_one() {
            targets.extend(entity.reference(&prop.name));
        } else {
            targets.extend(entity.collection_items(&prop.name));
        }
    }
    targets
}

/// Breadth-first closure of `seeds` over `cascade` relations, in discovery order.
fn cascade_closure(
    seeds: impl IntoIterator<Item = EntityRef>,
    cascade: Cascade,
    skip: &HashSet<EntityRef>,
) -> Vec<EntityRef> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    for seed in seeds {
        if !skip.contains(&seed) && visited.insert(seed.clone()) {
            queue.push_back(seed);
        }
    }
    let mut order = Vec::new();
    while let Some(entity) = queue.pop_front() {
        for target in cascade_targets(&entity, cascade) {
            if !skip.contains(&target) && visited.insert(target.clone()) {
                queue.push_back(target);
            }
        }
        order.push(entity);
    }
    order
}

/// Entities to write: persist cascades plus never-written entities reachable
/// through any relation.
fn persist_closure(
    seeds: impl IntoIterator<Item = EntityRef>,
    skip: &HashSet<EntityRef>,
) -> Vec<EntityRef> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    for seed in seeds {
        if !skip.contains(&seed) && visited.insert(seed.clone()) {
            queue.push_back(seed);
        }
    }
    let mut order = Vec::new();
    while let Some(entity) = queue.pop_front() {
        let meta = entity.meta();
        for prop in meta.relations() {
            let targets = if prop.kind.is_to_one() {
                entity.reference(&prop.name).into_iter().collect()
            } else {
                entity.collection_items(&prop.name)
            };
            let cascading = prop.cascades(Cascade::Persist);
            for target in targets {
                let is_new = !target.is_managed() && !target.has_original();
                if (cascading || is_new)
                    && !skip.contains(&target)
                    && visited.insert(target.clone())
                {
                    queue.push_back(target);
                }
            }
        }
        order.push(entity);
    }
    order
}

/// Clear references and memberships that point at an entity being removed.
fn detach_inverse_references(entity: &EntityRef) {
    let meta = entity.meta();
    for prop in meta.relations() {
        let Some(inverse) = prop.inverse_name() else {
            continue;
        };
        match prop.kind {
            ReferenceKind::ManyToOne => {
                if let Some(target) = entity.reference(&prop.name) {
                    target.collection_remove_raw(inverse, entity);
                }
            }
            ReferenceKind::OneToMany | ReferenceKind::OneToOne => {
                let targets = if prop.kind == ReferenceKind::OneToMany {
                    entity.collection_items(&prop.name)
                } else {
                    entity.reference(&prop.name).into_iter().collect()
                };
                for target in targets {
                    let nullable = target.meta().prop(inverse).is_some_and(|p| p.nullable);
                    if nullable && target.reference(inverse).as_ref() == Some(entity) {
                        target.set_reference_raw(inverse, None);
                    }
                }
            }
            ReferenceKind::ManyToMany => {
                for item in entity.collection_items(&prop.name) {
                    item.collection_remove_raw(inverse, entity);
                }
            }
            ReferenceKind::Scalar => {}
        }
    }
}

/// Entity types of the flush in commit order.
fn commit_order(change_sets: &[ChangeSet]) -> Vec<String> {
    let present: HashSet<String> = change_sets.iter().map(|cs| cs.meta.name.clone()).collect();
    let mut calc = CommitOrderCalculator::new();
    let mut registered = HashSet::new();
    for cs in change_sets {
        if registered.insert(cs.meta.name.clone()) {
            calc.register(&cs.meta, &|name| present.contains(name));
        }
    }
    calc.sort()
}

fn is_delete(cs: &ChangeSet) -> bool {
    matches!(cs.kind, ChangeSetType::Delete | ChangeSetType::DeleteEarly)
}

/// Owning to-one links between removed rows as stored: (from, field, to).
fn delete_references(change_sets: &[ChangeSet]) -> Vec<(usize, String, usize)> {
    let mut deleted: HashMap<(String, String), usize> = HashMap::new();
    for (idx, cs) in change_sets.iter().enumerate().filter(|(_, cs)| is_delete(cs)) {
        let Some(pk) = &cs.primary_key else {
            continue;
        };
        let key = pk.as_value().identity_fragment();
        deleted.insert((cs.meta.name.clone(), key.clone()), idx);
        deleted.insert((cs.root_name().to_string(), key), idx);
    }

    let mut references = Vec::new();
    for (idx, cs) in change_sets.iter().enumerate().filter(|(_, cs)| is_delete(cs)) {
        for prop in cs.meta.owning_to_one() {
            let Some(target) = prop.target.as_deref() else {
                continue;
            };
            let Some(stored) = cs.original_value(&prop.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let key = (target.to_string(), stored.identity_fragment());
            if let Some(&to) = deleted.get(&key) {
                if to != idx {
                    references.push((idx, prop.name.clone(), to));
                }
            }
        }
    }
    references
}

/// Null nullable references from removed rows to removed rows deleted no later
/// than themselves.
fn detach_removed_references(
    change_sets: &[ChangeSet],
    order: &[String],
    extra: &mut Vec<ExtraUpdate>,
) {
    // deletes run early first, then by reverse commit order
    let rank = |cs: &ChangeSet| {
        let phase = usize::from(cs.kind != ChangeSetType::DeleteEarly);
        let position = order
            .iter()
            .rev()
            .position(|name| *name == cs.meta.name)
            .unwrap_or(order.len());
        (phase, position)
    };

    let mut fields: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (from, field, to) in delete_references(change_sets) {
        let source = &change_sets[from];
        let nullable = source.meta.prop(&field).is_some_and(|p| p.nullable);
        if nullable && rank(&change_sets[to]) <= rank(source) {
            fields.entry(from).or_default().push(field);
        }
    }
    for (idx, fields) in fields {
        tracing::debug!(
            entity = %change_sets[idx].meta.name,
            fields = ?fields,
            "Clearing references between removed rows"
        );
        extra.push(ExtraUpdate::detach(&change_sets[idx], &fields));
    }
}

/// A unique value in one table: (root type, schema, field, serialized value).
type Slot = (String, Option<String>, String, String);

const PRIMARY_KEY_SLOT: &str = "#pk";

fn slot(cs: &ChangeSet, field: &str, value: &Value) -> Option<Slot> {
    if value.is_null() {
        return None;
    }
    Some((
        cs.root_name().to_string(),
        cs.schema.clone(),
        field.to_string(),
        value.identity_fragment(),
    ))
}

fn unique_fields(cs: &ChangeSet) -> Vec<String> {
    cs.meta
        .properties
        .iter()
        .filter(|p| {
            (p.unique && p.kind == ReferenceKind::Scalar)
                || (p.kind == ReferenceKind::OneToOne && p.owner)
        })
        .map(|p| p.name.clone())
        .collect()
}

/// Unique values a CREATE or UPDATE writes.
fn claims(cs: &ChangeSet) -> Vec<Slot> {
    let mut slots: Vec<Slot> = unique_fields(cs)
        .iter()
        .filter_map(|f| cs.payload_value(f).and_then(|v| slot(cs, f, &v)))
        .collect();
    if cs.kind == ChangeSetType::Create {
        if let Some(pk) = cs.entity.primary_key() {
            slots.extend(slot(cs, PRIMARY_KEY_SLOT, &Value::Text(pk.serialize())));
        }
    }
    slots
}

/// Unique values an UPDATE gives up.
fn frees(cs: &ChangeSet) -> Vec<Slot> {
    unique_fields(cs)
        .iter()
        .filter(|f| cs.payload.contains_key(*f))
        .filter_map(|f| cs.original_value(f).and_then(|v| slot(cs, f, v)))
        .collect()
}

/// Updates that must run before `idx` because they free a value it writes.
fn update_dependencies(change_sets: &[ChangeSet]) -> HashMap<usize, Vec<usize>> {
    let mut freed_by: HashMap<Slot, usize> = HashMap::new();
    for (idx, cs) in change_sets.iter().enumerate() {
        if cs.kind == ChangeSetType::Update {
            for s in frees(cs) {
                freed_by.insert(s, idx);
            }
        }
    }
    let mut deps: HashMap<usize, Vec<usize>> = HashMap::new();
    for (idx, cs) in change_sets.iter().enumerate() {
        if cs.kind != ChangeSetType::Update {
            continue;
        }
        for s in claims(cs) {
            if let Some(&other) = freed_by.get(&s) {
                if other != idx {
                    deps.entry(idx).or_default().push(other);
                }
            }
        }
    }
    deps
}

fn reaches(from: usize, to: usize, deps: &HashMap<usize, Vec<usize>>) -> bool {
    let mut seen = HashSet::new();
    let mut stack: Vec<usize> = deps.get(&from).cloned().unwrap_or_default();
    while let Some(next) = stack.pop() {
        if next == to {
            return true;
        }
        if seen.insert(next) {
            stack.extend(deps.get(&next).into_iter().flatten().copied());
        }
    }
    false
}

/// Reclassify change sets whose unique values collide with other pending writes.
///
/// - A delete freeing a value (or primary key) another write claims runs early.
/// - An update freeing a value a create claims runs early, together with the
///   updates it in turn waits on.
/// - Removed rows whose stored references point at an early delete run early
///   as well.
/// - Updates swapping values in a cycle are first set to NULL early and get
///   their final value from a unique extra update.
///
/// Only nullable fields can be moved out of the way. A swap cycle on a
/// non-nullable unique field is written as is, and the store rejects it with
/// a unique violation that rolls the commit back.
///
/// Returns the execution sequence: blockers before the updates they unblock.
fn resolve_unique_conflicts(
    change_sets: &mut Vec<ChangeSet>,
    extra: &mut Vec<ExtraUpdate>,
) -> Vec<usize> {
    let claimed: HashSet<Slot> = change_sets
        .iter()
        .filter(|cs| matches!(cs.kind, ChangeSetType::Create | ChangeSetType::Update))
        .flat_map(claims)
        .collect();
    let claimed_by_creates: HashSet<Slot> = change_sets
        .iter()
        .filter(|cs| cs.kind == ChangeSetType::Create)
        .flat_map(claims)
        .collect();

    for cs in change_sets.iter_mut().filter(|cs| cs.kind == ChangeSetType::Delete) {
        let mut held: Vec<Slot> = unique_fields(cs)
            .iter()
            .filter_map(|f| cs.original_value(f).and_then(|v| slot(cs, f, v)))
            .collect();
        if let Some(pk) = &cs.serialized_primary_key {
            held.extend(slot(cs, PRIMARY_KEY_SLOT, &Value::Text(pk.clone())));
        }
        if held.iter().any(|s| claimed.contains(s)) {
            tracing::debug!(
                entity = %cs.meta.name,
                pk = ?cs.serialized_primary_key,
                "Delete moved early"
            );
            cs.kind = ChangeSetType::DeleteEarly;
        }
    }

    // removed rows still pointing at an early delete go with it
    let references = delete_references(change_sets);
    let mut moved = true;
    while moved {
        moved = false;
        for &(from, _, to) in &references {
            if change_sets[to].kind == ChangeSetType::DeleteEarly
                && change_sets[from].kind == ChangeSetType::Delete
            {
                tracing::debug!(
                    entity = %change_sets[from].meta.name,
                    pk = ?change_sets[from].serialized_primary_key,
                    "Referencing delete moved early"
                );
                change_sets[from].kind = ChangeSetType::DeleteEarly;
                moved = true;
            }
        }
    }

    // break swap cycles
    let deps = update_dependencies(change_sets);
    let mut nulled = Vec::new();
    let cyclic: Vec<usize> = deps
        .keys()
        .copied()
        .filter(|&idx| reaches(idx, idx, &deps))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    for idx in cyclic {
        let fields: Vec<String> = unique_fields(&change_sets[idx])
            .into_iter()
            .filter(|f| change_sets[idx].payload.contains_key(f))
            .filter(|f| change_sets[idx].meta.prop(f).is_some_and(|p| p.nullable))
            .collect();
        if fields.is_empty() {
            tracing::warn!(
                entity = %change_sets[idx].meta.name,
                "Unique values swapped on a non-nullable field cannot be deferred"
            );
            continue;
        }
        tracing::debug!(
            entity = %change_sets[idx].meta.name,
            fields = ?fields,
            "Deferring swapped unique values"
        );
        let deferred =
            ExtraUpdate::strip(&mut change_sets[idx], idx, &fields, ExtraUpdatePhase::Unique);
        extra.push(deferred);
        let mut early = change_sets[idx].clone();
        early.kind = ChangeSetType::UpdateEarly;
        early.payload = fields
            .iter()
            .map(|f| (f.clone(), PayloadValue::Value(Value::Null)))
            .collect();
        nulled.push(change_sets.len());
        change_sets.push(early);
    }

    // updates freeing values creates need, and what they wait on
    let deps = update_dependencies(change_sets);
    let mut early: HashSet<usize> = change_sets
        .iter()
        .enumerate()
        .filter(|(_, cs)| cs.kind == ChangeSetType::Update)
        .filter(|(_, cs)| frees(cs).iter().any(|s| claimed_by_creates.contains(s)))
        .map(|(idx, _)| idx)
        .collect();
    let mut pending: Vec<usize> = early.iter().copied().collect();
    while let Some(idx) = pending.pop() {
        for &dep in deps.get(&idx).into_iter().flatten() {
            if early.insert(dep) {
                pending.push(dep);
            }
        }
    }
    for &idx in &early {
        tracing::debug!(entity = %change_sets[idx].meta.name, "Update moved early");
        change_sets[idx].kind = ChangeSetType::UpdateEarly;
    }

    fn visit(
        idx: usize,
        deps: &HashMap<usize, Vec<usize>>,
        seen: &mut HashSet<usize>,
        out: &mut Vec<usize>,
    ) {
        if !seen.insert(idx) {
            return;
        }
        for &dep in deps.get(&idx).into_iter().flatten() {
            visit(dep, deps, seen, out);
        }
        out.push(idx);
    }
    let mut seen: HashSet<usize> = nulled.iter().copied().collect();
    let mut sequence = nulled.clone();
    for idx in 0..change_sets.len() {
        visit(idx, &deps, &mut seen, &mut sequence);
    }
    sequence
}
