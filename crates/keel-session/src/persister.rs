//! Change Set Persister: turns ordered change set groups into driver calls.
//!
//! Each group holds change sets of one entity type and schema. The persister
//! batches them per the configuration, reconciles store-computed values
//! (generated keys, defaults, version bumps) back into the entity and the
//! change set payload, and re-reads those values when the driver cannot
//! return them inline.

use crate::change_set::{ChangeSet, ExtraUpdate, ExtraUpdatePhase};
use crate::config::UnitOfWorkConfig;
use keel_core::snapshot::{Payload, PayloadValue, values_equal};
use keel_core::{
    Condition, Cx, Driver, EntityMetadata, EntityRef, Error, MetadataStorage,
    OptimisticLockError, Outcome, PrimaryKey, ReferenceKind, Row, Table, UpdateRow,
    ValidationError, ValidationErrorKind, Value, try_outcome, try_result,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Values overwritten by store reconciliation, restored when a commit fails.
#[derive(Debug, Default)]
pub struct RestoreLog {
    entries: Vec<(EntityRef, String, Option<Value>)>,
    seen: HashSet<(EntityRef, String)>,
}

impl RestoreLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the current value of `field` the first time it is overwritten.
    pub fn record(&mut self, entity: &EntityRef, field: &str) {
        if self.seen.insert((entity.clone(), field.to_string())) {
            self.entries
                .push((entity.clone(), field.to_string(), entity.get(field)));
        }
    }

    /// Put every recorded field back, newest first.
    pub fn restore(self) {
        for (entity, field, value) in self.entries.into_iter().rev() {
            match value {
                Some(value) => entity.set_raw(&field, value),
                None => entity.unset_raw(&field),
            }
        }
    }
}

/// Executes change set groups against a driver.
pub struct ChangeSetPersister<'a, D> {
    driver: &'a D,
    metadata: &'a MetadataStorage,
    config: &'a UnitOfWorkConfig,
}

impl<'a, D: Driver> ChangeSetPersister<'a, D> {
    pub fn new(driver: &'a D, metadata: &'a MetadataStorage, config: &'a UnitOfWorkConfig) -> Self {
        Self {
            driver,
            metadata,
            config,
        }
    }

    /// Insert a group of CREATE change sets.
    ///
    /// Within the group, change sets referencing other members are ordered
    /// after them and never share a batch with them. Forward references that
    /// still cannot be resolved are stripped into circular extra updates.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn execute_inserts(
        &self,
        cx: &Cx,
        change_sets: &mut [ChangeSet],
        group: &[usize],
        extra: &mut Vec<ExtraUpdate>,
        restore: &mut RestoreLog,
    ) -> Outcome<usize, Error> {
        let Some(&first) = group.first() else {
            return Outcome::Ok(0);
        };
        let meta = Arc::clone(&change_sets[first].meta);
        let schema = change_sets[first].schema.clone();
        let table = Table::new(&meta, schema.as_deref());
        tracing::debug!(entity = %meta.name, count = group.len(), "Executing insert group");

        let chunk_size = self.config.insert_chunk();
        let mut inserted = 0;
        let mut chunk: Vec<usize> = Vec::new();
        for idx in order_within_group(change_sets, group) {
            let depends_on_chunk = change_sets[idx]
                .pending_targets()
                .iter()
                .any(|target| chunk.iter().any(|&c| change_sets[c].entity == *target));
            if !chunk.is_empty() && (depends_on_chunk || chunk.len() >= chunk_size) {
                inserted += try_outcome!(
                    self.insert_chunk(cx, table, change_sets, &chunk, extra, restore)
                        .await
                );
                chunk.clear();
            }
            chunk.push(idx);
        }
        if !chunk.is_empty() {
            inserted += try_outcome!(
                self.insert_chunk(cx, table, change_sets, &chunk, extra, restore)
                    .await
            );
        }
        Outcome::Ok(inserted)
    }

    async fn insert_chunk(
        &self,
        cx: &Cx,
        table: Table<'_>,
        change_sets: &mut [ChangeSet],
        chunk: &[usize],
        extra: &mut Vec<ExtraUpdate>,
        restore: &mut RestoreLog,
    ) -> Outcome<usize, Error> {
        let meta = table.meta;
        let mut rows = Vec::with_capacity(chunk.len());
        for &idx in chunk {
            defer_unresolved(&mut change_sets[idx], idx, extra);
            rows.push(to_row(&change_sets[idx].payload));
        }

        tracing::debug!(entity = %meta.name, rows = rows.len(), "Executing insert batch");
        let result = try_outcome!(self.driver.insert_many(cx, table, rows).await);

        let generated = meta
            .primary_keys()
            .into_iter()
            .find(|p| p.auto_increment)
            .map(|p| p.name.clone());
        for (pos, &idx) in chunk.iter().enumerate() {
            let cs = &mut change_sets[idx];
            if let (Some(pk_name), Some(Some(id))) = (&generated, result.ids.get(pos)) {
                if cs.entity.get(pk_name).is_none_or(|v| v.is_null()) {
                    apply(cs, pk_name, id.clone(), restore);
                }
            }
            if let Some(row) = result.returning.get(pos) {
                merge_row(cs, row, restore);
            }
            cs.refresh_primary_key();
            cs.persisted = true;
            if cs.primary_key.is_none() {
                tracing::warn!(entity = %meta.name, "Inserted row has no primary key");
            }
        }

        if !self.driver.supports_returning() {
            try_outcome!(self.reload_generated(cx, table, change_sets, chunk, restore).await);
        }
        Outcome::Ok(chunk.len())
    }

    /// Read back defaulted and version columns the insert did not write.
    async fn reload_generated(
        &self,
        cx: &Cx,
        table: Table<'_>,
        change_sets: &mut [ChangeSet],
        chunk: &[usize],
        restore: &mut RestoreLog,
    ) -> Outcome<(), Error> {
        let meta = table.meta;
        let fields: Vec<String> = meta
            .properties
            .iter()
            .filter(|p| p.kind == ReferenceKind::Scalar && !p.primary)
            .filter(|p| p.default.is_some() || p.version)
            .map(|p| p.name.clone())
            .collect();
        if fields.is_empty() {
            return Outcome::Ok(());
        }

        let targets: Vec<usize> = chunk
            .iter()
            .copied()
            .filter(|&idx| {
                let cs = &change_sets[idx];
                cs.primary_key.is_some() && fields.iter().any(|f| !cs.payload.contains_key(f))
            })
            .collect();
        if targets.is_empty() {
            return Outcome::Ok(());
        }

        let keys: Vec<Vec<Value>> = targets
            .iter()
            .filter_map(|&idx| change_sets[idx].primary_key.as_ref().map(|pk| pk.0.clone()))
            .collect();
        let pk_names = meta.primary_key_names();
        let mut projection = pk_names.clone();
        projection.extend(fields.iter().cloned());

        tracing::debug!(
            entity = %meta.name,
            rows = keys.len(),
            "Re-querying store-generated columns"
        );
        let rows = try_outcome!(
            self.driver
                .find(cx, table, Condition::PrimaryKeyIn(keys), Some(projection))
                .await
        );
        let by_key: HashMap<String, &Row> = rows
            .iter()
            .map(|row| (row_key(&pk_names, row), row))
            .collect();

        for idx in targets {
            let cs = &mut change_sets[idx];
            let Some(key) = cs.serialized_primary_key.clone() else {
                continue;
            };
            let Some(row) = by_key.get(&key) else {
                continue;
            };
            for field in &fields {
                if cs.payload.contains_key(field) {
                    continue;
                }
                if let Some(value) = row.get(field) {
                    apply(cs, field, value.clone(), restore);
                }
            }
        }
        Outcome::Ok(())
    }

    /// Update a group of UPDATE (or UPDATE_EARLY) change sets.
    ///
    /// Versioned entities match on the current version and write the next
    /// one; entities with concurrency-check fields match on their persisted
    /// values. A batch that affects fewer rows than it holds is an optimistic
    /// lock failure.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn execute_updates(
        &self,
        cx: &Cx,
        change_sets: &mut [ChangeSet],
        group: &[usize],
        extra: &mut Vec<ExtraUpdate>,
        restore: &mut RestoreLog,
    ) -> Outcome<usize, Error> {
        let Some(&first) = group.first() else {
            return Outcome::Ok(0);
        };
        let meta = Arc::clone(&change_sets[first].meta);
        let schema = change_sets[first].schema.clone();
        let table = Table::new(&meta, schema.as_deref());

        let mut pending = Vec::with_capacity(group.len());
        for &idx in group {
            defer_unresolved(&mut change_sets[idx], idx, extra);
            if change_sets[idx].payload.is_empty() {
                change_sets[idx].persisted = true;
            } else {
                pending.push(idx);
            }
        }
        tracing::debug!(entity = %meta.name, count = pending.len(), "Executing update group");

        let locking = meta.has_optimistic_locking();
        let version = meta.version_property().map(|p| p.name.clone());
        let mut updated = 0;
        for chunk in pending.chunks(self.config.update_chunk()) {
            let mut rows = Vec::with_capacity(chunk.len());
            let mut bumps = Vec::with_capacity(chunk.len());
            for &idx in chunk {
                let cs = &change_sets[idx];
                let pk = try_result!(require_primary_key(cs));
                let mut condition = primary_key_row(&meta, pk);
                let mut values = to_row(&cs.payload);
                let mut next = None;
                if let Some(version) = &version {
                    let current = current_version(cs, version);
                    let bumped = current.next_version();
                    condition.insert(version.clone(), current);
                    values.insert(version.clone(), bumped.clone());
                    next = Some(bumped);
                } else {
                    for prop in meta.concurrency_properties() {
                        if let Some(original) = cs.original_value(&prop.name) {
                            condition.insert(prop.name.clone(), original.clone());
                        }
                    }
                }
                rows.push(UpdateRow {
                    condition: Condition::Eq(condition),
                    values,
                });
                bumps.push(next);
            }

            tracing::debug!(entity = %meta.name, rows = rows.len(), "Executing update batch");
            let result = try_outcome!(self.driver.update_many(cx, table, rows).await);
            if locking && result.affected != chunk.len() as u64 {
                let err = try_outcome!(self.lock_failure(cx, table, change_sets, chunk).await);
                return Outcome::Err(err);
            }

            for (pos, &idx) in chunk.iter().enumerate() {
                let cs = &mut change_sets[idx];
                if let (Some(version), Some(next)) = (&version, bumps[pos].take()) {
                    apply(cs, version, next, restore);
                }
                if let Some(row) = result.returning.get(pos) {
                    merge_row(cs, row, restore);
                }
                cs.persisted = true;
            }
            updated += chunk.len();
        }
        Outcome::Ok(updated)
    }

    /// Delete a group of DELETE (or DELETE_EARLY) change sets.
    ///
    /// Unversioned rows are deleted in `IN (...)` chunks; versioned rows one
    /// by one so a stale version is detected.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn execute_deletes(
        &self,
        cx: &Cx,
        change_sets: &mut [ChangeSet],
        group: &[usize],
    ) -> Outcome<usize, Error> {
        let Some(&first) = group.first() else {
            return Outcome::Ok(0);
        };
        let meta = Arc::clone(&change_sets[first].meta);
        let schema = change_sets[first].schema.clone();
        let table = Table::new(&meta, schema.as_deref());

        let mut keyed = Vec::with_capacity(group.len());
        for &idx in group {
            match &change_sets[idx].primary_key {
                Some(pk) => keyed.push((idx, pk.clone())),
                None => tracing::warn!(
                    entity = %meta.name,
                    "Skipping delete of row without primary key"
                ),
            }
        }
        tracing::debug!(entity = %meta.name, count = keyed.len(), "Executing delete group");

        let mut deleted = 0;
        if meta.has_optimistic_locking() {
            let version = meta.version_property().map(|p| p.name.clone());
            for (idx, pk) in &keyed {
                let cs = &change_sets[*idx];
                let mut condition = primary_key_row(&meta, pk);
                if let Some(version) = &version {
                    condition.insert(version.clone(), current_version(cs, version));
                } else {
                    for prop in meta.concurrency_properties() {
                        if let Some(original) = cs.original_value(&prop.name) {
                            condition.insert(prop.name.clone(), original.clone());
                        }
                    }
                }
                let affected = try_outcome!(
                    self.driver
                        .delete(cx, table, Condition::Eq(condition))
                        .await
                );
                if affected != 1 {
                    let err =
                        try_outcome!(self.lock_failure(cx, table, change_sets, &[*idx]).await);
                    return Outcome::Err(err);
                }
                deleted += 1;
            }
        } else {
            for chunk in keyed.chunks(self.config.delete_batch_size.max(1)) {
                let keys = chunk.iter().map(|(_, pk)| pk.0.clone()).collect();
                let affected = try_outcome!(
                    self.driver
                        .delete(cx, table, Condition::PrimaryKeyIn(keys))
                        .await
                );
                deleted += affected as usize;
            }
        }

        for (idx, _) in keyed {
            change_sets[idx].persisted = true;
        }
        Outcome::Ok(deleted)
    }

    /// Execute the extra updates of one phase, grouped by entity type.
    #[tracing::instrument(level = "debug", skip_all, fields(phase = ?phase))]
    pub async fn execute_extra_updates(
        &self,
        cx: &Cx,
        extra: &[ExtraUpdate],
        phase: ExtraUpdatePhase,
    ) -> Outcome<usize, Error> {
        let mut groups: Vec<(String, Option<String>, Vec<&ExtraUpdate>)> = Vec::new();
        for update in extra.iter().filter(|u| u.target_phase == phase) {
            match groups
                .iter_mut()
                .find(|(name, schema, _)| *name == update.meta.name && *schema == update.schema)
            {
                Some((_, _, members)) => members.push(update),
                None => {
                    groups.push((update.meta.name.clone(), update.schema.clone(), vec![update]))
                }
            }
        }

        let mut executed = 0;
        for (_, schema, members) in groups {
            let meta = Arc::clone(&members[0].meta);
            let table = Table::new(&meta, schema.as_deref());
            let mut rows = Vec::with_capacity(members.len());
            for update in &members {
                let Some(pk) = update.entity.primary_key() else {
                    tracing::warn!(
                        entity = %meta.name,
                        "Skipping extra update of row without primary key"
                    );
                    continue;
                };
                let mut values = Row::new();
                for (field, value) in &update.values {
                    let Some(resolved) = value.resolve() else {
                        return Outcome::Err(
                            ValidationError::new(
                                ValidationErrorKind::Invalid,
                                "forward reference was never persisted",
                            )
                            .entity(&meta.name)
                            .property(field)
                            .into(),
                        );
                    };
                    values.insert(field.clone(), resolved);
                }
                rows.push(UpdateRow {
                    condition: Condition::Eq(primary_key_row(&meta, &pk)),
                    values,
                });
            }
            for chunk in rows.chunks(self.config.update_chunk()) {
                tracing::debug!(entity = %meta.name, rows = chunk.len(), "Executing extra updates");
                try_outcome!(self.driver.update_many(cx, table, chunk.to_vec()).await);
                executed += chunk.len();
            }
        }
        Outcome::Ok(executed)
    }

    /// Synchronise pivot rows of owning many-to-many collections.
    ///
    /// Members added since the snapshot are inserted and members removed are
    /// deleted. For fixed-order relations a changed order rewrites the whole
    /// relation. Rows involving deleted entities are left to the store's
    /// cascading foreign keys.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn execute_collection_updates(
        &self,
        cx: &Cx,
        updates: &[(EntityRef, String)],
        removed: &HashSet<EntityRef>,
    ) -> Outcome<usize, Error> {
        let mut written = 0;
        for (owner, name) in updates {
            if removed.contains(owner) {
                continue;
            }
            let meta = owner.meta();
            let prop = try_result!(meta.require_prop(name)).clone();
            let pivot = try_result!(self.metadata.pivot_for(&prop));
            let keys = pivot.primary_key_names();
            let [owner_col, target_col] = keys.as_slice() else {
                continue;
            };
            let has_position = pivot.prop("position").is_some();
            let Some(owner_pk) = owner.primary_key().map(|pk| pk.as_value()) else {
                tracing::warn!(
                    entity = %meta.name,
                    collection = %name,
                    "Skipping collection of owner without primary key"
                );
                continue;
            };

            let keyed = |items: Vec<EntityRef>| -> Vec<(EntityRef, Value)> {
                items
                    .into_iter()
                    .filter(|item| !removed.contains(item))
                    .filter_map(|item| {
                        let pk = item.primary_key()?.as_value();
                        Some((item, pk))
                    })
                    .collect()
            };
            let current = keyed(owner.collection_items(name));
            let snapshot = keyed(owner.collection_snapshot(name).unwrap_or_default());

            let (to_delete, to_insert) = if prop.fixed_order && order_changed(&current, &snapshot) {
                (
                    snapshot.iter().map(|(_, pk)| pk.clone()).collect::<Vec<_>>(),
                    current
                        .iter()
                        .enumerate()
                        .map(|(pos, (_, pk))| (pos, pk.clone()))
                        .collect::<Vec<_>>(),
                )
            } else {
                (
                    snapshot
                        .iter()
                        .filter(|(item, _)| !current.iter().any(|(c, _)| c == item))
                        .map(|(_, pk)| pk.clone())
                        .collect(),
                    current
                        .iter()
                        .enumerate()
                        .filter(|(_, (item, _))| !snapshot.iter().any(|(s, _)| s == item))
                        .map(|(pos, (_, pk))| (pos, pk.clone()))
                        .collect(),
                )
            };

            let schema = owner.effective_schema();
            let table = Table::new(&pivot, schema.as_deref());
            tracing::debug!(
                entity = %meta.name,
                collection = %name,
                deletes = to_delete.len(),
                inserts = to_insert.len(),
                "Synchronising collection"
            );

            for chunk in to_delete.chunks(self.config.delete_batch_size.max(1)) {
                let keys = chunk
                    .iter()
                    .map(|target| vec![owner_pk.clone(), target.clone()])
                    .collect();
                written += try_outcome!(
                    self.driver
                        .delete(cx, table, Condition::PrimaryKeyIn(keys))
                        .await
                ) as usize;
            }

            let rows: Vec<Row> = to_insert
                .into_iter()
                .map(|(pos, target)| {
                    let mut row = Row::new();
                    row.insert(owner_col.clone(), owner_pk.clone());
                    row.insert(target_col.clone(), target);
                    if has_position {
                        row.insert("position".to_string(), Value::BigInt(pos as i64));
                    }
                    row
                })
                .collect();
            for chunk in rows.chunks(self.config.insert_chunk()) {
                try_outcome!(self.driver.insert_many(cx, table, chunk.to_vec()).await);
                written += chunk.len();
            }
        }
        Outcome::Ok(written)
    }

    /// Work out which row of a failed locked statement is stale.
    async fn lock_failure(
        &self,
        cx: &Cx,
        table: Table<'_>,
        change_sets: &[ChangeSet],
        chunk: &[usize],
    ) -> Outcome<Error, Error> {
        let meta = table.meta;
        let version = meta.version_property().map(|p| p.name.clone());
        for &idx in chunk {
            let cs = &change_sets[idx];
            let Some(pk) = &cs.primary_key else {
                continue;
            };
            let rows = try_outcome!(
                self.driver
                    .find(cx, table, Condition::PrimaryKeyIn(vec![pk.0.clone()]), None)
                    .await
            );
            let expected = version.as_ref().map(|v| current_version(cs, v));
            let Some(row) = rows.first() else {
                return Outcome::Ok(lock_error(cs, expected, None, "row no longer exists"));
            };

            if let (Some(version), Some(expected)) = (&version, &expected) {
                let actual = row.get(version).cloned().unwrap_or(Value::Null);
                let written = expected.next_version();
                if !values_equal(&actual, expected) && !values_equal(&actual, &written) {
                    return Outcome::Ok(lock_error(
                        cs,
                        Some(expected.clone()),
                        Some(actual),
                        "version mismatch",
                    ));
                }
                continue;
            }

            for prop in meta.concurrency_properties() {
                let Some(original) = cs.original_value(&prop.name) else {
                    continue;
                };
                let actual = row.get(&prop.name).cloned().unwrap_or(Value::Null);
                let written = cs.payload_value(&prop.name);
                if !values_equal(&actual, original)
                    && written.as_ref().is_none_or(|w| !values_equal(&actual, w))
                {
                    return Outcome::Ok(lock_error(
                        cs,
                        Some(original.clone()),
                        Some(actual),
                        &format!("concurrency check on '{}' failed", prop.name),
                    ));
                }
            }
        }

        let cs = &change_sets[chunk[0]];
        Outcome::Ok(lock_error(cs, None, None, "optimistic lock failed"))
    }
}

fn lock_error(
    cs: &ChangeSet,
    expected: Option<Value>,
    actual: Option<Value>,
    message: &str,
) -> Error {
    tracing::warn!(
        entity = %cs.meta.name,
        pk = ?cs.serialized_primary_key,
        "Optimistic lock failure"
    );
    Error::OptimisticLock(OptimisticLockError {
        entity: cs.meta.name.clone(),
        primary_key: cs.serialized_primary_key.clone(),
        expected,
        actual,
        message: message.to_string(),
    })
}

/// Strip unresolved forward references from a change set into an extra update.
fn defer_unresolved(cs: &mut ChangeSet, idx: usize, extra: &mut Vec<ExtraUpdate>) {
    let unresolved = cs.unresolved_fields();
    if unresolved.is_empty() {
        return;
    }
    tracing::debug!(
        entity = %cs.meta.name,
        fields = ?unresolved,
        "Deferring forward references to an extra update"
    );
    extra.push(ExtraUpdate::strip(cs, idx, &unresolved, ExtraUpdatePhase::Circular));
}

fn require_primary_key(cs: &ChangeSet) -> Result<&PrimaryKey, Error> {
    cs.primary_key.as_ref().ok_or_else(|| {
        ValidationError::new(
            ValidationErrorKind::Invalid,
            "cannot update a row without a primary key",
        )
        .entity(&cs.meta.name)
            .into()
    })
}

/// Version to match: the entity's current value (bumped by earlier writes in
/// this flush), else the persisted one.
fn current_version(cs: &ChangeSet, version: &str) -> Value {
    cs.entity
        .get(version)
        .or_else(|| cs.original_value(version).cloned())
        .unwrap_or(Value::Null)
}

/// Write a store-computed value into the entity and the payload.
fn apply(cs: &mut ChangeSet, field: &str, value: Value, restore: &mut RestoreLog) {
    restore.record(&cs.entity, field);
    cs.entity.set_raw(field, value.clone());
    cs.payload
        .insert(field.to_string(), PayloadValue::Value(value));
}

fn merge_row(cs: &mut ChangeSet, row: &Row, restore: &mut RestoreLog) {
    let meta = Arc::clone(&cs.meta);
    for (field, value) in row {
        if meta
            .prop(field)
            .is_some_and(|p| p.kind == ReferenceKind::Scalar)
        {
            apply(cs, field, value.clone(), restore);
        }
    }
}

/// Resolve a payload into a driver row.
pub(crate) fn to_row(payload: &Payload) -> Row {
    payload
        .iter()
        .map(|(k, v)| (k.clone(), v.resolve().unwrap_or(Value::Null)))
        .collect()
}

pub(crate) fn primary_key_row(meta: &EntityMetadata, pk: &PrimaryKey) -> Row {
    meta.primary_key_names()
        .into_iter()
        .zip(pk.0.iter().cloned())
        .collect()
}

fn row_key(pk_names: &[String], row: &Row) -> String {
    PrimaryKey(
        pk_names
            .iter()
            .map(|name| row.get(name).cloned().unwrap_or(Value::Null))
            .collect(),
    )
    .serialize()
}

/// Did the relative order of kept members change, or were members inserted
/// anywhere but the end?
fn order_changed(current: &[(EntityRef, Value)], snapshot: &[(EntityRef, Value)]) -> bool {
    if snapshot.is_empty() {
        return false;
    }
    let kept_current: Vec<&EntityRef> = current
        .iter()
        .map(|(e, _)| e)
        .filter(|e| snapshot.iter().any(|(s, _)| s == *e))
        .collect();
    let kept_snapshot: Vec<&EntityRef> = snapshot
        .iter()
        .map(|(e, _)| e)
        .filter(|e| current.iter().any(|(c, _)| c == *e))
        .collect();
    if kept_current != kept_snapshot {
        return true;
    }
    let mut seen_new = false;
    for (item, _) in current {
        let is_new = !snapshot.iter().any(|(s, _)| s == item);
        if is_new {
            seen_new = true;
        } else if seen_new {
            return true;
        }
    }
    false
}

/// Order a group so members referencing other members come after them.
fn order_within_group(change_sets: &[ChangeSet], group: &[usize]) -> Vec<usize> {
    fn visit(
        idx: usize,
        change_sets: &[ChangeSet],
        members: &HashMap<EntityRef, usize>,
        state: &mut HashMap<usize, bool>,
        out: &mut Vec<usize>,
    ) {
        if state.contains_key(&idx) {
            return;
        }
        state.insert(idx, false);
        for target in change_sets[idx].pending_targets() {
            if let Some(&dep) = members.get(&target) {
                visit(dep, change_sets, members, state, out);
            }
        }
        state.insert(idx, true);
        out.push(idx);
    }

    let members: HashMap<EntityRef, usize> = group
        .iter()
        .map(|&idx| (change_sets[idx].entity.clone(), idx))
        .collect();
    let mut state = HashMap::new();
    let mut out = Vec::with_capacity(group.len());
    for &idx in group {
        visit(idx, change_sets, &members, &mut state, &mut out);
    }
    out
}
