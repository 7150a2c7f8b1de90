//! Table storage and constraint enforcement.
//!
//! Every mutating call works on a copy of the affected tables and only
//! replaces the live data when all constraints hold, so a failed statement
//! leaves the store untouched.

use keel_core::snapshot::values_equal;
use keel_core::{
    Condition, EntityMetadata, Error, MetadataStorage, PrimaryKey, ReferenceKind, Result, Row,
    Table, UpdateRow, Value,
};
use std::collections::BTreeMap;

pub(crate) const NOT_NULL_VIOLATION: &str = "23502";
pub(crate) const FOREIGN_KEY_VIOLATION: &str = "23503";
pub(crate) const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone, Default)]
pub(crate) struct TableData {
    pub entity: String,
    pub schema: Option<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    tables: BTreeMap<String, TableData>,
    sequences: BTreeMap<String, i64>,
}

impl Tables {
    pub(crate) fn rows(&self, qualified: &str) -> Vec<Row> {
        self.tables
            .get(qualified)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    fn table_mut(&mut self, table: &Table<'_>) -> &mut TableData {
        self.tables
            .entry(table.qualified_name())
            .or_insert_with(|| TableData {
                entity: table.meta.name.clone(),
                schema: table.schema.map(str::to_string),
                rows: Vec::new(),
            })
    }

    /// Store rows as-is and advance the key sequence past them.
    pub(crate) fn seed(&mut self, table: &Table<'_>, rows: Vec<Row>) {
        let name = table.qualified_name();
        let generated: Vec<String> = table
            .meta
            .properties
            .iter()
            .filter(|p| p.auto_increment)
            .map(|p| p.name.clone())
            .collect();
        let highest = rows
            .iter()
            .flat_map(|row| generated.iter().filter_map(|g| row.get(g)?.as_i64()))
            .max()
            .unwrap_or(0);
        let sequence = self.sequences.entry(name).or_insert(0);
        *sequence = (*sequence).max(highest);
        self.table_mut(table).rows.extend(rows);
    }

    pub(crate) fn insert(
        &mut self,
        metadata: &MetadataStorage,
        table: &Table<'_>,
        rows: Vec<Row>,
        returning: bool,
    ) -> Result<(Vec<Option<Value>>, Vec<Row>)> {
        let meta = table.meta;
        let name = table.qualified_name();
        let mut staged = self.clone();
        let mut ids = Vec::with_capacity(rows.len());
        let mut returned = Vec::new();

        for mut row in rows {
            let mut generated_id = None;
            let mut generated = Row::new();
            for prop in meta.properties.iter().filter(|p| p.is_persisted()) {
                let present = row.get(&prop.name).is_some_and(|v| !v.is_null());
                if present {
                    if prop.auto_increment {
                        if let Some(explicit) = row.get(&prop.name).and_then(Value::as_i64) {
                            let sequence = staged.sequences.entry(name.clone()).or_insert(0);
                            *sequence = (*sequence).max(explicit);
                        }
                    }
                    continue;
                }
                let value = if prop.auto_increment {
                    let sequence = staged.sequences.entry(name.clone()).or_insert(0);
                    *sequence += 1;
                    let id = Value::BigInt(*sequence);
                    generated_id = Some(id.clone());
                    Some(id)
                } else if prop.version {
                    Some(Value::Int(1))
                } else {
                    prop.default.clone()
                };
                match value {
                    Some(value) => {
                        generated.insert(prop.name.clone(), value.clone());
                        row.insert(prop.name.clone(), value);
                    }
                    None => {
                        row.entry(prop.name.clone()).or_insert(Value::Null);
                    }
                }
            }

            staged.check_row(metadata, table, &row, None)?;
            staged.table_mut(table).rows.push(row);
            ids.push(generated_id);
            if returning {
                returned.push(generated);
            }
        }

        *self = staged;
        Ok((ids, returned))
    }

    pub(crate) fn update(
        &mut self,
        metadata: &MetadataStorage,
        table: &Table<'_>,
        rows: Vec<UpdateRow>,
    ) -> Result<u64> {
        let mut staged = self.clone();
        let mut affected = 0;
        for update in rows {
            let matching: Vec<usize> = staged
                .table_mut(table)
                .rows
                .iter()
                .enumerate()
                .filter(|(_, row)| matches(&update.condition, row, table.meta))
                .map(|(idx, _)| idx)
                .collect();
            for idx in matching {
                let mut row = staged.table_mut(table).rows[idx].clone();
                for (field, value) in &update.values {
                    row.insert(field.clone(), value.clone());
                }
                staged.check_row(metadata, table, &row, Some(idx))?;
                staged.table_mut(table).rows[idx] = row;
                affected += 1;
            }
        }
        *self = staged;
        Ok(affected)
    }

    pub(crate) fn delete(
        &mut self,
        metadata: &MetadataStorage,
        table: &Table<'_>,
        condition: &Condition,
    ) -> Result<u64> {
        let mut staged = self.clone();
        let data = staged.table_mut(table);
        let (removed, kept): (Vec<Row>, Vec<Row>) = std::mem::take(&mut data.rows)
            .into_iter()
            .partition(|row| matches(condition, row, table.meta));
        data.rows = kept;
        let count = removed.len() as u64;
        let schema = table.schema.map(str::to_string);
        staged.release_references(metadata, table.meta, schema.as_ref(), &removed)?;
        *self = staged;
        Ok(count)
    }

    /// Cascade or reject deletion of rows other rows still point at.
    fn release_references(
        &mut self,
        metadata: &MetadataStorage,
        deleted: &EntityMetadata,
        schema: Option<&String>,
        removed: &[Row],
    ) -> Result<()> {
        if removed.is_empty() {
            return Ok(());
        }
        let keys: Vec<PrimaryKey> = removed
            .iter()
            .map(|row| primary_key_of(deleted, row))
            .collect();
        let names: Vec<String> = self.tables.keys().cloned().collect();

        for name in names {
            let Some(data) = self.tables.get(&name) else {
                continue;
            };
            if data.schema.as_ref() != schema {
                continue;
            }
            let Some(referencing) = metadata.find(&data.entity) else {
                continue;
            };
            for prop in referencing.owning_to_one() {
                let Some(target) = prop.target.as_deref().and_then(|t| metadata.find(t)) else {
                    continue;
                };
                if target.table != deleted.table {
                    continue;
                }
                let points_at_removed = |row: &Row| {
                    row.get(&prop.name).is_some_and(|v| {
                        !v.is_null()
                            && keys
                                .iter()
                                .any(|k| key_equals(&PrimaryKey::from(v.clone()), k))
                    })
                };
                let Some(data) = self.tables.get_mut(&name) else {
                    continue;
                };
                if !data.rows.iter().any(|row| points_at_removed(row)) {
                    continue;
                }
                if !prop.delete_cascade {
                    return Err(Error::constraint(
                        &referencing.name,
                        FOREIGN_KEY_VIOLATION,
                        format!(
                            "delete on '{}' violates foreign key '{}' of '{}'",
                            deleted.table, prop.name, referencing.table
                        ),
                    ));
                }
                let (cascaded, kept): (Vec<Row>, Vec<Row>) = std::mem::take(&mut data.rows)
                    .into_iter()
                    .partition(|row| points_at_removed(row));
                data.rows = kept;
                tracing::trace!(table = %name, rows = cascaded.len(), "Cascading delete");
                self.release_references(metadata, &referencing, schema, &cascaded)?;
            }
        }
        Ok(())
    }

    /// Not-null, primary key, unique and foreign key checks for one row.
    fn check_row(
        &self,
        metadata: &MetadataStorage,
        table: &Table<'_>,
        row: &Row,
        replacing: Option<usize>,
    ) -> Result<()> {
        let meta = table.meta;
        let empty = Vec::new();
        let existing = self
            .tables
            .get(&table.qualified_name())
            .map_or(&empty, |t| &t.rows);
        let others = || {
            existing
                .iter()
                .enumerate()
                .filter(move |(idx, _)| Some(*idx) != replacing)
                .map(|(_, r)| r)
        };

        for prop in meta.properties.iter().filter(|p| p.is_persisted()) {
            if prop.nullable || prop.kind == ReferenceKind::ManyToMany {
                continue;
            }
            if row.get(&prop.name).is_none_or(Value::is_null) {
                return Err(Error::constraint(
                    &meta.name,
                    NOT_NULL_VIOLATION,
                    format!("null value in column '{}' of '{}'", prop.name, meta.table),
                ));
            }
        }

        let key = primary_key_of(meta, row);
        if others().any(|other| key_equals(&primary_key_of(meta, other), &key)) {
            return Err(Error::constraint(
                &meta.name,
                UNIQUE_VIOLATION,
                format!("duplicate primary key [{}] in '{}'", key, meta.table),
            ));
        }

        let unique = meta.properties.iter().filter(|p| {
            (p.unique && p.kind == ReferenceKind::Scalar)
                || (p.kind == ReferenceKind::OneToOne && p.owner)
        });
        for prop in unique {
            let Some(value) = row.get(&prop.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let taken = others().any(|other| {
                other
                    .get(&prop.name)
                    .is_some_and(|o| values_equal(o, value))
            });
            if taken {
                return Err(Error::constraint(
                    &meta.name,
                    UNIQUE_VIOLATION,
                    format!(
                        "duplicate value {} for unique column '{}' of '{}'",
                        value, prop.name, meta.table
                    ),
                ));
            }
        }

        for prop in meta.owning_to_one() {
            let Some(value) = row.get(&prop.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let Some(target) = prop.target.as_deref().and_then(|t| metadata.find(t)) else {
                continue;
            };
            let target_table = Table::new(&target, table.schema.or(target.schema.as_deref()));
            let wanted = PrimaryKey::from(value.clone());
            let self_reference = target_table.qualified_name() == table.qualified_name();
            let found = (self_reference && key_equals(&primary_key_of(&target, row), &wanted))
                || self
                    .tables
                    .get(&target_table.qualified_name())
                    .is_some_and(|t| {
                        t.rows
                            .iter()
                            .any(|r| key_equals(&primary_key_of(&target, r), &wanted))
                    });
            if !found {
                return Err(Error::constraint(
                    &meta.name,
                    FOREIGN_KEY_VIOLATION,
                    format!(
                        "'{}' references missing '{}' row [{}]",
                        prop.name, target.table, wanted
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn primary_key_of(meta: &EntityMetadata, row: &Row) -> PrimaryKey {
    PrimaryKey(
        meta.primary_key_names()
            .iter()
            .map(|name| row.get(name).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

fn key_equals(a: &PrimaryKey, b: &PrimaryKey) -> bool {
    a.0.len() == b.0.len() && a.0.iter().zip(&b.0).all(|(l, r)| values_equal(l, r))
}

/// Does `row` satisfy `condition`?
pub(crate) fn matches(condition: &Condition, row: &Row, meta: &EntityMetadata) -> bool {
    match condition {
        Condition::Eq(fields) => fields.iter().all(|(field, wanted)| match row.get(field) {
            Some(actual) => values_equal(actual, wanted),
            None => wanted.is_null(),
        }),
        Condition::PrimaryKeyIn(keys) => {
            let key = primary_key_of(meta, row);
            keys.iter()
                .any(|k| key_equals(&key, &PrimaryKey(k.clone())))
        }
    }
}

/// Short rendering of a condition for the statement log.
pub(crate) fn describe(condition: &Condition) -> String {
    match condition {
        Condition::Eq(fields) => {
            let parts: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("where {}", parts.join(" and "))
        }
        Condition::PrimaryKeyIn(keys) => {
            let parts: Vec<String> = keys
                .iter()
                .map(|k| {
                    let values: Vec<String> = k.iter().map(ToString::to_string).collect();
                    format!("({})", values.join(", "))
                })
                .collect();
            format!("in {}", parts.join(" "))
        }
    }
}
