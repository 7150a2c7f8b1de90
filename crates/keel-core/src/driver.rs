//! Driver trait: the storage contract the change set persister talks to.
//!
//! Rows are keyed by property name. Owning to-one references carry the target
//! primary key (an array for composite keys). Drivers translate this into
//! their own statements; Keel never builds SQL.

use crate::error::Error;
use crate::metadata::EntityMetadata;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::collections::BTreeMap;
use std::future::Future;

/// A row: property name to value.
pub type Row = BTreeMap<String, Value>;

/// The table a statement targets: entity metadata plus the effective schema.
#[derive(Debug, Clone, Copy)]
pub struct Table<'a> {
    pub meta: &'a EntityMetadata,
    pub schema: Option<&'a str>,
}

impl<'a> Table<'a> {
    pub fn new(meta: &'a EntityMetadata, schema: Option<&'a str>) -> Self {
        Self { meta, schema }
    }

    /// `schema.table`, or `table` without a schema.
    pub fn qualified_name(&self) -> String {
        match self.schema {
            Some(schema) => format!("{}.{}", schema, self.meta.table),
            None => self.meta.table.clone(),
        }
    }
}

/// Row selection.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Every listed field equals the given value.
    Eq(Row),
    /// The primary key tuple is one of the listed keys.
    PrimaryKeyIn(Vec<Vec<Value>>),
}

/// Result of `insert_many`.
#[derive(Debug, Clone, Default)]
pub struct InsertResult {
    /// Generated auto-increment value per inserted row (when the key is generated).
    pub ids: Vec<Option<Value>>,
    /// Store-computed columns per row; empty when returning is unsupported.
    pub returning: Vec<Row>,
}

/// Result of `update_many`.
#[derive(Debug, Clone, Default)]
pub struct UpdateResult {
    /// Number of rows matched and updated.
    pub affected: u64,
    /// Store-computed columns per updated row; empty when returning is unsupported.
    pub returning: Vec<Row>,
}

/// One row of an update: which row to match and the values to write.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRow {
    pub condition: Condition,
    pub values: Row,
}

/// Row lock requested by `UnitOfWork::lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Version check on the client, no database lock.
    Optimistic,
    /// Shared row lock (`FOR SHARE`).
    PessimisticRead,
    /// Exclusive row lock (`FOR UPDATE`).
    PessimisticWrite,
}

impl LockMode {
    pub const fn is_pessimistic(self) -> bool {
        matches!(self, LockMode::PessimisticRead | LockMode::PessimisticWrite)
    }
}

/// A storage backend.
///
/// All I/O operations return an `Outcome` so cancellation and panics
/// propagate through the flush pipeline exactly like errors.
pub trait Driver: Send + Sync {
    /// Whether inserts and updates report store-computed columns inline.
    fn supports_returning(&self) -> bool;

    /// Whether a transaction is currently open.
    fn in_transaction(&self) -> bool;

    /// Insert rows and report generated keys (and store-computed columns if supported).
    fn insert_many(
        &self,
        cx: &Cx,
        table: Table<'_>,
        rows: Vec<Row>,
    ) -> impl Future<Output = Outcome<InsertResult, Error>> + Send;

    /// Update rows; `affected` counts matched rows across the whole batch.
    fn update_many(
        &self,
        cx: &Cx,
        table: Table<'_>,
        rows: Vec<UpdateRow>,
    ) -> impl Future<Output = Outcome<UpdateResult, Error>> + Send;

    /// Delete matching rows and return how many were removed.
    fn delete(
        &self,
        cx: &Cx,
        table: Table<'_>,
        condition: Condition,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Read matching rows, optionally restricted to `fields`.
    fn find(
        &self,
        cx: &Cx,
        table: Table<'_>,
        condition: Condition,
        fields: Option<Vec<String>>,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the current transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the current transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Lock matching rows for the rest of the current transaction.
    fn lock_rows(
        &self,
        cx: &Cx,
        table: Table<'_>,
        condition: Condition,
        mode: LockMode,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;
}
