//! In-memory reference driver for Keel.
//!
//! `MemoryDriver` implements the [`Driver`] contract over plain row maps. It
//! enforces the constraints a relational store would (not-null, primary key,
//! unique, foreign key with restrict or cascade on delete), generates
//! auto-increment keys and fills column defaults and initial versions.
//! Transactions snapshot the whole store and restore it on rollback.
//!
//! For tests it records a statement log, can inject the failure of the next
//! matching statement and can suspend every statement once so concurrent
//! commits interleave.

mod store;

use keel_core::{
    Condition, Cx, Driver, Error, InsertResult, LockMode, MetadataStorage, Outcome, QueryError,
    QueryErrorKind, Result, Row, Table, TransactionError, TransactionErrorKind, UpdateResult,
    UpdateRow,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use store::{Tables, describe};

/// Driver capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDriverOptions {
    /// Report generated columns from inserts.
    pub supports_returning: bool,
}

impl Default for MemoryDriverOptions {
    fn default() -> Self {
        Self {
            supports_returning: true,
        }
    }
}

/// Statement kinds a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Find,
    Lock,
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Default)]
struct State {
    data: Tables,
    /// Data as of `begin`, restored by `rollback`.
    transaction: Option<Tables>,
    statements: Vec<String>,
    failures: Vec<(Operation, Option<String>)>,
    suspend: bool,
}

/// Shared in-memory store; clones see the same data.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    metadata: Arc<MetadataStorage>,
    options: MemoryDriverOptions,
    state: Arc<Mutex<State>>,
}

impl MemoryDriver {
    pub fn new(metadata: Arc<MetadataStorage>) -> Self {
        Self::with_options(metadata, MemoryDriverOptions::default())
    }

    pub fn with_options(metadata: Arc<MetadataStorage>, options: MemoryDriverOptions) -> Self {
        Self {
            metadata,
            options,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Toggle inline reporting of generated columns.
    pub fn with_returning(mut self, supports_returning: bool) -> Self {
        self.options.supports_returning = supports_returning;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert rows into the default table of `entity` without any checks.
    ///
    /// # Panics
    ///
    /// Panics if `entity` is not registered.
    pub fn seed(&self, entity: &str, rows: Vec<Row>) {
        let meta = self
            .metadata
            .get(entity)
            .unwrap_or_else(|err| std::panic::panic_any(format!("cannot seed: {err}")));
        let table = Table::new(&meta, meta.schema.as_deref());
        self.state().data.seed(&table, rows);
    }

    /// Rows of the default table of `entity` (empty for unknown entities).
    pub fn rows(&self, entity: &str) -> Vec<Row> {
        let Some(meta) = self.metadata.find(entity) else {
            return Vec::new();
        };
        let table = Table::new(&meta, meta.schema.as_deref());
        self.table_rows(&table.qualified_name())
    }

    /// Rows of a table by qualified name (`schema.table` or `table`).
    pub fn table_rows(&self, qualified: &str) -> Vec<Row> {
        self.state().data.rows(qualified)
    }

    /// Every statement executed so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.state().statements.clear();
    }

    /// Fail the next `operation` (on `table`, or on any table).
    pub fn fail_next(&self, operation: Operation, table: Option<&str>) {
        self.state()
            .failures
            .push((operation, table.map(str::to_string)));
    }

    /// Make every statement yield to the executor once before completing.
    pub fn suspend_statements(&self, suspend: bool) {
        self.state().suspend = suspend;
    }

    /// Log and run one statement under the store lock.
    fn run<T>(
        &self,
        cx: &Cx,
        operation: Operation,
        table: Option<&str>,
        statement: String,
        f: impl FnOnce(&mut State) -> Result<T>,
    ) -> Outcome<T, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let mut state = self.state();
        tracing::trace!(statement = %statement, "Memory driver statement");
        state.statements.push(statement);

        let injected = state.failures.iter().position(|(op, target)| {
            *op == operation && (target.is_none() || target.as_deref() == table)
        });
        if let Some(pos) = injected {
            state.failures.remove(pos);
            tracing::debug!(?operation, table, "Injected failure");
            return Outcome::Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                entity: None,
                sqlstate: None,
                message: format!("injected {operation:?} failure"),
                source: None,
            }));
        }

        match f(&mut state) {
            Ok(value) => Outcome::Ok(value),
            Err(err) => {
                tracing::debug!(error = %err, "Memory driver statement failed");
                Outcome::Err(err)
            }
        }
    }

    fn finish<T: Send>(
        &self,
        outcome: Outcome<T, Error>,
    ) -> impl Future<Output = Outcome<T, Error>> + Send + use<T> {
        let suspend = self.state().suspend;
        async move {
            if suspend {
                YieldOnce::default().await;
            }
            outcome
        }
    }
}

/// Pending exactly once, waking itself.
#[derive(Debug, Default)]
struct YieldOnce {
    yielded: bool,
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            task.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

fn transaction_error(kind: TransactionErrorKind, message: &str) -> Error {
    Error::Transaction(TransactionError {
        kind,
        message: message.to_string(),
    })
}

impl Driver for MemoryDriver {
    fn supports_returning(&self) -> bool {
        self.options.supports_returning
    }

    fn in_transaction(&self) -> bool {
        self.state().transaction.is_some()
    }

    fn insert_many(
        &self,
        cx: &Cx,
        table: Table<'_>,
        rows: Vec<Row>,
    ) -> impl Future<Output = Outcome<InsertResult, Error>> + Send {
        let name = table.qualified_name();
        let statement = format!("INSERT {} ({})", name, rows.len());
        let returning = self.options.supports_returning;
        let outcome = self.run(cx, Operation::Insert, Some(&name), statement, |state| {
            let (ids, returning) = state.data.insert(&self.metadata, &table, rows, returning)?;
            Ok(InsertResult { ids, returning })
        });
        self.finish(outcome)
    }

    fn update_many(
        &self,
        cx: &Cx,
        table: Table<'_>,
        rows: Vec<UpdateRow>,
    ) -> impl Future<Output = Outcome<UpdateResult, Error>> + Send {
        let name = table.qualified_name();
        let statement = format!("UPDATE {} ({})", name, rows.len());
        let outcome = self.run(cx, Operation::Update, Some(&name), statement, |state| {
            let affected = state.data.update(&self.metadata, &table, rows)?;
            Ok(UpdateResult {
                affected,
                returning: Vec::new(),
            })
        });
        self.finish(outcome)
    }

    fn delete(
        &self,
        cx: &Cx,
        table: Table<'_>,
        condition: Condition,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let name = table.qualified_name();
        let statement = format!("DELETE {} {}", name, describe(&condition));
        let outcome = self.run(cx, Operation::Delete, Some(&name), statement, |state| {
            state.data.delete(&self.metadata, &table, &condition)
        });
        self.finish(outcome)
    }

    fn find(
        &self,
        cx: &Cx,
        table: Table<'_>,
        condition: Condition,
        fields: Option<Vec<String>>,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let name = table.qualified_name();
        let statement = format!("FIND {} {}", name, describe(&condition));
        let outcome = self.run(cx, Operation::Find, Some(&name), statement, |state| {
            let rows = state
                .data
                .rows(&name)
                .into_iter()
                .filter(|row| store::matches(&condition, row, table.meta))
                .map(|row| match &fields {
                    Some(fields) => row
                        .into_iter()
                        .filter(|(k, _)| fields.contains(k))
                        .collect(),
                    None => row,
                })
                .collect();
            Ok(rows)
        });
        self.finish(outcome)
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = self.run(cx, Operation::Begin, None, "BEGIN".to_string(), |state| {
            if state.transaction.is_some() {
                return Err(transaction_error(
                    TransactionErrorKind::AlreadyActive,
                    "a transaction is already active",
                ));
            }
            state.transaction = Some(state.data.clone());
            Ok(())
        });
        self.finish(outcome)
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = self.run(cx, Operation::Commit, None, "COMMIT".to_string(), |state| {
            match state.transaction.take() {
                Some(_) => Ok(()),
                None => Err(transaction_error(
                    TransactionErrorKind::NotActive,
                    "no transaction is active",
                )),
            }
        });
        self.finish(outcome)
    }

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = self.run(cx, Operation::Rollback, None, "ROLLBACK".to_string(), |state| {
            match state.transaction.take() {
                Some(saved) => {
                    state.data = saved;
                    Ok(())
                }
                None => Err(transaction_error(
                    TransactionErrorKind::NotActive,
                    "no transaction is active",
                )),
            }
        });
        self.finish(outcome)
    }

    fn lock_rows(
        &self,
        cx: &Cx,
        table: Table<'_>,
        condition: Condition,
        mode: LockMode,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let name = table.qualified_name();
        let statement = format!("LOCK {} {:?} {}", name, mode, describe(&condition));
        let outcome = self.run(cx, Operation::Lock, Some(&name), statement, |state| {
            if state.transaction.is_none() {
                return Err(transaction_error(
                    TransactionErrorKind::NotActive,
                    "row locks need an active transaction",
                ));
            }
            Ok(())
        });
        self.finish(outcome)
    }
}
