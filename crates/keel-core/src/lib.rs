//! Core types for Keel.
//!
//! This crate provides the building blocks the unit of work operates on:
//!
//! - `Value` for dynamically-typed field values
//! - `Error` taxonomy (validation, optimistic lock, metadata, query)
//! - `EntityMetadata` / `MetadataStorage` describing entity types and relations
//! - `EntityRef` handles with explicit change tracking (`set`, `set_reference`)
//! - `Collection` write-side bookkeeping with inverse-side propagation
//! - Entity snapshots and field comparators
//! - `Driver` trait, the storage contract the persister talks to
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod collection;
pub mod driver;
pub mod entity;
pub mod error;
pub mod metadata;
pub mod snapshot;
pub mod value;

pub use collection::{Collection, CollectionHandle};
pub use driver::{Condition, Driver, InsertResult, LockMode, Row, Table, UpdateResult, UpdateRow};
pub use entity::{EntityData, EntityRef, PrimaryKey, SessionLink};
pub use error::{
    Error, MetadataError, OptimisticLockError, QueryError, QueryErrorKind, Result,
    TransactionError, TransactionErrorKind, ValidationError, ValidationErrorKind,
};
pub use metadata::{
    Cascade, Comparator, EntityMetadata, Initializer, MetadataStorage, PropertyMeta,
    ReferenceKind,
};
pub use snapshot::{EntitySnapshot, Payload, PayloadValue};
pub use value::Value;

/// Propagate a non-`Ok` [`Outcome`] out of the enclosing function.
///
/// Evaluates to the `Ok` value; `Err`, `Cancelled` and `Panicked` return early
/// unchanged.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}

/// Propagate the `Err` of a [`Result`](std::result::Result) out of a function
/// returning [`Outcome`].
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return $crate::Outcome::Err(err.into()),
        }
    };
}
