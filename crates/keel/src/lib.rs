//! Keel - a unit-of-work persistence core.
//!
//! Keel tracks entity state in memory and writes every pending change in one
//! ordered, atomic flush:
//!
//! - Identity map: one instance per entity identity and session
//! - Explicit change tracking (`set`, `set_reference`, collections)
//! - Cascading persist, remove and merge with orphan removal
//! - Dependency-ordered, batched statements with generated-key reconciliation
//! - Automatic resolution of circular references and unique-value swaps
//! - Optimistic (version / concurrency field) and pessimistic locking
//!
//! # Quick Start
//!
//! ```ignore
//! use keel::prelude::*;
//!
//! let metadata = Arc::new(MetadataStorage::new([
//!     EntityMetadata::new("Author")
//!         .property(PropertyMeta::id("id"))
//!         .property(PropertyMeta::scalar("name")),
//! ])?);
//! let uow = UnitOfWork::new(driver, Arc::clone(&metadata));
//!
//! let author = metadata.instantiate("Author")?;
//! author.set("name", "Ada")?;
//! uow.persist(&author)?;
//!
//! match uow.commit(&cx).await {
//!     Outcome::Ok(stats) => assert_eq!(stats.inserted, 1),
//!     other => { /* rolled back */ }
//! }
//! assert!(author.is_managed());
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: built on asupersync for cancel-correct operations
//! - **Pluggable storage**: anything implementing [`Driver`]
//! - **Serialised commits**: concurrent commits on one session run in call order

// Re-export all public types from sub-crates
pub use keel_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    Cascade,
    Collection,
    CollectionHandle,
    Comparator,
    Condition,
    Driver,
    EntityMetadata,
    EntityRef,
    EntitySnapshot,
    Error,
    Initializer,
    InsertResult,
    LockMode,
    MetadataError,
    MetadataStorage,
    OptimisticLockError,
    Payload,
    PayloadValue,
    PrimaryKey,
    PropertyMeta,
    QueryError,
    QueryErrorKind,
    ReferenceKind,
    Result,
    Row,
    SessionLink,
    Table,
    TransactionError,
    TransactionErrorKind,
    UpdateResult,
    UpdateRow,
    ValidationError,
    ValidationErrorKind,
    Value,
    // Macros
    try_outcome,
    try_result,
};
pub use keel_core::snapshot;

pub use keel_session::{
    ChangeSet, ChangeSetComputer, ChangeSetPersister, ChangeSetSummary, ChangeSetType,
    CommitOrderCalculator, CommitStats, EntitySet, ExtraUpdate, ExtraUpdatePhase, FlushEvent,
    FlushEventCallbacks, IdentityKey, IdentityMap, PendingCounts, RestoreLog, UnitOfWork,
    UnitOfWorkConfig,
};

/// Commonly used items.
pub mod prelude {
    pub use crate::{
        // Metadata
        Cascade,
        // asupersync
        Cx,
        // Driver contract
        Driver,
        EntityMetadata,
        // Entities
        EntityRef,
        Error,
        LockMode,
        MetadataStorage,
        Outcome,
        PrimaryKey,
        PropertyMeta,
        Result,
        Row,
        // Session
        UnitOfWork,
        UnitOfWorkConfig,
        Value,
    };
    pub use std::sync::Arc;
}
