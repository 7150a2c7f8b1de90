//! Session and Unit of Work for Keel.
//!
//! `keel-session` is the **unit-of-work layer**. It tracks which entities a
//! session manages, computes what changed since they were loaded and writes
//! every change in one ordered, atomic flush.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single in-memory instance per (root type, primary key, schema).
//! - **Change sets**: one pending operation per entity, diffed against its snapshot.
//! - **Commit order**: parents before children, derived from relation metadata.
//! - **Persister**: batched statements, generated-key reconciliation, optimistic locks.
//!
//! # Example
//!
//! ```ignore
//! let uow = UnitOfWork::new(driver, metadata);
//!
//! let author = uow.metadata().instantiate("Author")?;
//! author.set("name", "Ada")?;
//! uow.persist(&author)?;
//!
//! // INSERT author; the generated key is written back
//! let stats = uow.commit(&cx).await;
//! ```

pub mod change_set;
pub mod change_set_computer;
pub mod commit_order;
mod commit_queue;
pub mod config;
pub mod events;
pub mod identity_map;
pub mod persister;
pub mod unit_of_work;

pub use change_set::{
    ChangeSet, ChangeSetSummary, ChangeSetType, EntitySet, ExtraUpdate, ExtraUpdatePhase,
};
pub use change_set_computer::ChangeSetComputer;
pub use commit_order::CommitOrderCalculator;
pub use config::UnitOfWorkConfig;
pub use events::{FlushEvent, FlushEventCallbacks};
pub use identity_map::{IdentityKey, IdentityMap};
pub use persister::{ChangeSetPersister, RestoreLog};
pub use unit_of_work::{CommitStats, PendingCounts, UnitOfWork};
