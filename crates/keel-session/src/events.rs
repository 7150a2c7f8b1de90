//! Flush lifecycle events.

use keel_core::Error;

/// Type alias for flush event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` aborts the commit (and rolls it back).
type FlushEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Lifecycle points callbacks can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushEvent {
    /// Before change sets are computed.
    BeforeFlush,
    /// After every statement executed, before the transaction commits.
    AfterFlush,
    /// After the transaction committed and in-memory state was refreshed.
    AfterCommit,
    /// After a failed commit was rolled back.
    AfterRollback,
}

/// Holds registered flush event callbacks.
#[derive(Default)]
pub struct FlushEventCallbacks {
    before_flush: Vec<FlushEventFn>,
    after_flush: Vec<FlushEventFn>,
    after_commit: Vec<FlushEventFn>,
    after_rollback: Vec<FlushEventFn>,
}

impl std::fmt::Debug for FlushEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl FlushEventCallbacks {
    pub fn register(
        &mut self,
        event: FlushEvent,
        f: impl FnMut() -> Result<(), Error> + Send + 'static,
    ) {
        self.slot(event).push(Box::new(f));
    }

    pub fn is_empty(&self) -> bool {
        self.before_flush.is_empty()
            && self.after_flush.is_empty()
            && self.after_commit.is_empty()
            && self.after_rollback.is_empty()
    }

    /// Run every callback for `event`, stopping at the first error.
    pub fn fire(&mut self, event: FlushEvent) -> Result<(), Error> {
        for cb in self.slot(event).iter_mut() {
            cb()?;
        }
        Ok(())
    }

    /// Append callbacks registered elsewhere (e.g. while these were firing).
    pub fn absorb(&mut self, other: FlushEventCallbacks) {
        self.before_flush.extend(other.before_flush);
        self.after_flush.extend(other.after_flush);
        self.after_commit.extend(other.after_commit);
        self.after_rollback.extend(other.after_rollback);
    }

    fn slot(&mut self, event: FlushEvent) -> &mut Vec<FlushEventFn> {
        match event {
            FlushEvent::BeforeFlush => &mut self.before_flush,
            FlushEvent::AfterFlush => &mut self.after_flush,
            FlushEvent::AfterCommit => &mut self.after_commit,
            FlushEvent::AfterRollback => &mut self.after_rollback,
        }
    }
}
