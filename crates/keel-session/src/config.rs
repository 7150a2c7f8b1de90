//! Unit of work configuration.

use serde::{Deserialize, Serialize};

/// Configuration for flush behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOfWorkConfig {
    /// Maximum rows per batched insert or update statement.
    pub batch_size: usize,
    /// Maximum primary keys per `IN (...)` delete.
    pub delete_batch_size: usize,
    /// Group inserts of one entity type into multi-row statements.
    pub use_batch_inserts: bool,
    /// Group updates of one entity type into multi-row statements.
    pub use_batch_updates: bool,
    /// Open a transaction around each commit unless one is already active.
    pub implicit_transactions: bool,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            batch_size: 300,
            delete_batch_size: 300,
            use_batch_inserts: true,
            use_batch_updates: true,
            implicit_transactions: true,
        }
    }
}

impl UnitOfWorkConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch size (builder pattern). Zero is treated as one.
    #[must_use]
    pub fn batch_size(mut self, value: usize) -> Self {
        self.batch_size = value.max(1);
        self
    }

    /// Set the delete chunk size (builder pattern). Zero is treated as one.
    #[must_use]
    pub fn delete_batch_size(mut self, value: usize) -> Self {
        self.delete_batch_size = value.max(1);
        self
    }

    #[must_use]
    pub fn use_batch_inserts(mut self, value: bool) -> Self {
        self.use_batch_inserts = value;
        self
    }

    #[must_use]
    pub fn use_batch_updates(mut self, value: bool) -> Self {
        self.use_batch_updates = value;
        self
    }

    #[must_use]
    pub fn implicit_transactions(mut self, value: bool) -> Self {
        self.implicit_transactions = value;
        self
    }

    /// Effective insert chunk size.
    pub(crate) fn insert_chunk(&self) -> usize {
        if self.use_batch_inserts {
            self.batch_size.max(1)
        } else {
            1
        }
    }

    /// Effective update chunk size.
    pub(crate) fn update_chunk(&self) -> usize {
        if self.use_batch_updates {
            self.batch_size.max(1)
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = UnitOfWorkConfig::default();
        assert_eq!(config.batch_size, 300);
        assert_eq!(config.delete_batch_size, 300);
        assert!(config.use_batch_inserts);
        assert!(config.use_batch_updates);
        assert!(config.implicit_transactions);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: UnitOfWorkConfig =
            serde_json::from_str(r#"{"batch_size": 50, "use_batch_updates": false}"#).unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.delete_batch_size, 300);
        assert!(!config.use_batch_updates);
        assert_eq!(config.update_chunk(), 1);
        assert_eq!(config.insert_chunk(), 50);
    }

    #[test]
    fn test_config_builder_clamps_zero() {
        let config = UnitOfWorkConfig::new().batch_size(0).delete_batch_size(0);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.delete_batch_size, 1);
    }
}
