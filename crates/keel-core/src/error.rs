//! Error types for Keel operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all Keel operations.
#[derive(Debug)]
pub enum Error {
    /// Structural misuse of the unit of work, entities or collections
    Validation(ValidationError),
    /// Version or concurrency-check mismatch
    OptimisticLock(OptimisticLockError),
    /// Missing or inconsistent entity metadata
    Metadata(MetadataError),
    /// Statement execution errors reported by the driver
    Query(QueryError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Custom error with message
    Custom(String),
}

/// Validation error raised for misuse that would break integrity.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// What was violated.
    pub kind: ValidationErrorKind,
    /// Entity the error concerns, when known.
    pub entity: Option<String>,
    /// Property the error concerns, when known.
    pub property: Option<String>,
    /// Human-readable error message.
    pub message: String,
}

/// The kind of misuse a [`ValidationError`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Operation requires a managed entity
    NotManaged,
    /// Collection was marked read-only
    ReadOnlyCollection,
    /// Removing the item would null a non-nullable owning reference
    OrphanRemovalRequired,
    /// Commit requested from inside commit processing
    ReentrantCommit,
    /// Pessimistic lock requested outside a transaction
    TransactionRequired,
    /// A required (non-nullable) value is missing from the payload
    MissingValue,
    /// Entity is managed by a different unit of work
    ForeignSession,
    /// Optimistic lock requested on an entity without a version property
    NotVersioned,
    /// Any other invalid operation
    Invalid,
}

/// Optimistic locking failure for one entity.
#[derive(Debug, Clone)]
pub struct OptimisticLockError {
    /// Entity name.
    pub entity: String,
    /// Serialized primary key of the offending entity (if any).
    pub primary_key: Option<String>,
    /// Version the caller or the change set expected.
    pub expected: Option<Value>,
    /// Version found in the store (if it could be read).
    pub actual: Option<Value>,
    /// Human-readable error message.
    pub message: String,
}

/// Metadata defect. Always a configuration error.
#[derive(Debug, Clone)]
pub struct MetadataError {
    /// Entity the defect was found on.
    pub entity: String,
    /// Human-readable error message.
    pub message: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub entity: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or row not found
    NotFound,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already active
    AlreadyActive,
    /// No transaction is active
    NotActive,
}

impl ValidationError {
    /// Create a validation error of the given kind.
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: None,
            property: None,
            message: message.into(),
        }
    }

    /// Attach the entity name.
    #[must_use]
    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Attach the property name.
    #[must_use]
    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }
}

impl Error {
    /// Shorthand for a [`ValidationError`] wrapped in [`Error`].
    pub fn validation(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Error::Validation(ValidationError::new(kind, message))
    }

    /// Shorthand for a [`MetadataError`] wrapped in [`Error`].
    pub fn metadata(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Metadata(MetadataError {
            entity: entity.into(),
            message: message.into(),
        })
    }

    /// Shorthand for a constraint violation reported by a driver.
    pub fn constraint(
        entity: impl Into<String>,
        sqlstate: &str,
        message: impl Into<String>,
    ) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            entity: Some(entity.into()),
            sqlstate: Some(sqlstate.to_string()),
            message: message.into(),
            source: None,
        })
    }

    /// The validation kind, if this is a validation error.
    pub fn validation_kind(&self) -> Option<ValidationErrorKind> {
        match self {
            Error::Validation(v) => Some(v.kind),
            _ => None,
        }
    }

    /// Is this an optimistic lock failure?
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Is this a metadata defect?
    pub fn is_metadata(&self) -> bool {
        matches!(self, Error::Metadata(_))
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Is this a unique constraint violation reported by the store?
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Error::Query(q) if q.is_unique_violation())
    }

    /// Is this a foreign key violation reported by the store?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self, Error::Query(q) if q.is_foreign_key_violation())
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::OptimisticLock(e) => write!(f, "Optimistic lock error: {}", e),
            Error::Metadata(e) => write!(f, "Metadata error: {}", e),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.entity, &self.property) {
            (Some(entity), Some(prop)) => write!(f, "{}.{}: {}", entity, prop, self.message),
            (Some(entity), None) => write!(f, "{}: {}", entity, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(pk) = &self.primary_key {
            write!(f, " (entity {} [{}]", self.entity, pk)?;
        } else {
            write!(f, " (entity {}", self.entity)?;
        }
        match (&self.expected, &self.actual) {
            (Some(expected), Some(actual)) => {
                write!(f, ", expected version {}, actual {})", expected, actual)
            }
            (Some(expected), None) => write!(f, ", expected version {})", expected),
            _ => write!(f, ")"),
        }
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_helpers() {
        let err = Error::constraint("Author", "23505", "duplicate key");
        assert_eq!(err.sqlstate(), Some("23505"));
        assert!(err.is_unique_violation());
        assert!(!err.is_foreign_key_violation());
        assert!(Error::constraint("Book", "23503", "missing parent").is_foreign_key_violation());
        let Error::Query(query) = err else {
            std::panic::panic_any("expected query error");
        };
        assert!(query.is_unique_violation());
        assert!(!query.is_foreign_key_violation());
    }

    #[test]
    fn optimistic_lock_message_names_entity_and_versions() {
        let err = Error::OptimisticLock(OptimisticLockError {
            entity: "Book".to_string(),
            primary_key: Some("3".to_string()),
            expected: Some(Value::Int(2)),
            actual: Some(Value::Int(5)),
            message: "version mismatch".to_string(),
        });
        let text = err.to_string();
        assert!(text.contains("Book [3]"));
        assert!(text.contains("expected version 2, actual 5"));
        assert!(err.is_optimistic_lock());
    }

    #[test]
    fn validation_display_includes_entity_and_property() {
        let err = ValidationError::new(ValidationErrorKind::MissingValue, "is required")
            .entity("Author")
            .property("name");
        assert_eq!(err.to_string(), "Author.name: is required");
        assert_eq!(
            Error::from(err).validation_kind(),
            Some(ValidationErrorKind::MissingValue)
        );
    }
}
