//! Error types for the migration engine
//!
//! Errors are layered: the schema model reports [`SchemaError`], backends
//! report [`BackendError`], the executor wraps both in [`StepError`], and the
//! applier and rollback engine attach batch context in [`MigrateError`].

use thiserror::Error;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// A schema or operation that does not fit the model it is checked against
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("table '{0}' does not exist")]
    MissingTable(String),

    #[error("table '{0}' already exists")]
    TableExists(String),

    #[error("table '{table}' is registered under '{key}'")]
    MisregisteredTable { table: String, key: String },

    #[error("column '{table}.{column}' does not exist")]
    MissingColumn { table: String, column: String },

    #[error("column '{table}.{column}' already exists")]
    ColumnExists { table: String, column: String },

    #[error("duplicate column '{column}' in table '{table}'")]
    DuplicateColumn { table: String, column: String },

    #[error("column '{table}.{column}' is still referenced by index '{index}'")]
    ColumnIndexed {
        table: String,
        column: String,
        index: String,
    },

    #[error("index '{index}' does not exist on '{table}'")]
    MissingIndex { table: String, index: String },

    #[error("index '{index}' already exists on '{table}'")]
    IndexExists { table: String, index: String },

    #[error("duplicate index '{index}' on table '{table}'")]
    DuplicateIndex { table: String, index: String },

    #[error("index '{index}' references unknown column '{table}.{column}'")]
    UnknownIndexColumn {
        index: String,
        table: String,
        column: String,
    },

    #[error("primary key of table '{0}' does not match its column flags")]
    PrimaryKeyMismatch(String),

    #[error("table '{0}' is renamed to itself")]
    SelfRename(String),

    #[error("more than one table is renamed to '{0}'")]
    RenameCollision(String),

    #[error("rename target '{0}' is itself renamed; chained renames are ambiguous")]
    ChainedRename(String),

    /// The operation dropped something without recording what it was
    #[error("{0} has no captured reverse payload")]
    MissingReverse(String),
}

/// Errors raised by a database backend or migration log store
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend refused a statement (used by backends without a driver error type)
    #[error("{0}")]
    Rejected(String),
}

/// Failure of a single operation inside a batch
#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The live schema does not allow the operation (missing table, column, index...)
    #[error("{0}")]
    Precondition(String),
}

/// Top-level error type for diff, planning, apply and rollback
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Catalog introspection failed; raised before any transaction opens
    #[error("Failed to read database schema: {0}")]
    SchemaRead(#[source] BackendError),

    /// The operation set cannot be ordered or simulated consistently
    #[error("Planning error: {0}")]
    Planning(String),

    /// A statement failed mid-batch; the transaction was aborted
    #[error(
        "Migration {version} failed at operation {index} of {total} ({operation}), nothing applied: {source}"
    )]
    Execution {
        version: String,
        index: usize,
        total: usize,
        operation: String,
        #[source]
        source: StepError,
    },

    /// An inverse statement failed; the transaction was aborted and the log entry kept
    #[error("Rollback of migration {version} failed at inverse operation {operation}, log entry preserved: {source}")]
    Rollback {
        version: String,
        operation: String,
        #[source]
        source: StepError,
    },

    #[error("Transaction error: {0}")]
    Transaction(#[source] BackendError),

    #[error("Migration log error: {0}")]
    Log(#[source] BackendError),

    #[error("Migration {0} is already applied")]
    AlreadyApplied(String),

    #[error("Migration {version} was modified after it was applied (logged checksum {logged}, descriptor checksum {current})")]
    ChecksumMismatch {
        version: String,
        logged: String,
        current: String,
    },

    /// A migration descriptor or rename map could not be loaded
    #[error("Descriptor error: {0}")]
    Descriptor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Cancellation was requested before the transaction began
    #[error("Migration cancelled before the transaction started")]
    Cancelled,
}

impl MigrateError {
    /// Whether the error was raised before anything touched the database
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            MigrateError::SchemaRead(_)
                | MigrateError::Planning(_)
                | MigrateError::AlreadyApplied(_)
                | MigrateError::ChecksumMismatch { .. }
                | MigrateError::Descriptor(_)
                | MigrateError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_message() {
        let err = MigrateError::Execution {
            version: "20250101120000".to_string(),
            index: 2,
            total: 3,
            operation: "add column users.email".to_string(),
            source: StepError::Precondition("table users does not exist".to_string()),
        };

        let msg = err.to_string();
        assert!(msg.contains("failed at operation 2 of 3"));
        assert!(msg.contains("nothing applied"));
        assert!(msg.contains("table users does not exist"));
        assert!(!err.is_pre_execution());
    }

    #[test]
    fn test_schema_error_messages() {
        let err = SchemaError::ColumnIndexed {
            table: "users".to_string(),
            column: "email".to_string(),
            index: "idx_users_email".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "column 'users.email' is still referenced by index 'idx_users_email'"
        );

        let step = StepError::from(SchemaError::MissingTable("ghosts".to_string()));
        assert!(matches!(step, StepError::Schema(SchemaError::MissingTable(ref t)) if t == "ghosts"));
        assert_eq!(step.to_string(), "table 'ghosts' does not exist");
    }

    #[test]
    fn test_pre_execution_errors() {
        assert!(MigrateError::Planning("conflict".to_string()).is_pre_execution());
        assert!(MigrateError::Cancelled.is_pre_execution());
        assert!(MigrateError::SchemaRead(BackendError::Rejected("down".to_string())).is_pre_execution());
    }
}
