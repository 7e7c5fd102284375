//! Migration Log
//!
//! Append-only record of applied operation batches. Each entry stores the
//! operations exactly as executed, reverse payloads filled, so rollback never
//! has to re-derive an inverse from a schema that may have drifted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::operation::Operation;
use crate::schema::TableDefinition;

/// How the executor carried out an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Native DDL on the live table
    InPlace,
    /// Shadow table, row copy, swap
    Rebuild,
}

/// One operation as it was executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOperation {
    pub operation: Operation,
    pub strategy: Strategy,
    /// Complete table definition before a rebuild; rollback rebuilds back to it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuilt_from: Option<TableDefinition>,
}

impl AppliedOperation {
    pub fn in_place(operation: Operation) -> Self {
        Self {
            operation,
            strategy: Strategy::InPlace,
            rebuilt_from: None,
        }
    }

    pub fn rebuilt(operation: Operation, original: TableDefinition) -> Self {
        Self {
            operation,
            strategy: Strategy::Rebuild,
            rebuilt_from: Some(original),
        }
    }

    /// A log record must be reversible on its own
    pub fn is_reversible(&self) -> bool {
        match self.strategy {
            Strategy::InPlace => self.operation.has_reverse_payload(),
            Strategy::Rebuild => self.rebuilt_from.is_some(),
        }
    }
}

/// One applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationLogEntry {
    pub version: String,
    pub description: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
    pub operations: Vec<AppliedOperation>,
}

impl MigrationLogEntry {
    pub fn new(
        version: impl Into<String>,
        description: impl Into<String>,
        checksum: impl Into<String>,
        operations: Vec<AppliedOperation>,
    ) -> Self {
        Self {
            version: version.into(),
            description: description.into(),
            applied_at: Utc::now(),
            checksum: checksum.into(),
            operations,
        }
    }

    /// JSON payload stored next to the scalar columns
    pub fn payload(&self) -> Result<String, BackendError> {
        Ok(serde_json::to_string(&self.operations)?)
    }

    /// Rebuild an entry from a stored record
    pub fn from_record(
        version: String,
        description: String,
        applied_at: &str,
        checksum: String,
        payload: &str,
    ) -> Result<Self, BackendError> {
        let applied_at = DateTime::parse_from_rfc3339(applied_at)
            .map_err(|e| {
                BackendError::Rejected(format!(
                    "invalid applied_at '{}' for migration {}: {}",
                    applied_at, version, e
                ))
            })?
            .with_timezone(&Utc);
        Ok(Self {
            version,
            description,
            applied_at,
            checksum,
            operations: serde_json::from_str(payload)?,
        })
    }
}

/// Persistent, strictly ordered migration log
#[async_trait]
pub trait MigrationLog: Send {
    /// Create the log storage if it does not exist
    async fn ensure_storage(&mut self) -> Result<(), BackendError>;

    /// All entries, oldest first
    async fn entries(&mut self) -> Result<Vec<MigrationLogEntry>, BackendError>;

    /// The most recent entry
    async fn last(&mut self) -> Result<Option<MigrationLogEntry>, BackendError> {
        Ok(self.entries().await?.pop())
    }

    async fn append(&mut self, entry: &MigrationLogEntry) -> Result<(), BackendError>;

    /// Remove the entry with this version; it must be the tail
    async fn pop(&mut self, version: &str) -> Result<(), BackendError>;
}
