//! Database backends
//!
//! A backend is one connection to one database: it reads the catalog, runs
//! rendered statements inside an explicit transaction and stores the
//! migration log. The engine threads a `&mut` handle through every call.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use memory::MemoryDatabase;
pub use postgres::PgDatabase;
pub use sqlite::SqliteDatabase;

use async_trait::async_trait;

use crate::dialect::{Dialect, Statement};
use crate::error::BackendError;
use crate::log::MigrationLog;
use crate::schema::SchemaSnapshot;

/// A live database connection the engine can introspect and change
#[async_trait]
pub trait Database: Send {
    /// The SQL dialect statements are rendered with
    fn dialect(&self) -> &'static dyn Dialect;

    /// Introspect every user table, column and index
    async fn read_schema(&mut self) -> Result<SchemaSnapshot, BackendError>;

    async fn begin(&mut self) -> Result<(), BackendError>;

    /// Render and run one statement on the current connection
    async fn execute(&mut self, statement: &Statement) -> Result<(), BackendError>;

    async fn commit(&mut self) -> Result<(), BackendError>;

    async fn rollback(&mut self) -> Result<(), BackendError>;

    /// Take an exclusive, session-level migration lock
    async fn lock(&mut self, _key: i64) -> Result<(), BackendError> {
        Ok(())
    }

    async fn unlock(&mut self, _key: i64) -> Result<(), BackendError> {
        Ok(())
    }
}

/// A database that also stores its own migration log
pub trait Backend: Database + MigrationLog {}

impl<T: Database + MigrationLog> Backend for T {}

/// Render a statement, logging the SQL at debug level
pub(crate) fn render_traced(dialect: &dyn Dialect, statement: &Statement) -> Vec<String> {
    let sql = dialect.render(statement);
    for line in &sql {
        tracing::debug!("Executing: {}", line);
    }
    sql
}
