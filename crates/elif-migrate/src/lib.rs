//! # elif-migrate
//!
//! Schema diff, planning, transactional apply and rollback for the elif.rs
//! framework.
//!
//! ## Features
//!
//! - **Schema diff**: compare a declared schema with the live database, with
//!   explicit table renames
//! - **Dependency-safe planning**: operations are ordered so nothing is
//!   referenced before it exists or after it is gone
//! - **Atomic apply**: one transaction per migration; a failure leaves the
//!   database untouched and nothing logged
//! - **Exact rollback**: inverses come from metadata captured at apply time
//! - **Rebuild strategy**: tables are rebuilt when the dialect cannot alter
//!   them in place (SQLite)
//! - **Backends**: PostgreSQL and SQLite through sqlx, plus an in-memory
//!   database for tests
//!
//! ## Quick Start
//!
//! ```rust
//! use elif_migrate::{
//!     ColumnDefinition, ColumnType, MemoryDatabase, MigrateConfig, Migrator, RenameMap,
//!     SchemaSnapshot, TableDefinition,
//! };
//!
//! # async fn demo() -> elif_migrate::MigrateResult<()> {
//! let target = SchemaSnapshot::new().with_table(TableDefinition::new(
//!     "users",
//!     vec![
//!         ColumnDefinition::new("id", ColumnType::integer()).primary_key(),
//!         ColumnDefinition::new("name", ColumnType::varchar(100)).not_null(),
//!     ],
//! ));
//!
//! let migrator = Migrator::new(MigrateConfig::default());
//! let mut db = MemoryDatabase::postgres();
//!
//! if let Some(migration) = migrator
//!     .autogenerate(&mut db, &target, &RenameMap::new(), "20250101120000", "create users")
//!     .await?
//! {
//!     migrator.apply(&mut db, &migration).await?;
//! }
//!
//! // Undo it again
//! migrator.rollback(&mut db).await?;
//! # Ok(())
//! # }
//! ```

pub mod applier;
pub mod backend;
pub mod config;
pub mod descriptor;
pub mod dialect;
pub mod diff;
pub mod error;
pub mod executor;
pub mod loader;
pub mod log;
pub mod migrator;
pub mod operation;
pub mod planner;
pub mod rollback;
pub mod schema;
pub mod script;

// Re-export core traits and types
pub use applier::{Applier, ApplyReport, DryRunReport};
pub use backend::{Backend, Database, MemoryDatabase, PgDatabase, SqliteDatabase};
pub use config::{MigrateConfig, MigrateConfigBuilder};
pub use descriptor::{MigrationBody, MigrationDescriptor, Plan, ScriptRef};
pub use dialect::{Capabilities, Dialect, PostgresDialect, SqliteDialect, Statement};
pub use diff::{diff_schemas, SchemaDiffer};
pub use error::{BackendError, MigrateError, MigrateResult, SchemaError, StepError};
pub use executor::Executor;
pub use log::{AppliedOperation, MigrationLog, MigrationLogEntry, Strategy};
pub use migrator::{MigrationRunResult, MigrationState, MigrationStatus, Migrator};
pub use operation::{Operation, ScriptDirection};
pub use rollback::{RollbackEngine, RollbackReport};
pub use schema::{
    ColumnDefinition, ColumnType, IndexDefinition, RenameMap, SchemaSnapshot, TableDefinition,
    TypeKind,
};
pub use script::{MigrationScript, ScriptRegistry, SqlScript};
