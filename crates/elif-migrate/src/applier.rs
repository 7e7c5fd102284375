//! Applier
//!
//! Runs a planned operation sequence inside one transaction. Either every
//! operation commits and one log entry is appended, or the transaction is
//! aborted and nothing persists. Dry-run produces the SQL and the resulting
//! schema without touching the database.

use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, Database};
use crate::config::MigrateConfig;
use crate::descriptor::Plan;
use crate::error::{MigrateError, MigrateResult};
use crate::executor::Executor;
use crate::log::{AppliedOperation, MigrationLog, MigrationLogEntry};
use crate::operation::Operation;
use crate::schema::SchemaSnapshot;
use crate::script::ScriptRegistry;

/// Result of applying one migration
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub version: String,
    pub applied: Vec<AppliedOperation>,
    pub execution_time_ms: u128,
}

/// Result of a dry run
#[derive(Debug, Clone)]
pub struct DryRunReport {
    pub version: String,
    /// Operations with reverse payloads as they would be logged
    pub operations: Vec<Operation>,
    /// Rendered SQL in execution order
    pub statements: Vec<String>,
    /// Schema after the plan
    pub schema: SchemaSnapshot,
}

/// Transactional plan runner
#[derive(Debug, Clone)]
pub struct Applier<'a> {
    config: &'a MigrateConfig,
    scripts: &'a ScriptRegistry,
}

impl<'a> Applier<'a> {
    pub fn new(config: &'a MigrateConfig, scripts: &'a ScriptRegistry) -> Self {
        Self { config, scripts }
    }

    /// Apply a plan atomically and log it
    pub async fn apply<B: Backend>(
        &self,
        db: &mut B,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> MigrateResult<ApplyReport> {
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        let key = *self.config.get_advisory_lock_key();
        if *self.config.get_advisory_lock() {
            db.lock(key).await.map_err(MigrateError::Transaction)?;
        }

        let result = self.apply_locked(db, plan, cancel).await;

        if *self.config.get_advisory_lock() {
            if let Err(e) = db.unlock(key).await {
                tracing::warn!("Failed to release migration lock: {}", e);
            }
        }
        result
    }

    async fn apply_locked<B: Backend>(
        &self,
        db: &mut B,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> MigrateResult<ApplyReport> {
        let start_time = Instant::now();

        // Ensure the log exists and the version is new
        db.ensure_storage().await.map_err(MigrateError::Log)?;
        check_version(db, plan).await?;

        // Last point where cancellation is honoured
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        tracing::info!(
            "Applying migration {} - {} ({} operations)",
            plan.version,
            plan.description,
            plan.len()
        );
        db.begin().await.map_err(MigrateError::Transaction)?;

        let executor = Executor::new(db.dialect(), self.config.get_shadow_prefix(), self.scripts);
        let total = plan.len();
        let mut applied = Vec::with_capacity(total);

        for (index, operation) in plan.steps.iter().enumerate() {
            match executor.execute(db, operation).await {
                Ok(done) => applied.push(done),
                Err(source) => {
                    tracing::error!(
                        "Migration {} failed at operation {} of {} ({}): {}",
                        plan.version,
                        index + 1,
                        total,
                        operation,
                        source
                    );
                    abort(db).await;
                    return Err(MigrateError::Execution {
                        version: plan.version.clone(),
                        index: index + 1,
                        total,
                        operation: operation.to_string(),
                        source,
                    });
                }
            }
        }

        db.commit().await.map_err(MigrateError::Transaction)?;

        // Record migration as applied
        let entry = MigrationLogEntry::new(
            plan.version.clone(),
            plan.description.clone(),
            plan.checksum.clone(),
            applied,
        );
        if let Err(e) = db.append(&entry).await {
            tracing::error!(
                "Migration {} was committed but could not be logged: {}",
                plan.version,
                e
            );
            return Err(MigrateError::Log(e));
        }

        let execution_time_ms = start_time.elapsed().as_millis();
        tracing::info!("Applied migration {} in {}ms", plan.version, execution_time_ms);

        Ok(ApplyReport {
            version: entry.version,
            applied: entry.operations,
            execution_time_ms,
        })
    }

    /// Produce the statements and resulting schema without changing anything
    pub async fn dry_run<D: Database>(&self, db: &mut D, plan: &Plan) -> MigrateResult<DryRunReport> {
        let mut schema = db.read_schema().await.map_err(MigrateError::SchemaRead)?;
        let executor = Executor::new(db.dialect(), self.config.get_shadow_prefix(), self.scripts);
        let dialect = executor.dialect();
        let total = plan.len();

        let mut operations = Vec::with_capacity(total);
        let mut statements = Vec::new();
        for (index, operation) in plan.steps.iter().enumerate() {
            let planning_error = |reason: String| {
                MigrateError::Planning(format!(
                    "operation {} of {} ({}): {}",
                    index + 1,
                    total,
                    operation,
                    reason
                ))
            };

            let operation = executor
                .capture(operation, &schema)
                .map_err(|e| planning_error(e.to_string()))?;
            for statement in executor
                .statements(&operation, &schema)
                .map_err(|e| planning_error(e.to_string()))?
            {
                statements.extend(dialect.render(&statement));
            }
            schema
                .apply(&operation)
                .map_err(|e| planning_error(e.to_string()))?;
            operations.push(operation);
        }

        Ok(DryRunReport {
            version: plan.version.clone(),
            operations,
            statements,
            schema,
        })
    }
}

/// Reject versions that are logged already or not newer than the log tail
async fn check_version<L: MigrationLog>(log: &mut L, plan: &Plan) -> MigrateResult<()> {
    let entries = log.entries().await.map_err(MigrateError::Log)?;

    if let Some(logged) = entries.iter().find(|e| e.version == plan.version) {
        if logged.checksum != plan.checksum {
            return Err(MigrateError::ChecksumMismatch {
                version: plan.version.clone(),
                logged: logged.checksum.clone(),
                current: plan.checksum.clone(),
            });
        }
        return Err(MigrateError::AlreadyApplied(plan.version.clone()));
    }

    if let Some(tail) = entries.last() {
        if tail.version.as_str() > plan.version.as_str() {
            return Err(MigrateError::Planning(format!(
                "migration {} is older than the last applied migration {}",
                plan.version, tail.version
            )));
        }
    }
    Ok(())
}

/// Abort the open transaction; a failed abort is logged, never returned
pub(crate) async fn abort<D: Database>(db: &mut D) {
    if let Err(e) = db.rollback().await {
        tracing::error!("Failed to abort migration transaction: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryDatabase;
    use crate::config::MigrateConfigBuilder;
    use crate::descriptor::MigrationDescriptor;
    use crate::planner;
    use crate::schema::{ColumnDefinition, ColumnType, TableDefinition};

    fn users() -> TableDefinition {
        TableDefinition::new(
            "users",
            vec![
                ColumnDefinition::new("id", ColumnType::integer()).primary_key(),
                ColumnDefinition::new("name", ColumnType::varchar(100)).not_null(),
            ],
        )
    }

    fn create_users(version: &str) -> Plan {
        let descriptor = MigrationDescriptor::declarative(
            version,
            "create users",
            vec![Operation::CreateTable { table: users() }],
        );
        planner::resolve(&descriptor, &ScriptRegistry::new()).unwrap()
    }

    #[tokio::test]
    async fn test_apply_logs_entry_and_releases_lock() {
        let config = MigrateConfig::default();
        let scripts = ScriptRegistry::new();
        let applier = Applier::new(&config, &scripts);
        let mut db = MemoryDatabase::postgres();

        let report = applier
            .apply(&mut db, &create_users("1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.applied.len(), 1);
        assert!(db.schema().contains("users"));
        assert_eq!(db.entries().await.unwrap().len(), 1);
        assert!(!db.is_locked());
        assert!(!db.in_transaction());
    }

    #[tokio::test]
    async fn test_configured_lock_key_and_shadow_prefix_are_used() {
        let config = MigrateConfigBuilder::new()
            .advisory_lock_key(42)
            .shadow_prefix("__tmp_".to_string())
            .build()
            .expect("Failed to build config");
        let scripts = ScriptRegistry::new();
        let applier = Applier::new(&config, &scripts);
        let mut db = MemoryDatabase::sqlite().with_schema(SchemaSnapshot::new().with_table(
            TableDefinition::new(
                "users",
                vec![
                    ColumnDefinition::new("id", ColumnType::integer()).primary_key(),
                    ColumnDefinition::new("email", ColumnType::text()),
                ],
            ),
        ));

        let descriptor = MigrationDescriptor::declarative(
            "1",
            "drop email",
            vec![Operation::DropColumn {
                table: "users".to_string(),
                column: "email".to_string(),
                reverse: None,
            }],
        );
        let plan = planner::resolve(&descriptor, &scripts).unwrap();
        applier
            .apply(&mut db, &plan, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(db.lock_keys(), &[42]);
        assert!(db
            .journal()
            .iter()
            .any(|sql| sql.starts_with(r#"CREATE TABLE "__tmp_users""#)));
        assert!(!db.schema().contains("__tmp_users"));
    }

    #[tokio::test]
    async fn test_reapplying_a_version_is_rejected() {
        let config = MigrateConfig::default();
        let scripts = ScriptRegistry::new();
        let applier = Applier::new(&config, &scripts);
        let mut db = MemoryDatabase::postgres();
        let token = CancellationToken::new();

        applier.apply(&mut db, &create_users("2"), &token).await.unwrap();

        let err = applier.apply(&mut db, &create_users("2"), &token).await.unwrap_err();
        assert!(matches!(err, MigrateError::AlreadyApplied(v) if v == "2"));

        let mut changed = create_users("2");
        changed.checksum = "different".to_string();
        let err = applier.apply(&mut db, &changed, &token).await.unwrap_err();
        assert!(matches!(err, MigrateError::ChecksumMismatch { .. }));

        let err = applier.apply(&mut db, &create_users("1"), &token).await.unwrap_err();
        assert!(matches!(err, MigrateError::Planning(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_begin() {
        let config = MigrateConfig::default();
        let scripts = ScriptRegistry::new();
        let applier = Applier::new(&config, &scripts);
        let mut db = MemoryDatabase::postgres();
        let token = CancellationToken::new();
        token.cancel();

        let err = applier.apply(&mut db, &create_users("1"), &token).await.unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
        assert!(db.journal().is_empty());
        assert!(db.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_leaves_database_untouched() {
        let config = MigrateConfig::default();
        let scripts = ScriptRegistry::new();
        let applier = Applier::new(&config, &scripts);
        let mut db = MemoryDatabase::postgres();

        let report = applier.dry_run(&mut db, &create_users("1")).await.unwrap();

        assert_eq!(
            report.statements,
            vec![r#"CREATE TABLE "users" ("id" INTEGER PRIMARY KEY NOT NULL, "name" VARCHAR(100) NOT NULL)"#]
        );
        assert_eq!(report.schema.table("users"), Some(&users()));
        assert!(db.schema().is_empty());
        assert!(db.journal().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_reports_schema_read_failure() {
        let config = MigrateConfig::default();
        let scripts = ScriptRegistry::new();
        let applier = Applier::new(&config, &scripts);
        let mut db = MemoryDatabase::postgres();
        db.fail_schema_reads(true);

        let err = applier.dry_run(&mut db, &create_users("1")).await.unwrap_err();
        assert!(matches!(err, MigrateError::SchemaRead(_)));
    }
}
