//! Rollback Engine
//!
//! Undoes the most recently applied migration from the metadata captured
//! when it ran. Inverses are synthesized from the logged reverse payloads,
//! never re-derived from the live schema.

use tokio_util::sync::CancellationToken;

use crate::applier::abort;
use crate::backend::Backend;
use crate::config::MigrateConfig;
use crate::error::{MigrateError, MigrateResult, StepError};
use crate::executor::Executor;
use crate::log::{AppliedOperation, MigrationLogEntry, Strategy};
use crate::script::ScriptRegistry;

/// Result of rolling back one migration
#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub version: String,
    pub description: String,
    /// Number of operations reversed
    pub reverted: usize,
}

/// Pops the tail of the migration log
#[derive(Debug, Clone)]
pub struct RollbackEngine<'a> {
    config: &'a MigrateConfig,
    scripts: &'a ScriptRegistry,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(config: &'a MigrateConfig, scripts: &'a ScriptRegistry) -> Self {
        Self { config, scripts }
    }

    /// Roll back the last applied migration; `Ok(None)` when nothing is applied
    pub async fn rollback<B: Backend>(
        &self,
        db: &mut B,
        cancel: &CancellationToken,
    ) -> MigrateResult<Option<RollbackReport>> {
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        let key = *self.config.get_advisory_lock_key();
        if *self.config.get_advisory_lock() {
            db.lock(key).await.map_err(MigrateError::Transaction)?;
        }

        let result = self.rollback_locked(db, cancel).await;

        if *self.config.get_advisory_lock() {
            if let Err(e) = db.unlock(key).await {
                tracing::warn!("Failed to release migration lock: {}", e);
            }
        }
        result
    }

    async fn rollback_locked<B: Backend>(
        &self,
        db: &mut B,
        cancel: &CancellationToken,
    ) -> MigrateResult<Option<RollbackReport>> {
        db.ensure_storage().await.map_err(MigrateError::Log)?;
        let Some(entry) = db.last().await.map_err(MigrateError::Log)? else {
            tracing::info!("Nothing to roll back");
            return Ok(None);
        };

        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        tracing::info!(
            "Rolling back migration {} - {} ({} operations)",
            entry.version,
            entry.description,
            entry.operations.len()
        );
        db.begin().await.map_err(MigrateError::Transaction)?;

        if let Err(e) = self.revert_all(db, &entry).await {
            tracing::error!("Rollback of migration {} failed: {}", entry.version, e);
            abort(db).await;
            return Err(e);
        }

        db.commit().await.map_err(MigrateError::Transaction)?;
        db.pop(&entry.version).await.map_err(MigrateError::Log)?;

        tracing::info!("Rolled back migration {}", entry.version);
        Ok(Some(RollbackReport {
            version: entry.version,
            description: entry.description,
            reverted: entry.operations.len(),
        }))
    }

    async fn revert_all<B: Backend>(&self, db: &mut B, entry: &MigrationLogEntry) -> MigrateResult<()> {
        let executor = Executor::new(db.dialect(), self.config.get_shadow_prefix(), self.scripts);
        for applied in entry.operations.iter().rev() {
            revert(&executor, db, applied)
                .await
                .map_err(|(operation, source)| MigrateError::Rollback {
                    version: entry.version.clone(),
                    operation,
                    source,
                })?;
        }
        Ok(())
    }
}

/// Undo one applied operation; on failure returns the inverse that failed
async fn revert<B: Backend>(
    executor: &Executor<'_>,
    db: &mut B,
    applied: &AppliedOperation,
) -> Result<(), (String, StepError)> {
    match (applied.strategy, &applied.rebuilt_from) {
        (Strategy::Rebuild, Some(original)) => {
            let description = format!("rebuild table {} to its prior definition", original.name);
            executor
                .rebuild_to(db, original)
                .await
                .map_err(|e| (description, e))
        }
        (Strategy::Rebuild, None) => Err((
            applied.operation.to_string(),
            StepError::Precondition("rebuilt operation has no recorded table definition".to_string()),
        )),
        (Strategy::InPlace, _) => {
            let inverse = applied
                .operation
                .inverse()
                .map_err(|e| (applied.operation.to_string(), StepError::Schema(e)))?;
            executor
                .execute(db, &inverse)
                .await
                .map(|_| ())
                .map_err(|e| (inverse.to_string(), e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryDatabase;
    use crate::log::MigrationLog;
    use crate::operation::Operation;

    #[tokio::test]
    async fn test_empty_log_is_not_an_error() {
        let config = MigrateConfig::default();
        let scripts = ScriptRegistry::new();
        let engine = RollbackEngine::new(&config, &scripts);
        let mut db = MemoryDatabase::postgres();

        let report = engine.rollback(&mut db, &CancellationToken::new()).await.unwrap();
        assert!(report.is_none());
        assert!(!db.is_locked());
    }

    #[tokio::test]
    async fn test_rebuild_without_original_is_refused() {
        let config = MigrateConfig::default();
        let scripts = ScriptRegistry::new();
        let engine = RollbackEngine::new(&config, &scripts);
        let mut db = MemoryDatabase::sqlite();

        let mut applied = AppliedOperation::in_place(Operation::RenameTable {
            from: "a".to_string(),
            to: "b".to_string(),
        });
        applied.strategy = Strategy::Rebuild;
        db.append(&MigrationLogEntry::new("1", "broken", "x", vec![applied]))
            .await
            .unwrap();

        let err = engine.rollback(&mut db, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MigrateError::Rollback { .. }));
        assert_eq!(db.entries().await.unwrap().len(), 1);
        assert!(!db.in_transaction());
    }
}
