//! Migrator
//!
//! Entry point tying the engine together: autogenerate a migration from a
//! target schema, resolve and apply descriptors, dry-run, roll back and
//! report status.

use chrono::{DateTime, Utc};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::applier::{Applier, ApplyReport, DryRunReport};
use crate::backend::{Backend, Database};
use crate::config::MigrateConfig;
use crate::descriptor::{MigrationDescriptor, Plan};
use crate::error::{MigrateError, MigrateResult};
use crate::log::MigrationLog;
use crate::operation::Operation;
use crate::planner;
use crate::rollback::{RollbackEngine, RollbackReport};
use crate::schema::{RenameMap, SchemaSnapshot};
use crate::script::ScriptRegistry;

/// Status of a migration against the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Not yet applied
    Pending,
    /// Applied with the same content
    Applied { applied_at: DateTime<Utc> },
    /// Applied, but the descriptor changed since
    Drifted {
        applied_at: DateTime<Utc>,
        logged_checksum: String,
    },
}

/// One descriptor and its status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationState {
    pub version: String,
    pub description: String,
    pub status: MigrationStatus,
}

/// Result of applying every pending migration
#[derive(Debug, Clone)]
pub struct MigrationRunResult {
    pub applied: Vec<ApplyReport>,
    /// Number of migrations already applied
    pub skipped_count: usize,
    pub execution_time_ms: u128,
}

/// Schema migration facade
#[derive(Debug, Clone, Default)]
pub struct Migrator {
    config: MigrateConfig,
    scripts: ScriptRegistry,
    cancel: CancellationToken,
}

impl Migrator {
    pub fn new(config: MigrateConfig) -> Self {
        Self {
            config,
            scripts: ScriptRegistry::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_scripts(mut self, scripts: ScriptRegistry) -> Self {
        self.scripts = scripts;
        self
    }

    /// Token checked before each migration's transaction starts
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &MigrateConfig {
        &self.config
    }

    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Unordered operations turning `current` into `target`
    pub fn diff(
        &self,
        target: &SchemaSnapshot,
        current: &SchemaSnapshot,
        renames: &RenameMap,
    ) -> MigrateResult<Vec<Operation>> {
        self.config.differ().diff(target, current, renames)
    }

    /// Diff the live schema against `target` and plan the result into a
    /// declarative descriptor; `None` when the schema already matches
    pub async fn autogenerate<D: Database>(
        &self,
        db: &mut D,
        target: &SchemaSnapshot,
        renames: &RenameMap,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> MigrateResult<Option<MigrationDescriptor>> {
        target
            .validate()
            .map_err(|e| MigrateError::Planning(e.to_string()))?;
        let current = db.read_schema().await.map_err(MigrateError::SchemaRead)?;

        let operations = self.diff(target, &current, renames)?;
        if operations.is_empty() {
            tracing::info!("Schema is up to date, nothing to generate");
            return Ok(None);
        }

        let ordered = planner::order(operations)?;
        tracing::info!("Generated migration with {} operations", ordered.len());
        Ok(Some(MigrationDescriptor::declarative(version, description, ordered)))
    }

    /// Resolve a descriptor into an ordered plan
    pub fn plan(&self, descriptor: &MigrationDescriptor) -> MigrateResult<Plan> {
        planner::resolve(descriptor, &self.scripts)
    }

    pub async fn apply<B: Backend>(
        &self,
        db: &mut B,
        descriptor: &MigrationDescriptor,
    ) -> MigrateResult<ApplyReport> {
        let plan = self.plan(descriptor)?;
        Applier::new(&self.config, &self.scripts)
            .apply(db, &plan, &self.cancel)
            .await
    }

    /// Apply every descriptor not yet logged, oldest first
    pub async fn apply_pending<B: Backend>(
        &self,
        db: &mut B,
        descriptors: &[MigrationDescriptor],
    ) -> MigrateResult<MigrationRunResult> {
        let start_time = Instant::now();
        let states = self.status(db, descriptors).await?;

        if let Some(drifted) = states
            .iter()
            .find(|s| matches!(s.status, MigrationStatus::Drifted { .. }))
        {
            return Err(MigrateError::Planning(format!(
                "migration {} was modified after it was applied",
                drifted.version
            )));
        }

        let mut pending: Vec<&MigrationDescriptor> = descriptors
            .iter()
            .filter(|d| {
                states
                    .iter()
                    .any(|s| s.version == d.version && s.status == MigrationStatus::Pending)
            })
            .collect();
        pending.sort_by(|a, b| a.version.cmp(&b.version));

        let mut applied = Vec::with_capacity(pending.len());
        for descriptor in pending {
            applied.push(self.apply(db, descriptor).await?);
        }

        Ok(MigrationRunResult {
            skipped_count: states.len() - applied.len(),
            applied,
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }

    pub async fn dry_run<D: Database>(
        &self,
        db: &mut D,
        descriptor: &MigrationDescriptor,
    ) -> MigrateResult<DryRunReport> {
        let plan = self.plan(descriptor)?;
        Applier::new(&self.config, &self.scripts)
            .dry_run(db, &plan)
            .await
    }

    /// Roll back the most recent migration
    pub async fn rollback<B: Backend>(&self, db: &mut B) -> MigrateResult<Option<RollbackReport>> {
        RollbackEngine::new(&self.config, &self.scripts)
            .rollback(db, &self.cancel)
            .await
    }

    /// Status of each descriptor, in version order
    pub async fn status<L: MigrationLog>(
        &self,
        log: &mut L,
        descriptors: &[MigrationDescriptor],
    ) -> MigrateResult<Vec<MigrationState>> {
        log.ensure_storage().await.map_err(MigrateError::Log)?;
        let entries = log.entries().await.map_err(MigrateError::Log)?;

        let mut states: Vec<MigrationState> = descriptors
            .iter()
            .map(|descriptor| {
                let status = match entries.iter().find(|e| e.version == descriptor.version) {
                    None => MigrationStatus::Pending,
                    Some(entry) if entry.checksum == descriptor.checksum() => MigrationStatus::Applied {
                        applied_at: entry.applied_at,
                    },
                    Some(entry) => MigrationStatus::Drifted {
                        applied_at: entry.applied_at,
                        logged_checksum: entry.checksum.clone(),
                    },
                };
                MigrationState {
                    version: descriptor.version.clone(),
                    description: descriptor.description.clone(),
                    status,
                }
            })
            .collect();
        states.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(states)
    }
}
