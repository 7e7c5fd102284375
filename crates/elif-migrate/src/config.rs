//! Migration engine configuration and builder

use serde::{Deserialize, Serialize};
use service_builder::builder;

use crate::diff::SchemaDiffer;

/// Default name of the migration log table
pub const DEFAULT_LOG_TABLE: &str = "elif_schema_migrations";

/// Default prefix of rebuild shadow tables
pub const DEFAULT_SHADOW_PREFIX: &str = "__rebuild_";

/// Default key passed to `pg_advisory_lock` ("elifmigr" in ASCII)
pub const DEFAULT_ADVISORY_LOCK_KEY: i64 = 0x656c_6966_6d69_6772;

/// Configuration for the migration engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[builder]
pub struct MigrateConfig {
    /// Table holding the migration log
    #[builder(default = "DEFAULT_LOG_TABLE.to_string()", getter)]
    pub log_table: String,

    /// Prefix for shadow tables created by the rebuild strategy
    #[builder(default = "DEFAULT_SHADOW_PREFIX.to_string()", getter)]
    pub shadow_prefix: String,

    /// Extra tables the differ never creates, drops or alters
    #[builder(default = "Vec::new()", getter)]
    pub ignored_tables: Vec<String>,

    /// Hold an advisory lock around apply and rollback
    #[builder(default = "true", getter)]
    pub advisory_lock: bool,

    /// Key of the advisory lock
    #[builder(default = "DEFAULT_ADVISORY_LOCK_KEY", getter)]
    pub advisory_lock_key: i64,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            log_table: DEFAULT_LOG_TABLE.to_string(),
            shadow_prefix: DEFAULT_SHADOW_PREFIX.to_string(),
            ignored_tables: Vec::new(),
            advisory_lock: true,
            advisory_lock_key: DEFAULT_ADVISORY_LOCK_KEY,
        }
    }
}

impl MigrateConfig {
    /// Defaults overridden by `ELIF_MIGRATIONS_TABLE` and `ELIF_MIGRATIONS_LOCK`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(table) = std::env::var("ELIF_MIGRATIONS_TABLE") {
            if !table.trim().is_empty() {
                config.log_table = table.trim().to_string();
            }
        }

        if let Ok(lock) = std::env::var("ELIF_MIGRATIONS_LOCK") {
            match lock.trim().to_lowercase().as_str() {
                "0" | "false" | "off" | "no" => config.advisory_lock = false,
                "1" | "true" | "on" | "yes" => config.advisory_lock = true,
                other => tracing::warn!(
                    "Ignoring ELIF_MIGRATIONS_LOCK={}: expected a boolean",
                    other
                ),
            }
        }

        config
    }

    /// Differ that skips the log table, shadow tables and configured tables
    pub fn differ(&self) -> SchemaDiffer {
        let mut differ = SchemaDiffer::new()
            .ignore_table(self.log_table.clone())
            .ignore_prefix(self.shadow_prefix.clone());
        for table in &self.ignored_tables {
            differ = differ.ignore_table(table.clone());
        }
        differ
    }
}

impl MigrateConfigBuilder {
    /// Configuration for tests: no advisory lock
    pub fn testing() -> Self {
        MigrateConfigBuilder::new().advisory_lock(false)
    }

    /// Add one table to the ignored list
    pub fn ignore_table(mut self, table: impl Into<String>) -> Self {
        self.ignored_tables
            .get_or_insert_with(Vec::new)
            .push(table.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MigrateConfig::default();
        assert_eq!(config.log_table, "elif_schema_migrations");
        assert_eq!(config.shadow_prefix, "__rebuild_");
        assert!(config.advisory_lock);
        assert!(config.ignored_tables.is_empty());
    }

    #[test]
    fn test_config_builder() {
        let config = MigrateConfigBuilder::new()
            .log_table("schema_history".to_string())
            .advisory_lock(false)
            .build()
            .expect("Failed to build config");

        assert_eq!(config.get_log_table(), "schema_history");
        assert!(!*config.get_advisory_lock());
        assert_eq!(config.get_shadow_prefix(), "__rebuild_");
    }

    #[test]
    fn test_testing_config() {
        let config = MigrateConfigBuilder::testing()
            .ignore_table("spatial_ref_sys")
            .build()
            .expect("Failed to build config");
        assert!(!*config.get_advisory_lock());
        assert_eq!(config.get_ignored_tables(), &vec!["spatial_ref_sys".to_string()]);
        assert_eq!(*config.get_advisory_lock_key(), DEFAULT_ADVISORY_LOCK_KEY);
    }

    #[test]
    fn test_ignore_table_accumulates() {
        let config = MigrateConfigBuilder::testing()
            .ignore_table("spatial_ref_sys")
            .ignore_table("audit_log")
            .build()
            .expect("Failed to build config");
        assert_eq!(
            config.get_ignored_tables(),
            &vec!["spatial_ref_sys".to_string(), "audit_log".to_string()]
        );

        let current = crate::schema::SchemaSnapshot::new()
            .with_table(crate::schema::TableDefinition::new("spatial_ref_sys", Vec::new()))
            .with_table(crate::schema::TableDefinition::new("audit_log", Vec::new()));
        let operations = config
            .differ()
            .diff(&crate::schema::SchemaSnapshot::new(), &current, &Default::default())
            .unwrap();
        assert!(operations.is_empty());
    }
}
