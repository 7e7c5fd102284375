//! Diff Engine
//!
//! Compares a declared target snapshot with an introspected current snapshot
//! and emits the unordered set of operations needed to go from one to the
//! other. Ordering is the planner's job.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{MigrateError, MigrateResult};
use crate::operation::Operation;
use crate::schema::{RenameMap, SchemaSnapshot, TableDefinition};

/// Schema differ with a set of internal tables it never touches
#[derive(Debug, Clone, Default)]
pub struct SchemaDiffer {
    ignored: BTreeSet<String>,
    ignored_prefix: Option<String>,
}

impl SchemaDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never create, drop or alter this table (e.g. the migration log)
    pub fn ignore_table(mut self, table: impl Into<String>) -> Self {
        self.ignored.insert(table.into());
        self
    }

    /// Never touch tables whose name starts with this prefix
    pub fn ignore_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ignored_prefix = Some(prefix.into());
        self
    }

    /// Compute the operations turning `current` into `target`
    pub fn diff(
        &self,
        target: &SchemaSnapshot,
        current: &SchemaSnapshot,
        renames: &RenameMap,
    ) -> MigrateResult<Vec<Operation>> {
        renames
            .validate()
            .map_err(|e| MigrateError::Planning(e.to_string()))?;

        let target = self.visible(target);
        let current = self.visible(current);
        let mut operations = Vec::new();

        // new name -> old name for renames that apply to this pair of snapshots
        let mut renamed_from: BTreeMap<&str, &str> = BTreeMap::new();
        for (old, new) in renames.iter() {
            if !current.contains(old) || !target.contains(new) {
                continue;
            }
            if current.contains(new) {
                return Err(MigrateError::Planning(format!(
                    "cannot rename '{}' to '{}': '{}' already exists",
                    old, new, new
                )));
            }
            operations.push(Operation::RenameTable {
                from: old.clone(),
                to: new.clone(),
            });
            renamed_from.insert(new.as_str(), old.as_str());
        }

        // A renamed-away name declared again in the target is a new table
        let consumed: BTreeSet<&str> = renamed_from.values().copied().collect();
        for table in target.tables() {
            let existing = match renamed_from.get(table.name.as_str()) {
                Some(source) => current.table(source),
                None if consumed.contains(table.name.as_str()) => None,
                None => current.table(&table.name),
            };
            match existing {
                Some(existing) => {
                    let existing = existing.clone().renamed(&table.name);
                    diff_columns(table, &existing, &mut operations);
                    diff_indexes(table, &existing, &mut operations);
                }
                None => operations.push(Operation::CreateTable {
                    table: table.clone().normalized(),
                }),
            }
        }

        for table in current.tables() {
            if !target.contains(&table.name) && !consumed.contains(table.name.as_str()) {
                operations.push(Operation::DropTable {
                    table: table.name.clone(),
                    reverse: Some(table.clone()),
                });
            }
        }

        tracing::debug!("Schema diff produced {} operation(s)", operations.len());
        Ok(operations)
    }

    fn visible(&self, snapshot: &SchemaSnapshot) -> SchemaSnapshot {
        let snapshot = snapshot.without(&self.ignored);
        match &self.ignored_prefix {
            Some(prefix) => snapshot.without_prefix(prefix),
            None => snapshot,
        }
    }
}

/// Diff with no ignored tables
pub fn diff_schemas(
    target: &SchemaSnapshot,
    current: &SchemaSnapshot,
    renames: &RenameMap,
) -> MigrateResult<Vec<Operation>> {
    SchemaDiffer::new().diff(target, current, renames)
}

fn diff_columns(target: &TableDefinition, current: &TableDefinition, out: &mut Vec<Operation>) {
    for column in &target.columns {
        match current.column(&column.name) {
            None => out.push(Operation::AddColumn {
                table: target.name.clone(),
                column: column.clone(),
            }),
            Some(existing) if existing != column => out.push(Operation::AlterColumn {
                table: target.name.clone(),
                column: column.clone(),
                reverse: Some(existing.clone()),
            }),
            Some(_) => {}
        }
    }

    for column in &current.columns {
        if !target.has_column(&column.name) {
            out.push(Operation::DropColumn {
                table: target.name.clone(),
                column: column.name.clone(),
                reverse: Some(column.clone()),
            });
        }
    }
}

fn diff_indexes(target: &TableDefinition, current: &TableDefinition, out: &mut Vec<Operation>) {
    for index in &target.indexes {
        let mut wanted = index.clone();
        wanted.table = target.name.clone();
        match current.index(&index.name) {
            None => out.push(Operation::AddIndex { index: wanted }),
            Some(existing) if existing.columns != wanted.columns || existing.unique != wanted.unique => {
                // Indexes are never altered in place
                out.push(Operation::DropIndex {
                    table: target.name.clone(),
                    name: existing.name.clone(),
                    reverse: Some(existing.clone()),
                });
                out.push(Operation::AddIndex { index: wanted });
            }
            Some(_) => {}
        }
    }

    for index in &current.indexes {
        if target.index(&index.name).is_none() {
            out.push(Operation::DropIndex {
                table: target.name.clone(),
                name: index.name.clone(),
                reverse: Some(index.clone()),
            });
        }
    }
}
