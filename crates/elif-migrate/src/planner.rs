//! Planner
//!
//! Orders an unordered operation set into a sequence that never references
//! an object before it exists or after it is gone, and resolves migration
//! descriptors into the same sequence form.

use std::collections::{BTreeMap, BTreeSet};

use crate::descriptor::{MigrationBody, MigrationDescriptor, Plan};
use crate::error::{MigrateError, MigrateResult};
use crate::operation::{Operation, ScriptDirection};
use crate::script::ScriptRegistry;

/// Execution phase of an operation, lowest first
fn phase(operation: &Operation, batch: &BatchFacts) -> u8 {
    match operation {
        Operation::RenameTable { .. } => 1,
        Operation::DropIndex { .. } if batch.drops_early(operation) => 2,
        Operation::CreateTable { .. } => 3,
        Operation::AddColumn { .. } => 4,
        Operation::AlterColumn { .. } => 5,
        Operation::AddIndex { .. } => 6,
        Operation::DropIndex { .. } => 7,
        Operation::DropColumn { .. } => 8,
        Operation::DropTable { .. } => 9,
        Operation::RunScript { .. } => 10,
    }
}

/// What the batch drops and re-creates, for placing index drops
#[derive(Default)]
struct BatchFacts {
    dropped_tables: BTreeSet<String>,
    dropped_columns: BTreeMap<String, BTreeSet<String>>,
    added_indexes: BTreeSet<(String, String)>,
}

impl BatchFacts {
    fn collect(operations: &[Operation]) -> Self {
        let mut facts = Self::default();
        for operation in operations {
            match operation {
                Operation::DropTable { table, .. } => {
                    facts.dropped_tables.insert(table.clone());
                }
                Operation::DropColumn { table, column, .. } => {
                    facts
                        .dropped_columns
                        .entry(table.clone())
                        .or_default()
                        .insert(column.clone());
                }
                Operation::AddIndex { index } => {
                    facts
                        .added_indexes
                        .insert((index.table.clone(), index.name.clone()));
                }
                _ => {}
            }
        }
        facts
    }

    /// An index drop that must happen before the drops and creates it blocks
    fn drops_early(&self, operation: &Operation) -> bool {
        let Operation::DropIndex {
            table,
            name,
            reverse,
        } = operation
        else {
            return false;
        };

        if self.dropped_tables.contains(table)
            || self.added_indexes.contains(&(table.clone(), name.clone()))
        {
            return true;
        }
        match (self.dropped_columns.get(table), reverse) {
            (Some(columns), Some(index)) => index.columns.iter().any(|c| columns.contains(c)),
            // Without the index definition assume it may cover a dropped column
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Reject batches that touch the same object twice or rename inconsistently
pub fn validate(operations: &[Operation]) -> MigrateResult<()> {
    let mut identities = BTreeSet::new();
    let mut columns: BTreeMap<(String, String), &'static str> = BTreeMap::new();
    let mut tables: BTreeMap<String, &'static str> = BTreeMap::new();
    let mut rename_sources = BTreeSet::new();
    let mut rename_targets = BTreeSet::new();

    for operation in operations {
        let identity = operation.identity();
        if !identities.insert(identity.clone()) {
            return Err(MigrateError::Planning(format!(
                "duplicate operation: {}",
                identity
            )));
        }

        match operation {
            Operation::AddColumn { table, column } => {
                claim_column(&mut columns, table, &column.name, operation.kind())?
            }
            Operation::AlterColumn { table, column, .. } => {
                claim_column(&mut columns, table, &column.name, operation.kind())?
            }
            Operation::DropColumn { table, column, .. } => {
                claim_column(&mut columns, table, column, operation.kind())?
            }
            Operation::CreateTable { table } => {
                claim_table(&mut tables, &table.name, operation.kind())?
            }
            Operation::DropTable { table, .. } => claim_table(&mut tables, table, operation.kind())?,
            Operation::RenameTable { from, to } => {
                if !rename_sources.insert(from.clone()) {
                    return Err(MigrateError::Planning(format!(
                        "table '{}' is renamed more than once",
                        from
                    )));
                }
                if !rename_targets.insert(to.clone()) {
                    return Err(MigrateError::Planning(format!(
                        "more than one table is renamed to '{}'",
                        to
                    )));
                }
            }
            _ => {}
        }
    }

    if let Some(chained) = rename_targets.iter().find(|t| rename_sources.contains(*t)) {
        return Err(MigrateError::Planning(format!(
            "rename target '{}' is itself renamed in the same batch",
            chained
        )));
    }
    if let Some(clash) = rename_targets.iter().find(|t| tables.get(*t) == Some(&"create_table")) {
        return Err(MigrateError::Planning(format!(
            "table '{}' is both created and a rename target",
            clash
        )));
    }
    Ok(())
}

fn claim_column(
    claimed: &mut BTreeMap<(String, String), &'static str>,
    table: &str,
    column: &str,
    kind: &'static str,
) -> MigrateResult<()> {
    if let Some(previous) = claimed.insert((table.to_string(), column.to_string()), kind) {
        return Err(MigrateError::Planning(format!(
            "conflicting operations on column '{}.{}': {} and {}",
            table, column, previous, kind
        )));
    }
    Ok(())
}

fn claim_table(
    claimed: &mut BTreeMap<String, &'static str>,
    table: &str,
    kind: &'static str,
) -> MigrateResult<()> {
    if let Some(previous) = claimed.insert(table.to_string(), kind) {
        return Err(MigrateError::Planning(format!(
            "conflicting operations on table '{}': {} and {}",
            table, previous, kind
        )));
    }
    Ok(())
}

/// Validate and order an unordered operation set. The sort is stable.
pub fn order(mut operations: Vec<Operation>) -> MigrateResult<Vec<Operation>> {
    validate(&operations)?;
    let facts = BatchFacts::collect(&operations);
    operations.sort_by_key(|op| phase(op, &facts));
    Ok(operations)
}

/// Resolve a descriptor into the ordered operations to apply
pub fn resolve(descriptor: &MigrationDescriptor, scripts: &ScriptRegistry) -> MigrateResult<Plan> {
    let steps = match &descriptor.body {
        // Authored order is kept verbatim
        MigrationBody::Declarative(operations) => {
            validate(operations)?;
            operations
                .iter()
                .cloned()
                .map(|op| match op {
                    Operation::CreateTable { table } => Operation::CreateTable {
                        table: table.normalized(),
                    },
                    other => other,
                })
                .collect()
        }
        MigrationBody::Scripted(script) => {
            if !scripts.contains(&script.name) {
                return Err(MigrateError::Planning(format!(
                    "migration {} references unknown script '{}'",
                    descriptor.version, script.name
                )));
            }
            vec![Operation::RunScript {
                script: script.name.clone(),
                direction: ScriptDirection::Up,
            }]
        }
    };

    Ok(Plan {
        version: descriptor.version.clone(),
        description: descriptor.description.clone(),
        checksum: descriptor.checksum(),
        steps,
    })
}
