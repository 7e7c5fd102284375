//! Operation Model
//!
//! The tagged set of structural changes the engine plans, executes and
//! reverses. Variants that destroy or overwrite state carry a typed reverse
//! payload slot that the diff engine or the executor fills before the
//! destructive statement runs. The payload is only serialized when a log
//! entry is persisted.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SchemaError;
use crate::schema::{ColumnDefinition, IndexDefinition, TableDefinition};

/// Which half of a scripted migration to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptDirection {
    Up,
    Down,
}

impl ScriptDirection {
    pub fn flipped(self) -> Self {
        match self {
            ScriptDirection::Up => ScriptDirection::Down,
            ScriptDirection::Down => ScriptDirection::Up,
        }
    }
}

/// A structural change operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Reverse is trivial: drop the table by name
    CreateTable { table: TableDefinition },
    DropTable {
        table: String,
        /// Full definition of the dropped table
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reverse: Option<TableDefinition>,
    },
    /// Reverse is the prior name, `from`
    RenameTable { from: String, to: String },
    /// Reverse is trivial: drop the column by name
    AddColumn {
        table: String,
        column: ColumnDefinition,
    },
    DropColumn {
        table: String,
        column: String,
        /// The removed column
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reverse: Option<ColumnDefinition>,
    },
    AlterColumn {
        table: String,
        /// The desired definition; matched to the live column by name
        column: ColumnDefinition,
        /// The prior definition
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reverse: Option<ColumnDefinition>,
    },
    /// Reverse is trivial: drop the index by name
    AddIndex { index: IndexDefinition },
    DropIndex {
        table: String,
        name: String,
        /// The dropped index
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reverse: Option<IndexDefinition>,
    },
    /// Opaque scripted procedure; reverse runs the paired direction
    RunScript {
        script: String,
        direction: ScriptDirection,
    },
}

impl Operation {
    /// The table this operation addresses (the new name for renames)
    pub fn table(&self) -> Option<&str> {
        match self {
            Operation::CreateTable { table } => Some(&table.name),
            Operation::DropTable { table, .. }
            | Operation::AddColumn { table, .. }
            | Operation::DropColumn { table, .. }
            | Operation::AlterColumn { table, .. }
            | Operation::DropIndex { table, .. } => Some(table),
            Operation::RenameTable { to, .. } => Some(to),
            Operation::AddIndex { index } => Some(&index.table),
            Operation::RunScript { .. } => None,
        }
    }

    /// Short snake_case name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateTable { .. } => "create_table",
            Operation::DropTable { .. } => "drop_table",
            Operation::RenameTable { .. } => "rename_table",
            Operation::AddColumn { .. } => "add_column",
            Operation::DropColumn { .. } => "drop_column",
            Operation::AlterColumn { .. } => "alter_column",
            Operation::AddIndex { .. } => "add_index",
            Operation::DropIndex { .. } => "drop_index",
            Operation::RunScript { .. } => "run_script",
        }
    }

    /// Identity of the object the operation targets; two operations with the
    /// same identity in one batch conflict
    pub fn identity(&self) -> String {
        let object = match self {
            Operation::CreateTable { table } => table.name.clone(),
            Operation::DropTable { table, .. } => table.clone(),
            Operation::RenameTable { from, to } => format!("{}->{}", from, to),
            Operation::AddColumn { table, column } => format!("{}.{}", table, column.name),
            Operation::DropColumn { table, column, .. } => format!("{}.{}", table, column),
            Operation::AlterColumn { table, column, .. } => format!("{}.{}", table, column.name),
            Operation::AddIndex { index } => format!("{}.{}", index.table, index.name),
            Operation::DropIndex { table, name, .. } => format!("{}.{}", table, name),
            Operation::RunScript { script, direction } => format!("{}:{:?}", script, direction),
        };
        format!("{} {}", self.kind(), object)
    }

    /// Whether the operation destroys or overwrites existing state
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Operation::DropTable { .. }
                | Operation::DropColumn { .. }
                | Operation::AlterColumn { .. }
                | Operation::DropIndex { .. }
        )
    }

    /// Whether enough reverse metadata is present to invert the operation
    pub fn has_reverse_payload(&self) -> bool {
        match self {
            Operation::DropTable { reverse, .. } => reverse.is_some(),
            Operation::DropColumn { reverse, .. } => reverse.is_some(),
            Operation::AlterColumn { reverse, .. } => reverse.is_some(),
            Operation::DropIndex { reverse, .. } => reverse.is_some(),
            Operation::CreateTable { .. }
            | Operation::RenameTable { .. }
            | Operation::AddColumn { .. }
            | Operation::AddIndex { .. }
            | Operation::RunScript { .. } => true,
        }
    }

    /// Synthesize the operation that undoes this one from its reverse payload
    pub fn inverse(&self) -> Result<Operation, SchemaError> {
        let missing = || SchemaError::MissingReverse(self.identity());
        let inverse = match self {
            Operation::CreateTable { table } => Operation::DropTable {
                table: table.name.clone(),
                reverse: Some(table.clone()),
            },
            Operation::DropTable { reverse, .. } => Operation::CreateTable {
                table: reverse.clone().ok_or_else(missing)?,
            },
            Operation::RenameTable { from, to } => Operation::RenameTable {
                from: to.clone(),
                to: from.clone(),
            },
            Operation::AddColumn { table, column } => Operation::DropColumn {
                table: table.clone(),
                column: column.name.clone(),
                reverse: Some(column.clone()),
            },
            Operation::DropColumn { table, reverse, .. } => Operation::AddColumn {
                table: table.clone(),
                column: reverse.clone().ok_or_else(missing)?,
            },
            Operation::AlterColumn {
                table,
                column,
                reverse,
            } => Operation::AlterColumn {
                table: table.clone(),
                column: reverse.clone().ok_or_else(missing)?,
                reverse: Some(column.clone()),
            },
            Operation::AddIndex { index } => Operation::DropIndex {
                table: index.table.clone(),
                name: index.name.clone(),
                reverse: Some(index.clone()),
            },
            Operation::DropIndex { reverse, .. } => Operation::AddIndex {
                index: reverse.clone().ok_or_else(missing)?,
            },
            Operation::RunScript { script, direction } => Operation::RunScript {
                script: script.clone(),
                direction: direction.flipped(),
            },
        };
        Ok(inverse)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateTable { table } => write!(f, "create table {}", table.name),
            Operation::DropTable { table, .. } => write!(f, "drop table {}", table),
            Operation::RenameTable { from, to } => write!(f, "rename table {} to {}", from, to),
            Operation::AddColumn { table, column } => {
                write!(f, "add column {}.{} {}", table, column.name, column.column_type)
            }
            Operation::DropColumn { table, column, .. } => {
                write!(f, "drop column {}.{}", table, column)
            }
            Operation::AlterColumn { table, column, .. } => {
                write!(f, "alter column {}.{} to {}", table, column.name, column.column_type)
            }
            Operation::AddIndex { index } => write!(
                f,
                "add {}index {} on {} ({})",
                if index.unique { "unique " } else { "" },
                index.name,
                index.table,
                index.columns.join(", ")
            ),
            Operation::DropIndex { table, name, .. } => {
                write!(f, "drop index {} on {}", name, table)
            }
            Operation::RunScript { script, direction } => {
                write!(f, "run script {} ({:?})", script, direction)
            }
        }
    }
}
