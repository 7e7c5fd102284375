//! Structural simulation of operations against a snapshot
//!
//! Used by dry-run and by the rebuild strategy to compute the post-operation
//! shape of a table without touching a database.

use super::{SchemaSnapshot, TableDefinition};
use crate::error::SchemaError;
use crate::operation::Operation;

impl SchemaSnapshot {
    /// Apply one operation in memory. Fails when the operation does not fit
    /// the snapshot (missing table, duplicate column, ...).
    pub fn apply(&mut self, operation: &Operation) -> Result<(), SchemaError> {
        match operation {
            Operation::CreateTable { table } => {
                if self.contains(&table.name) {
                    return Err(SchemaError::TableExists(table.name.clone()));
                }
                let table = table.clone().normalized();
                table.validate()?;
                self.insert(table);
            }
            Operation::DropTable { table, .. } => {
                self.remove(table)
                    .ok_or_else(|| SchemaError::MissingTable(table.clone()))?;
            }
            Operation::RenameTable { from, to } => {
                if self.contains(to) {
                    return Err(SchemaError::TableExists(to.clone()));
                }
                let table = self
                    .remove(from)
                    .ok_or_else(|| SchemaError::MissingTable(from.clone()))?;
                self.insert(table.renamed(to));
            }
            Operation::AddColumn { table, column } => {
                let def = self.existing_table(table)?;
                if def.has_column(&column.name) {
                    return Err(SchemaError::ColumnExists {
                        table: table.clone(),
                        column: column.name.clone(),
                    });
                }
                if column.primary_key {
                    def.primary_key.push(column.name.clone());
                }
                def.columns.push(column.clone());
            }
            Operation::DropColumn { table, column, .. } => {
                let def = self.existing_table(table)?;
                if !def.has_column(column) {
                    return Err(SchemaError::MissingColumn {
                        table: table.clone(),
                        column: column.clone(),
                    });
                }
                if let Some(index) = def.indexes.iter().find(|i| i.references_column(column)) {
                    return Err(SchemaError::ColumnIndexed {
                        table: table.clone(),
                        column: column.clone(),
                        index: index.name.clone(),
                    });
                }
                def.columns.retain(|c| &c.name != column);
                def.primary_key.retain(|c| c != column);
            }
            Operation::AlterColumn { table, column, .. } => {
                let def = self.existing_table(table)?;
                let slot = def
                    .columns
                    .iter_mut()
                    .find(|c| c.name == column.name)
                    .ok_or_else(|| SchemaError::MissingColumn {
                        table: table.clone(),
                        column: column.name.clone(),
                    })?;
                *slot = column.clone();
                def.primary_key = def
                    .columns
                    .iter()
                    .filter(|c| c.primary_key)
                    .map(|c| c.name.clone())
                    .collect();
            }
            Operation::AddIndex { index } => {
                let def = self.existing_table(&index.table)?;
                if def.index(&index.name).is_some() {
                    return Err(SchemaError::IndexExists {
                        table: index.table.clone(),
                        index: index.name.clone(),
                    });
                }
                if let Some(missing) = index.columns.iter().find(|c| !def.has_column(c)) {
                    return Err(SchemaError::UnknownIndexColumn {
                        index: index.name.clone(),
                        table: index.table.clone(),
                        column: missing.clone(),
                    });
                }
                def.indexes.push(index.clone());
            }
            Operation::DropIndex { table, name, .. } => {
                let def = self.existing_table(table)?;
                if def.index(name).is_none() {
                    return Err(SchemaError::MissingIndex {
                        table: table.clone(),
                        index: name.clone(),
                    });
                }
                def.indexes.retain(|i| &i.name != name);
            }
            // Scripts are opaque; their effect cannot be simulated
            Operation::RunScript { .. } => {}
        }
        Ok(())
    }

    fn existing_table(&mut self, name: &str) -> Result<&mut TableDefinition, SchemaError> {
        self.table_mut(name)
            .ok_or_else(|| SchemaError::MissingTable(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use crate::error::SchemaError;
    use crate::operation::Operation;
    use crate::schema::*;

    fn snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new().with_table(
            TableDefinition::new(
                "users",
                vec![
                    ColumnDefinition::new("id", ColumnType::integer()).primary_key(),
                    ColumnDefinition::new("email", ColumnType::varchar(255)),
                ],
            )
            .with_index(IndexDefinition::new("idx_users_email", "", ["email"])),
        )
    }

    #[test]
    fn test_rename_then_add_column() {
        let mut schema = snapshot();
        schema
            .apply(&Operation::RenameTable {
                from: "users".to_string(),
                to: "members".to_string(),
            })
            .unwrap();
        schema
            .apply(&Operation::AddColumn {
                table: "members".to_string(),
                column: ColumnDefinition::new("created_at", ColumnType::timestamp()),
            })
            .unwrap();

        let members = schema.table("members").unwrap();
        assert!(members.has_column("created_at"));
        assert_eq!(members.indexes[0].table, "members");
        assert!(!schema.contains("users"));
    }

    #[test]
    fn test_drop_column_requires_index_drop_first() {
        let mut schema = snapshot();
        let drop_column = Operation::DropColumn {
            table: "users".to_string(),
            column: "email".to_string(),
            reverse: None,
        };
        assert!(matches!(
            schema.apply(&drop_column).unwrap_err(),
            SchemaError::ColumnIndexed { index, .. } if index == "idx_users_email"
        ));

        schema
            .apply(&Operation::DropIndex {
                table: "users".to_string(),
                name: "idx_users_email".to_string(),
                reverse: None,
            })
            .unwrap();
        schema.apply(&drop_column).unwrap();
        assert!(!schema.table("users").unwrap().has_column("email"));
    }

    #[test]
    fn test_missing_objects_are_reported() {
        let mut schema = snapshot();
        let err = schema
            .apply(&Operation::DropTable {
                table: "ghosts".to_string(),
                reverse: None,
            })
            .unwrap_err();
        assert_eq!(err, SchemaError::MissingTable("ghosts".to_string()));

        let err = schema
            .apply(&Operation::AddIndex {
                index: IndexDefinition::new("idx_users_age", "users", ["age"]),
            })
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownIndexColumn { ref column, .. } if column == "age"));
        assert_eq!(err.to_string(), "index 'idx_users_age' references unknown column 'users.age'");
    }
}
