//! Executor
//!
//! Turns one operation into dialect statements and runs them on the
//! migration's connection. Before a destructive statement runs, any missing
//! reverse payload is captured from the catalog. Operations the dialect
//! cannot perform in place are carried out by rebuilding the table: create a
//! shadow table with the new structure, copy the shared columns, drop the
//! original, rename the shadow into place and re-create the indexes.

use crate::backend::Database;
use crate::dialect::{Capabilities, Dialect, Statement};
use crate::error::StepError;
use crate::log::{AppliedOperation, Strategy};
use crate::operation::Operation;
use crate::schema::{SchemaSnapshot, TableDefinition};
use crate::script::ScriptRegistry;

/// Executes operations for one dialect
#[derive(Debug, Clone)]
pub struct Executor<'a> {
    dialect: &'static dyn Dialect,
    capabilities: Capabilities,
    shadow_prefix: &'a str,
    scripts: &'a ScriptRegistry,
}

impl<'a> Executor<'a> {
    pub fn new(dialect: &'static dyn Dialect, shadow_prefix: &'a str, scripts: &'a ScriptRegistry) -> Self {
        Self {
            dialect,
            capabilities: dialect.capabilities(),
            shadow_prefix,
            scripts,
        }
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    /// How `operation` is carried out against `snapshot`
    pub fn strategy(&self, operation: &Operation, snapshot: &SchemaSnapshot) -> Strategy {
        let caps = &self.capabilities;
        let in_place = match operation {
            Operation::AddColumn { column, .. } => caps.supports_add(column),
            Operation::DropColumn { .. } => caps.supports_drop(),
            Operation::AlterColumn { table, column, .. } => {
                match snapshot.table(table).and_then(|t| t.column(&column.name)) {
                    Some(current) => caps.supports_alter(current, column),
                    // Missing column surfaces as a precondition failure
                    None => true,
                }
            }
            _ => true,
        };
        if in_place {
            Strategy::InPlace
        } else {
            Strategy::Rebuild
        }
    }

    /// Fill a missing reverse payload from the live schema
    pub fn capture(&self, operation: &Operation, snapshot: &SchemaSnapshot) -> Result<Operation, StepError> {
        let mut operation = operation.clone();
        match &mut operation {
            Operation::DropTable { table, reverse } if reverse.is_none() => {
                *reverse = Some(existing_table(snapshot, table)?.clone());
            }
            Operation::DropColumn {
                table,
                column,
                reverse,
            } if reverse.is_none() => {
                let def = existing_table(snapshot, table)?.column(column).cloned().ok_or_else(|| {
                    StepError::Precondition(format!("column '{}.{}' does not exist", table, column))
                })?;
                *reverse = Some(def);
            }
            Operation::AlterColumn {
                table,
                column,
                reverse,
            } if reverse.is_none() => {
                let def = existing_table(snapshot, table)?
                    .column(&column.name)
                    .cloned()
                    .ok_or_else(|| {
                        StepError::Precondition(format!(
                            "column '{}.{}' does not exist",
                            table, column.name
                        ))
                    })?;
                *reverse = Some(def);
            }
            Operation::DropIndex {
                table,
                name,
                reverse,
            } if reverse.is_none() => {
                let def = existing_table(snapshot, table)?.index(name).cloned().ok_or_else(|| {
                    StepError::Precondition(format!("index '{}' does not exist on '{}'", name, table))
                })?;
                *reverse = Some(def);
            }
            _ => {}
        }
        Ok(operation)
    }

    /// Statements carrying out `operation` against `snapshot`, without running them
    pub fn statements(&self, operation: &Operation, snapshot: &SchemaSnapshot) -> Result<Vec<Statement>, StepError> {
        let mut after = snapshot.clone();
        after.apply(operation)?;

        if self.strategy(operation, snapshot) == Strategy::Rebuild {
            // Rebuilds never rename, so the table keeps its name
            let table = operation.table().unwrap_or_default();
            let current = existing_table(snapshot, table)?;
            let target = existing_table(&after, table)?;
            return Ok(self.rebuild_statements(current, target));
        }

        let statements = match operation {
            Operation::CreateTable { table } => {
                let table = table.clone().normalized();
                let mut statements = vec![Statement::CreateTable(table.clone())];
                statements.extend(table.indexes.into_iter().map(Statement::CreateIndex));
                statements
            }
            Operation::DropTable { table, .. } => vec![Statement::DropTable {
                table: table.clone(),
            }],
            Operation::RenameTable { from, to } => vec![Statement::RenameTable {
                from: from.clone(),
                to: to.clone(),
            }],
            Operation::AddColumn { table, column } => vec![Statement::AddColumn {
                table: table.clone(),
                column: column.clone(),
            }],
            Operation::DropColumn { table, column, .. } => vec![Statement::DropColumn {
                table: table.clone(),
                column: column.clone(),
            }],
            Operation::AlterColumn { table, column, .. } => {
                let from = existing_table(snapshot, table)?
                    .column(&column.name)
                    .cloned()
                    .ok_or_else(|| {
                        StepError::Precondition(format!(
                            "column '{}.{}' does not exist",
                            table, column.name
                        ))
                    })?;
                vec![Statement::AlterColumn {
                    table: table.clone(),
                    from,
                    to: column.clone(),
                }]
            }
            Operation::AddIndex { index } => vec![Statement::CreateIndex(index.clone())],
            Operation::DropIndex { table, name, .. } => vec![Statement::DropIndex {
                table: table.clone(),
                name: name.clone(),
            }],
            Operation::RunScript { script, direction } => {
                vec![Statement::Raw(format!("-- run script {} ({:?})", script, direction))]
            }
        };
        Ok(statements)
    }

    /// Shadow-table rebuild turning `current` into `target`
    pub fn rebuild_statements(&self, current: &TableDefinition, target: &TableDefinition) -> Vec<Statement> {
        let shadow_name = format!("{}{}", self.shadow_prefix, target.name);
        let mut shadow = target.clone().renamed(&shadow_name);
        shadow.indexes.clear();

        let shared: Vec<String> = target
            .columns
            .iter()
            .filter(|c| current.has_column(&c.name))
            .map(|c| c.name.clone())
            .collect();

        let mut statements = vec![
            Statement::CreateTable(shadow),
            Statement::CopyRows {
                from: current.name.clone(),
                to: shadow_name.clone(),
                columns: shared,
            },
            Statement::DropTable {
                table: current.name.clone(),
            },
            Statement::RenameTable {
                from: shadow_name,
                to: target.name.clone(),
            },
        ];
        statements.extend(target.indexes.iter().cloned().map(|mut index| {
            index.table = target.name.clone();
            Statement::CreateIndex(index)
        }));
        statements
    }

    /// Run one operation on the connection's open transaction
    pub async fn execute<D: Database>(&self, db: &mut D, operation: &Operation) -> Result<AppliedOperation, StepError> {
        if let Operation::RunScript { script, direction } = operation {
            let procedure = self.scripts.get(script).ok_or_else(|| {
                StepError::Precondition(format!("script '{}' is not registered", script))
            })?;
            tracing::info!("Running script {} ({:?})", script, direction);
            procedure.run(*direction, db).await?;
            return Ok(AppliedOperation::in_place(operation.clone()));
        }

        // Read the catalog right before the change so reverse metadata is exact
        let snapshot = db.read_schema().await?;
        let operation = self.capture(operation, &snapshot)?;
        if !operation.has_reverse_payload() {
            return Err(StepError::Precondition(format!(
                "{} has no reverse payload",
                operation.identity()
            )));
        }

        let strategy = self.strategy(&operation, &snapshot);
        let statements = self.statements(&operation, &snapshot)?;
        match strategy {
            Strategy::InPlace => tracing::info!("Applying {}", operation),
            Strategy::Rebuild => tracing::info!(
                "Applying {} by rebuilding table {}",
                operation,
                operation.table().unwrap_or_default()
            ),
        }
        for statement in &statements {
            db.execute(statement).await?;
        }

        match strategy {
            Strategy::InPlace => Ok(AppliedOperation::in_place(operation)),
            Strategy::Rebuild => {
                let original = existing_table(&snapshot, operation.table().unwrap_or_default())?.clone();
                Ok(AppliedOperation::rebuilt(operation, original))
            }
        }
    }

    /// Rebuild a table back to a recorded definition
    pub async fn rebuild_to<D: Database>(&self, db: &mut D, original: &TableDefinition) -> Result<(), StepError> {
        let snapshot = db.read_schema().await?;
        let current = existing_table(&snapshot, &original.name)?;
        tracing::info!("Rebuilding table {} to its recorded definition", original.name);
        for statement in self.rebuild_statements(current, original) {
            db.execute(&statement).await?;
        }
        Ok(())
    }
}

fn existing_table<'s>(snapshot: &'s SchemaSnapshot, name: &str) -> Result<&'s TableDefinition, StepError> {
    snapshot
        .table(name)
        .ok_or_else(|| StepError::Precondition(format!("table '{}' does not exist", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryDatabase;
    use crate::dialect::{PostgresDialect, SqliteDialect};
    use crate::error::SchemaError;
    use crate::schema::{ColumnDefinition, ColumnType, IndexDefinition};
    use serde_json::json;

    fn users() -> TableDefinition {
        TableDefinition::new(
            "users",
            vec![
                ColumnDefinition::new("id", ColumnType::integer()).primary_key(),
                ColumnDefinition::new("name", ColumnType::varchar(100)).not_null(),
                ColumnDefinition::new("email", ColumnType::varchar(255)),
            ],
        )
        .with_index(IndexDefinition::new("idx_users_name", "", ["name"]))
    }

    fn drop_email() -> Operation {
        Operation::DropColumn {
            table: "users".to_string(),
            column: "email".to_string(),
            reverse: None,
        }
    }

    #[test]
    fn test_strategy_follows_capabilities() {
        let scripts = ScriptRegistry::new();
        let schema = SchemaSnapshot::new().with_table(users());

        let pg = Executor::new(&PostgresDialect, "__rebuild_", &scripts);
        assert_eq!(pg.strategy(&drop_email(), &schema), Strategy::InPlace);

        let sqlite = Executor::new(&SqliteDialect, "__rebuild_", &scripts);
        assert_eq!(sqlite.strategy(&drop_email(), &schema), Strategy::Rebuild);
        let add_nullable = Operation::AddColumn {
            table: "users".to_string(),
            column: ColumnDefinition::new("bio", ColumnType::text()),
        };
        assert_eq!(sqlite.strategy(&add_nullable, &schema), Strategy::InPlace);
    }

    #[test]
    fn test_capture_fills_missing_payload() {
        let scripts = ScriptRegistry::new();
        let executor = Executor::new(&PostgresDialect, "__rebuild_", &scripts);
        let schema = SchemaSnapshot::new().with_table(users());

        let captured = executor.capture(&drop_email(), &schema).unwrap();
        assert_eq!(
            captured,
            Operation::DropColumn {
                table: "users".to_string(),
                column: "email".to_string(),
                reverse: Some(ColumnDefinition::new("email", ColumnType::varchar(255))),
            }
        );

        let missing = Operation::DropTable {
            table: "ghosts".to_string(),
            reverse: None,
        };
        assert!(matches!(
            executor.capture(&missing, &schema),
            Err(StepError::Precondition(_))
        ));
    }

    #[test]
    fn test_statements_report_schema_conflicts() {
        let scripts = ScriptRegistry::new();
        let executor = Executor::new(&PostgresDialect, "__rebuild_", &scripts);
        let schema = SchemaSnapshot::new().with_table(users());

        let duplicate = Operation::AddColumn {
            table: "users".to_string(),
            column: ColumnDefinition::new("email", ColumnType::text()),
        };
        match executor.statements(&duplicate, &schema) {
            Err(StepError::Schema(SchemaError::ColumnExists { table, column })) => {
                assert_eq!((table.as_str(), column.as_str()), ("users", "email"));
            }
            other => panic!("expected a column conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_rebuild_statement_sequence() {
        let scripts = ScriptRegistry::new();
        let executor = Executor::new(&SqliteDialect, "__rebuild_", &scripts);
        let schema = SchemaSnapshot::new().with_table(users());

        let statements = executor.statements(&drop_email(), &schema).unwrap();
        let kinds: Vec<String> = statements.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            kinds,
            vec![
                "CREATE TABLE __rebuild_users",
                "COPY ROWS users -> __rebuild_users",
                "DROP TABLE users",
                "RENAME __rebuild_users TO users",
                "CREATE INDEX idx_users_name",
            ]
        );
        match &statements[1] {
            Statement::CopyRows { columns, .. } => assert_eq!(columns, &vec!["id".to_string(), "name".to_string()]),
            other => panic!("expected row copy, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rebuild_keeps_rows_and_records_original() {
        let scripts = ScriptRegistry::new();
        let executor = Executor::new(&SqliteDialect, "__rebuild_", &scripts);
        let mut db = MemoryDatabase::sqlite().with_schema(SchemaSnapshot::new().with_table(users()));
        db.insert_row(
            "users",
            [("id", json!(1)), ("name", json!("ada")), ("email", json!("ada@example.com"))],
        )
        .unwrap();

        let applied = executor.execute(&mut db, &drop_email()).await.unwrap();
        assert_eq!(applied.strategy, Strategy::Rebuild);
        assert_eq!(applied.rebuilt_from.as_ref(), Some(&users()));

        let table = db.schema().table("users").unwrap();
        assert!(!table.has_column("email"));
        assert!(table.index("idx_users_name").is_some());
        assert!(!db.schema().contains("__rebuild_users"));
        let rows = db.rows("users");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("ada"));
        assert!(!rows[0].contains_key("email"));

        executor.rebuild_to(&mut db, &users()).await.unwrap();
        assert_eq!(db.schema().table("users"), Some(&users()));
        assert_eq!(db.rows("users")[0]["name"], json!("ada"));
    }
}
