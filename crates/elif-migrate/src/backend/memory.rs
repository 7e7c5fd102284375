//! In-memory database backend
//!
//! Interprets [`Statement`] values structurally against a schema snapshot
//! and a row store. It follows the capabilities of the dialect it imitates:
//! a statement that dialect cannot run in place is rejected, just like the
//! real database would. Used by tests and by embedders that want to validate
//! a plan without a server.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};

use super::{render_traced, Database};
use crate::dialect::{Dialect, PostgresDialect, SqliteDialect, Statement};
use crate::error::BackendError;
use crate::log::{MigrationLog, MigrationLogEntry};
use crate::operation::Operation;
use crate::schema::{ColumnDefinition, SchemaSnapshot, TableDefinition};

/// A stored row: column name to value
pub type Row = BTreeMap<String, JsonValue>;

#[derive(Debug, Clone, Default)]
struct State {
    schema: SchemaSnapshot,
    rows: BTreeMap<String, Vec<Row>>,
}

/// In-process database with transactional schema and row state
#[derive(Debug)]
pub struct MemoryDatabase {
    dialect: &'static dyn Dialect,
    state: State,
    /// State captured at BEGIN, restored on ROLLBACK
    saved: Option<State>,
    log: Vec<MigrationLogEntry>,
    journal: Vec<String>,
    fail_on: Option<String>,
    fail_reads: bool,
    lock: Option<i64>,
    lock_keys: Vec<i64>,
}

impl MemoryDatabase {
    pub fn new(dialect: &'static dyn Dialect) -> Self {
        Self {
            dialect,
            state: State::default(),
            saved: None,
            log: Vec::new(),
            journal: Vec::new(),
            fail_on: None,
            fail_reads: false,
            lock: None,
            lock_keys: Vec::new(),
        }
    }

    /// Memory database with PostgreSQL capabilities
    pub fn postgres() -> Self {
        Self::new(&PostgresDialect)
    }

    /// Memory database with SQLite capabilities (no in-place alter or drop column)
    pub fn sqlite() -> Self {
        Self::new(&SqliteDialect)
    }

    /// Seed the schema; every table starts empty
    pub fn with_schema(mut self, schema: SchemaSnapshot) -> Self {
        for name in schema.table_names() {
            self.state.rows.insert(name.clone(), Vec::new());
        }
        self.state.schema = schema;
        self
    }

    /// Fail any statement whose rendered SQL contains `pattern`
    pub fn fail_on(&mut self, pattern: impl Into<String>) {
        self.fail_on = Some(pattern.into());
    }

    /// Make catalog introspection fail
    pub fn fail_schema_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    /// SQL of every successfully executed statement, in order
    pub fn journal(&self) -> &[String] {
        &self.journal
    }

    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    pub fn schema(&self) -> &SchemaSnapshot {
        &self.state.schema
    }

    pub fn in_transaction(&self) -> bool {
        self.saved.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Every advisory lock key taken so far
    pub fn lock_keys(&self) -> &[i64] {
        &self.lock_keys
    }

    /// Insert a row; omitted columns take their default or NULL
    pub fn insert_row<'a>(
        &mut self,
        table: &str,
        values: impl IntoIterator<Item = (&'a str, JsonValue)>,
    ) -> Result<(), BackendError> {
        let def = self
            .state
            .schema
            .table(table)
            .ok_or_else(|| BackendError::Rejected(format!("no such table: {}", table)))?;

        let mut row: Row = values
            .into_iter()
            .map(|(column, value)| (column.to_string(), value))
            .collect();
        if let Some(unknown) = row.keys().find(|c| !def.has_column(c)) {
            return Err(BackendError::Rejected(format!(
                "table {} has no column named {}",
                table, unknown
            )));
        }
        for column in &def.columns {
            row.entry(column.name.clone())
                .or_insert_with(|| default_value(column));
        }
        check_not_null(def, &row)?;

        self.state.rows.entry(table.to_string()).or_default().push(row);
        Ok(())
    }

    /// Rows of a table in insertion order
    pub fn rows(&self, table: &str) -> &[Row] {
        self.state.rows.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    fn interpret(&mut self, statement: &Statement) -> Result<(), String> {
        let caps = self.dialect.capabilities();
        let state = &mut self.state;

        match statement {
            Statement::CreateTable(table) => {
                let mut table = table.clone();
                table.indexes.clear();
                simulate(&mut state.schema, Operation::CreateTable {
                    table: table.clone(),
                })?;
                state.rows.insert(table.name, Vec::new());
            }
            Statement::DropTable { table } => {
                simulate(&mut state.schema, Operation::DropTable {
                    table: table.clone(),
                    reverse: None,
                })?;
                state.rows.remove(table);
            }
            Statement::RenameTable { from, to } => {
                simulate(&mut state.schema, Operation::RenameTable {
                    from: from.clone(),
                    to: to.clone(),
                })?;
                let rows = state.rows.remove(from).unwrap_or_default();
                state.rows.insert(to.clone(), rows);
            }
            Statement::AddColumn { table, column } => {
                if !caps.supports_add(column) {
                    return Err(format!(
                        "{} cannot add constrained column {}.{} in place",
                        self.dialect.name(),
                        table,
                        column.name
                    ));
                }
                let rows = state.rows.entry(table.clone()).or_default();
                if !column.nullable && column.default.is_none() && !rows.is_empty() {
                    return Err(format!(
                        "column {}.{} is NOT NULL without a default and the table has rows",
                        table, column.name
                    ));
                }
                simulate(&mut state.schema, Operation::AddColumn {
                    table: table.clone(),
                    column: column.clone(),
                })?;
                for row in state.rows.entry(table.clone()).or_default() {
                    row.insert(column.name.clone(), default_value(column));
                }
            }
            Statement::DropColumn { table, column } => {
                if !caps.supports_drop() {
                    return Err(format!(
                        "{} cannot drop column {}.{} in place",
                        self.dialect.name(),
                        table,
                        column
                    ));
                }
                simulate(&mut state.schema, Operation::DropColumn {
                    table: table.clone(),
                    column: column.clone(),
                    reverse: None,
                })?;
                for row in state.rows.entry(table.clone()).or_default() {
                    row.remove(column);
                }
            }
            Statement::AlterColumn { table, from, to } => {
                if !caps.supports_alter(from, to) {
                    return Err(format!(
                        "{} cannot alter column {}.{} in place",
                        self.dialect.name(),
                        table,
                        to.name
                    ));
                }
                let rows = state.rows.get(table).map(Vec::as_slice).unwrap_or(&[]);
                if !to.nullable && rows.iter().any(|r| is_null(r.get(&to.name))) {
                    return Err(format!("column {}.{} contains null values", table, to.name));
                }
                simulate(&mut state.schema, Operation::AlterColumn {
                    table: table.clone(),
                    column: to.clone(),
                    reverse: None,
                })?;
            }
            Statement::CreateIndex(index) => {
                if index.unique {
                    let rows = state.rows.get(&index.table).map(Vec::as_slice).unwrap_or(&[]);
                    let mut seen = BTreeSet::new();
                    for row in rows {
                        let key: Vec<String> = index
                            .columns
                            .iter()
                            .map(|c| row.get(c).cloned().unwrap_or(JsonValue::Null).to_string())
                            .collect();
                        if !seen.insert(key) {
                            return Err(format!(
                                "could not create unique index {}: duplicate key",
                                index.name
                            ));
                        }
                    }
                }
                simulate(&mut state.schema, Operation::AddIndex {
                    index: index.clone(),
                })?;
            }
            Statement::DropIndex { table, name } => {
                simulate(&mut state.schema, Operation::DropIndex {
                    table: table.clone(),
                    name: name.clone(),
                    reverse: None,
                })?;
            }
            Statement::CopyRows { from, to, columns } => {
                let target = state
                    .schema
                    .table(to)
                    .ok_or_else(|| format!("no such table: {}", to))?
                    .clone();
                if !state.schema.contains(from) {
                    return Err(format!("no such table: {}", from));
                }
                if let Some(missing) = columns.iter().find(|c| !target.has_column(c)) {
                    return Err(format!("table {} has no column named {}", to, missing));
                }

                let mut copied = Vec::new();
                for source in state.rows.get(from).map(Vec::as_slice).unwrap_or(&[]) {
                    let mut row = Row::new();
                    for column in &target.columns {
                        let value = if columns.contains(&column.name) {
                            source.get(&column.name).cloned().unwrap_or(JsonValue::Null)
                        } else {
                            default_value(column)
                        };
                        row.insert(column.name.clone(), value);
                    }
                    check_not_null(&target, &row).map_err(|e| e.to_string())?;
                    copied.push(row);
                }
                state.rows.entry(to.clone()).or_default().extend(copied);
            }
            // Raw SQL is recorded but has no structural effect
            Statement::Raw(_) => {}
        }
        Ok(())
    }
}

fn simulate(schema: &mut SchemaSnapshot, operation: Operation) -> Result<(), String> {
    schema.apply(&operation).map_err(|e| e.to_string())
}

fn is_null(value: Option<&JsonValue>) -> bool {
    matches!(value, None | Some(JsonValue::Null))
}

fn check_not_null(table: &TableDefinition, row: &Row) -> Result<(), BackendError> {
    match table
        .columns
        .iter()
        .find(|c| !c.nullable && is_null(row.get(&c.name)))
    {
        Some(column) => Err(BackendError::Rejected(format!(
            "NOT NULL constraint failed: {}.{}",
            table.name, column.name
        ))),
        None => Ok(()),
    }
}

/// Evaluate a default expression into a stored value
fn default_value(column: &ColumnDefinition) -> JsonValue {
    let Some(expression) = column.default.as_deref().map(str::trim) else {
        return JsonValue::Null;
    };

    if expression.eq_ignore_ascii_case("null") {
        JsonValue::Null
    } else if expression.eq_ignore_ascii_case("true") {
        JsonValue::Bool(true)
    } else if expression.eq_ignore_ascii_case("false") {
        JsonValue::Bool(false)
    } else if let Some(quoted) = expression
        .strip_prefix('\'')
        .and_then(|e| e.strip_suffix('\''))
    {
        JsonValue::String(quoted.replace("''", "'"))
    } else if let Ok(int) = expression.parse::<i64>() {
        JsonValue::from(int)
    } else if let Ok(float) = expression.parse::<f64>() {
        JsonValue::from(float)
    } else {
        JsonValue::String(expression.to_string())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    async fn read_schema(&mut self) -> Result<SchemaSnapshot, BackendError> {
        if self.fail_reads {
            return Err(BackendError::Rejected("catalog is unavailable".to_string()));
        }
        Ok(self.state.schema.clone())
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        if self.saved.is_some() {
            return Err(BackendError::Rejected(
                "a transaction is already in progress".to_string(),
            ));
        }
        self.saved = Some(self.state.clone());
        self.journal.push("BEGIN".to_string());
        Ok(())
    }

    async fn execute(&mut self, statement: &Statement) -> Result<(), BackendError> {
        let sql = render_traced(self.dialect, statement);

        if let Some(pattern) = &self.fail_on {
            if let Some(line) = sql.iter().find(|line| line.contains(pattern.as_str())) {
                return Err(BackendError::Rejected(format!("injected failure: {}", line)));
            }
        }

        self.interpret(statement).map_err(BackendError::Rejected)?;
        self.journal.extend(sql);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.saved
            .take()
            .ok_or_else(|| BackendError::Rejected("no transaction is in progress".to_string()))?;
        self.journal.push("COMMIT".to_string());
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        let saved = self
            .saved
            .take()
            .ok_or_else(|| BackendError::Rejected("no transaction is in progress".to_string()))?;
        self.state = saved;
        self.journal.push("ROLLBACK".to_string());
        Ok(())
    }

    async fn lock(&mut self, key: i64) -> Result<(), BackendError> {
        self.lock = Some(key);
        self.lock_keys.push(key);
        Ok(())
    }

    async fn unlock(&mut self, _key: i64) -> Result<(), BackendError> {
        self.lock = None;
        Ok(())
    }
}

#[async_trait]
impl MigrationLog for MemoryDatabase {
    async fn ensure_storage(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn entries(&mut self) -> Result<Vec<MigrationLogEntry>, BackendError> {
        Ok(self.log.clone())
    }

    async fn last(&mut self) -> Result<Option<MigrationLogEntry>, BackendError> {
        Ok(self.log.last().cloned())
    }

    async fn append(&mut self, entry: &MigrationLogEntry) -> Result<(), BackendError> {
        if self.log.iter().any(|e| e.version == entry.version) {
            return Err(BackendError::Rejected(format!(
                "migration {} is already logged",
                entry.version
            )));
        }
        self.log.push(entry.clone());
        Ok(())
    }

    async fn pop(&mut self, version: &str) -> Result<(), BackendError> {
        match self.log.last() {
            Some(tail) if tail.version == version => {
                self.log.pop();
                Ok(())
            }
            _ => Err(BackendError::Rejected(format!(
                "migration {} is not the most recent log entry",
                version
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, IndexDefinition};
    use serde_json::json;

    fn users() -> TableDefinition {
        TableDefinition::new(
            "users",
            vec![
                ColumnDefinition::new("id", ColumnType::integer()).primary_key(),
                ColumnDefinition::new("name", ColumnType::varchar(100)).not_null(),
            ],
        )
    }

    #[tokio::test]
    async fn test_rollback_restores_schema_and_rows() {
        let mut db = MemoryDatabase::postgres().with_schema(SchemaSnapshot::new().with_table(users()));
        db.insert_row("users", [("id", json!(1)), ("name", json!("ada"))])
            .unwrap();

        db.begin().await.unwrap();
        db.execute(&Statement::DropTable {
            table: "users".to_string(),
        })
        .await
        .unwrap();
        assert!(!db.schema().contains("users"));
        db.rollback().await.unwrap();

        assert!(db.schema().contains("users"));
        assert_eq!(db.rows("users")[0]["name"], json!("ada"));
        assert_eq!(db.journal().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_sqlite_rejects_in_place_drop_column() {
        let mut db = MemoryDatabase::sqlite().with_schema(SchemaSnapshot::new().with_table(users()));
        let err = db
            .execute(&Statement::DropColumn {
                table: "users".to_string(),
                column: "name".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot drop column"));
    }

    #[tokio::test]
    async fn test_copy_rows_fills_defaults() {
        let mut db = MemoryDatabase::sqlite().with_schema(SchemaSnapshot::new().with_table(users()));
        db.insert_row("users", [("id", json!(1)), ("name", json!("ada"))])
            .unwrap();

        let mut shadow = users().renamed("__rebuild_users");
        shadow.columns.push(
            ColumnDefinition::new("status", ColumnType::varchar(20))
                .not_null()
                .default_value("'active'"),
        );
        db.execute(&Statement::CreateTable(shadow)).await.unwrap();
        db.execute(&Statement::CopyRows {
            from: "users".to_string(),
            to: "__rebuild_users".to_string(),
            columns: vec!["id".to_string(), "name".to_string()],
        })
        .await
        .unwrap();

        let rows = db.rows("__rebuild_users");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], json!("active"));
    }

    #[tokio::test]
    async fn test_unique_index_checks_existing_rows() {
        let mut db = MemoryDatabase::postgres().with_schema(SchemaSnapshot::new().with_table(users()));
        db.insert_row("users", [("id", json!(1)), ("name", json!("ada"))])
            .unwrap();
        db.insert_row("users", [("id", json!(2)), ("name", json!("ada"))])
            .unwrap();

        let err = db
            .execute(&Statement::CreateIndex(
                IndexDefinition::new("idx_users_name", "users", ["name"]).unique(),
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate key"));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let mut db = MemoryDatabase::postgres();
        db.fail_on("CREATE TABLE");
        let err = db
            .execute(&Statement::CreateTable(users()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("injected failure"));
        assert!(db.schema().is_empty());
        assert!(db.journal().is_empty());
    }

    #[tokio::test]
    async fn test_log_pop_only_removes_tail() {
        let mut db = MemoryDatabase::postgres();
        db.append(&MigrationLogEntry::new("1", "first", "a", Vec::new()))
            .await
            .unwrap();
        db.append(&MigrationLogEntry::new("2", "second", "b", Vec::new()))
            .await
            .unwrap();

        assert!(db.pop("1").await.is_err());
        db.pop("2").await.unwrap();
        assert_eq!(db.last().await.unwrap().map(|e| e.version), Some("1".to_string()));
    }
}
