//! SQLite backend
//!
//! Introspects `sqlite_master` and the `pragma_*` table-valued functions.
//! SQLite has transactional DDL, so a rebuild runs inside the migration's
//! transaction like any other statement.

use async_trait::async_trait;
use sqlx::{Connection, Executor, Row, SqliteConnection};

use super::{render_traced, Database};
use crate::config::DEFAULT_LOG_TABLE;
use crate::dialect::{Dialect, SqliteDialect, Statement};
use crate::error::BackendError;
use crate::log::{MigrationLog, MigrationLogEntry};
use crate::schema::{ColumnDefinition, ColumnType, IndexDefinition, SchemaSnapshot, TableDefinition, TypeKind};

/// SQLite connection used for migrations
pub struct SqliteDatabase {
    conn: SqliteConnection,
    log_table: String,
}

impl SqliteDatabase {
    pub fn new(conn: SqliteConnection) -> Self {
        Self {
            conn,
            log_table: DEFAULT_LOG_TABLE.to_string(),
        }
    }

    /// Connect to a database URL such as `sqlite://app.db`
    pub async fn connect(database_url: &str) -> Result<Self, BackendError> {
        let conn = SqliteConnection::connect(database_url).await?;
        Ok(Self::new(conn))
    }

    /// Private in-memory database, living as long as this connection
    pub async fn in_memory() -> Result<Self, BackendError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn with_log_table(mut self, table: impl Into<String>) -> Self {
        self.log_table = table.into();
        self
    }

    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    async fn run(&mut self, sql: &str) -> Result<(), BackendError> {
        self.conn.execute(sql).await?;
        Ok(())
    }

    fn log_table(&self) -> String {
        SqliteDialect.quote_ident(&self.log_table)
    }

    async fn read_table(&mut self, name: String) -> Result<TableDefinition, BackendError> {
        let mut table = TableDefinition::new(name, Vec::new());

        let columns = sqlx::query(
            "SELECT name, type, \"notnull\" AS not_null, dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
        )
        .bind(&table.name)
        .fetch_all(&mut self.conn)
        .await?;

        let mut primary_key: Vec<(i64, String)> = Vec::new();
        for row in columns {
            let name: String = row.try_get("name")?;
            let raw_type: String = row.try_get("type")?;
            let not_null: i64 = row.try_get("not_null")?;
            let pk: i64 = row.try_get("pk")?;

            if pk > 0 {
                primary_key.push((pk, name.clone()));
            }
            table.columns.push(ColumnDefinition {
                column_type: ColumnType::parse(&raw_type)
                    .unwrap_or_else(|_| ColumnType::new(TypeKind::Other(raw_type.to_uppercase()))),
                nullable: not_null == 0 && pk == 0,
                default: row.try_get("dflt_value")?,
                primary_key: pk > 0,
                unique: false,
                name,
            });
        }
        primary_key.sort();
        table.primary_key = primary_key.into_iter().map(|(_, name)| name).collect();

        let indexes = sqlx::query("SELECT name, \"unique\" AS is_unique, origin FROM pragma_index_list(?1)")
            .bind(&table.name)
            .fetch_all(&mut self.conn)
            .await?;

        for row in indexes {
            let index_name: String = row.try_get("name")?;
            let unique: i64 = row.try_get("is_unique")?;
            let origin: String = row.try_get("origin")?;
            if origin == "pk" {
                continue;
            }

            let columns: Vec<String> = sqlx::query("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
                .bind(&index_name)
                .fetch_all(&mut self.conn)
                .await?
                .iter()
                .map(|r| r.try_get("name"))
                .collect::<Result<_, _>>()?;

            if origin == "u" {
                // Inline UNIQUE constraint
                if let [single] = columns.as_slice() {
                    if let Some(column) = table.columns.iter_mut().find(|c| &c.name == single) {
                        column.unique = true;
                    }
                }
                continue;
            }

            let mut index = IndexDefinition::new(index_name, table.name.clone(), columns);
            index.unique = unique != 0;
            table.indexes.push(index);
        }

        Ok(table)
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn dialect(&self) -> &'static dyn Dialect {
        &SqliteDialect
    }

    async fn read_schema(&mut self) -> Result<SchemaSnapshot, BackendError> {
        let names: Vec<String> = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut self.conn)
        .await?
        .iter()
        .map(|r| r.try_get("name"))
        .collect::<Result<_, _>>()?;

        let mut snapshot = SchemaSnapshot::new();
        for name in names {
            snapshot.insert(self.read_table(name).await?);
        }
        Ok(snapshot)
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        self.run("BEGIN").await
    }

    async fn execute(&mut self, statement: &Statement) -> Result<(), BackendError> {
        for sql in render_traced(&SqliteDialect, statement) {
            self.run(&sql).await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        self.run("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.run("ROLLBACK").await
    }
}

#[async_trait]
impl MigrationLog for SqliteDatabase {
    async fn ensure_storage(&mut self) -> Result<(), BackendError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                version TEXT PRIMARY KEY NOT NULL, \
                description TEXT NOT NULL, \
                applied_at TEXT NOT NULL, \
                checksum TEXT NOT NULL, \
                payload TEXT NOT NULL)",
            self.log_table()
        );
        self.run(&sql).await
    }

    async fn entries(&mut self) -> Result<Vec<MigrationLogEntry>, BackendError> {
        let sql = format!(
            "SELECT version, description, applied_at, checksum, payload FROM {} ORDER BY version",
            self.log_table()
        );
        let rows = sqlx::query(&sql).fetch_all(&mut self.conn).await?;

        rows.iter()
            .map(|row| {
                let applied_at: String = row.try_get("applied_at")?;
                let payload: String = row.try_get("payload")?;
                MigrationLogEntry::from_record(
                    row.try_get("version")?,
                    row.try_get("description")?,
                    &applied_at,
                    row.try_get("checksum")?,
                    &payload,
                )
            })
            .collect()
    }

    async fn append(&mut self, entry: &MigrationLogEntry) -> Result<(), BackendError> {
        let sql = format!(
            "INSERT INTO {} (version, description, applied_at, checksum, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            self.log_table()
        );
        sqlx::query(&sql)
            .bind(&entry.version)
            .bind(&entry.description)
            .bind(entry.applied_at.to_rfc3339())
            .bind(&entry.checksum)
            .bind(entry.payload()?)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn pop(&mut self, version: &str) -> Result<(), BackendError> {
        match self.last().await? {
            Some(tail) if tail.version == version => {}
            _ => {
                return Err(BackendError::Rejected(format!(
                    "migration {} is not the most recent log entry",
                    version
                )))
            }
        }
        let sql = format!("DELETE FROM {} WHERE version = ?1", self.log_table());
        sqlx::query(&sql).bind(version).execute(&mut self.conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_introspects_columns_and_indexes() {
        let mut db = SqliteDatabase::in_memory().await.unwrap();
        db.run(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email VARCHAR(255) UNIQUE, \
             status VARCHAR(20) NOT NULL DEFAULT 'active', age INTEGER)",
        )
        .await
        .unwrap();
        db.run("CREATE INDEX idx_users_status_age ON users (status, age)")
            .await
            .unwrap();

        let schema = db.read_schema().await.unwrap();
        let users = schema.table("users").unwrap();

        assert_eq!(users.primary_key, vec!["id".to_string()]);
        let id = users.column("id").unwrap();
        assert!(id.primary_key && !id.nullable);
        assert!(users.column("email").unwrap().unique);
        assert_eq!(users.column("email").unwrap().column_type, ColumnType::varchar(255));
        let status = users.column("status").unwrap();
        assert!(!status.nullable);
        assert_eq!(status.default.as_deref(), Some("'active'"));

        assert_eq!(users.indexes.len(), 1);
        assert_eq!(users.indexes[0].columns, vec!["status".to_string(), "age".to_string()]);
        assert!(!users.indexes[0].unique);
    }

    #[tokio::test]
    async fn test_log_storage() {
        let mut db = SqliteDatabase::in_memory().await.unwrap();
        db.ensure_storage().await.unwrap();
        db.ensure_storage().await.unwrap();

        let entry = MigrationLogEntry::new("20250101000000", "create users", "abc", Vec::new());
        db.append(&entry).await.unwrap();

        let entries = db.entries().await.unwrap();
        assert_eq!(entries, vec![entry]);
        assert!(db.read_schema().await.unwrap().contains(DEFAULT_LOG_TABLE));

        db.pop("20250101000000").await.unwrap();
        assert!(db.last().await.unwrap().is_none());
    }
}
