//! PostgreSQL backend
//!
//! Introspects `information_schema` and `pg_catalog` for the current schema
//! and runs statements on a single `PgConnection`.

use async_trait::async_trait;
use sqlx::{Connection, Executor, PgConnection, Row};
use std::collections::BTreeMap;

use super::{render_traced, Database};
use crate::config::DEFAULT_LOG_TABLE;
use crate::dialect::{Dialect, PostgresDialect, Statement};
use crate::error::BackendError;
use crate::log::{MigrationLog, MigrationLogEntry};
use crate::schema::{
    ColumnDefinition, ColumnType, IndexDefinition, SchemaSnapshot, TableDefinition, TypeKind,
    DEFAULT_TIME_PRECISION,
};

const TABLES_SQL: &str = "SELECT table_name::text AS table_name \
     FROM information_schema.tables \
     WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
     ORDER BY table_name";

const COLUMNS_SQL: &str = "SELECT table_name::text AS table_name, column_name::text AS column_name, \
     data_type::text AS data_type, udt_name::text AS udt_name, \
     character_maximum_length::int4 AS max_length, numeric_precision::int4 AS precision, \
     numeric_scale::int4 AS scale, datetime_precision::int4 AS time_precision, \
     is_nullable::text AS is_nullable, column_default::text AS column_default \
     FROM information_schema.columns \
     WHERE table_schema = current_schema() \
     ORDER BY table_name, ordinal_position";

const CONSTRAINTS_SQL: &str = "SELECT tc.table_name::text AS table_name, tc.constraint_name::text AS constraint_name, \
     tc.constraint_type::text AS constraint_type, kcu.column_name::text AS column_name \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON tc.constraint_name = kcu.constraint_name \
      AND tc.table_schema = kcu.table_schema \
      AND tc.table_name = kcu.table_name \
     WHERE tc.table_schema = current_schema() AND tc.constraint_type IN ('PRIMARY KEY', 'UNIQUE') \
     ORDER BY tc.table_name, tc.constraint_name, kcu.ordinal_position";

// Plain indexes only: primary keys and constraint-backed indexes are modelled on columns
const INDEXES_SQL: &str = "SELECT t.relname::text AS table_name, i.relname::text AS index_name, \
     ix.indisunique AS is_unique, a.attname::text AS column_name \
     FROM pg_index ix \
     JOIN pg_class t ON t.oid = ix.indrelid \
     JOIN pg_class i ON i.oid = ix.indexrelid \
     JOIN pg_namespace n ON n.oid = t.relnamespace \
     JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) ON true \
     JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
     WHERE n.nspname = current_schema() AND NOT ix.indisprimary \
       AND NOT EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = ix.indexrelid) \
     ORDER BY t.relname, i.relname, k.ord";

/// PostgreSQL connection used for migrations
pub struct PgDatabase {
    conn: PgConnection,
    log_table: String,
}

impl PgDatabase {
    pub fn new(conn: PgConnection) -> Self {
        Self {
            conn,
            log_table: DEFAULT_LOG_TABLE.to_string(),
        }
    }

    /// Connect to a database URL
    pub async fn connect(database_url: &str) -> Result<Self, BackendError> {
        let conn = PgConnection::connect(database_url).await?;
        tracing::info!("Connected to PostgreSQL for migrations");
        Ok(Self::new(conn))
    }

    /// Store the migration log in another table
    pub fn with_log_table(mut self, table: impl Into<String>) -> Self {
        self.log_table = table.into();
        self
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    async fn run(&mut self, sql: &str) -> Result<(), BackendError> {
        self.conn.execute(sql).await?;
        Ok(())
    }

    fn log_table(&self) -> String {
        PostgresDialect.quote_ident(&self.log_table)
    }
}

/// Map `information_schema.columns` type columns onto a column type
fn column_type(
    data_type: &str,
    udt_name: &str,
    max_length: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
    time_precision: Option<i32>,
) -> ColumnType {
    let raw = match data_type {
        "USER-DEFINED" | "ARRAY" => udt_name,
        other => other,
    };
    let mut column_type =
        ColumnType::parse(raw).unwrap_or_else(|_| ColumnType::new(TypeKind::Other(raw.to_uppercase())));

    match column_type.kind {
        TypeKind::Char | TypeKind::Varchar => {
            column_type.size = max_length.and_then(|l| u32::try_from(l).ok());
        }
        TypeKind::Decimal => {
            column_type.size = precision.and_then(|p| u32::try_from(p).ok());
            column_type.scale = scale.and_then(|s| u32::try_from(s).ok());
        }
        TypeKind::Time | TypeKind::Timestamp | TypeKind::TimestampTz => {
            column_type.size = time_precision
                .and_then(|p| u32::try_from(p).ok())
                .filter(|p| *p != DEFAULT_TIME_PRECISION);
        }
        _ => {}
    }
    column_type
}

/// Strip top-level casts PostgreSQL adds to defaults: `'draft'::character varying` -> `'draft'`
fn normalize_default(raw: &str) -> String {
    let mut in_quote = false;
    let mut depth = 0usize;
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => depth = depth.saturating_sub(1),
            b':' if !in_quote && depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                return raw[..i].trim().to_string();
            }
            _ => {}
        }
        i += 1;
    }
    raw.trim().to_string()
}

#[async_trait]
impl Database for PgDatabase {
    fn dialect(&self) -> &'static dyn Dialect {
        &PostgresDialect
    }

    async fn read_schema(&mut self) -> Result<SchemaSnapshot, BackendError> {
        let mut tables: BTreeMap<String, TableDefinition> = BTreeMap::new();

        for row in sqlx::query(TABLES_SQL).fetch_all(&mut self.conn).await? {
            let name: String = row.try_get("table_name")?;
            tables.insert(name.clone(), TableDefinition::new(name, Vec::new()));
        }

        for row in sqlx::query(COLUMNS_SQL).fetch_all(&mut self.conn).await? {
            let table: String = row.try_get("table_name")?;
            let Some(def) = tables.get_mut(&table) else {
                // Views and foreign tables
                continue;
            };
            let data_type: String = row.try_get("data_type")?;
            let udt_name: String = row.try_get("udt_name")?;
            let nullable: String = row.try_get("is_nullable")?;
            let default: Option<String> = row.try_get("column_default")?;

            def.columns.push(ColumnDefinition {
                name: row.try_get("column_name")?,
                column_type: column_type(
                    &data_type,
                    &udt_name,
                    row.try_get("max_length")?,
                    row.try_get("precision")?,
                    row.try_get("scale")?,
                    row.try_get("time_precision")?,
                ),
                nullable: nullable == "YES",
                default: default.as_deref().map(normalize_default),
                primary_key: false,
                unique: false,
            });
        }

        // constraint name -> (table, type, columns)
        let mut constraints: BTreeMap<String, (String, String, Vec<String>)> = BTreeMap::new();
        for row in sqlx::query(CONSTRAINTS_SQL).fetch_all(&mut self.conn).await? {
            let name: String = row.try_get("constraint_name")?;
            let table: String = row.try_get("table_name")?;
            let kind: String = row.try_get("constraint_type")?;
            let column: String = row.try_get("column_name")?;
            constraints
                .entry(name)
                .or_insert_with(|| (table, kind, Vec::new()))
                .2
                .push(column);
        }
        for (name, (table, kind, columns)) in constraints {
            let Some(def) = tables.get_mut(&table) else {
                continue;
            };
            match kind.as_str() {
                "PRIMARY KEY" => {
                    for column in def.columns.iter_mut().filter(|c| columns.contains(&c.name)) {
                        column.primary_key = true;
                        column.nullable = false;
                    }
                    def.primary_key = columns;
                }
                "UNIQUE" if columns.len() == 1 => {
                    if let Some(column) = def.columns.iter_mut().find(|c| c.name == columns[0]) {
                        column.unique = true;
                    }
                }
                _ => tracing::debug!(
                    "Skipping multi-column constraint {} on {}",
                    name,
                    table
                ),
            }
        }

        for row in sqlx::query(INDEXES_SQL).fetch_all(&mut self.conn).await? {
            let table: String = row.try_get("table_name")?;
            let Some(def) = tables.get_mut(&table) else {
                continue;
            };
            let name: String = row.try_get("index_name")?;
            let column: String = row.try_get("column_name")?;
            let unique: bool = row.try_get("is_unique")?;

            match def.indexes.iter_mut().find(|i| i.name == name) {
                Some(index) => index.columns.push(column),
                None => {
                    let mut index = IndexDefinition::new(name, table.clone(), [column]);
                    index.unique = unique;
                    def.indexes.push(index);
                }
            }
        }

        Ok(SchemaSnapshot::from_tables(tables.into_values()))
    }

    async fn begin(&mut self) -> Result<(), BackendError> {
        tracing::debug!("Beginning migration transaction");
        self.run("BEGIN").await
    }

    async fn execute(&mut self, statement: &Statement) -> Result<(), BackendError> {
        for sql in render_traced(&PostgresDialect, statement) {
            self.run(&sql).await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        tracing::debug!("Committing migration transaction");
        self.run("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        tracing::debug!("Rolling back migration transaction");
        self.run("ROLLBACK").await
    }

    async fn lock(&mut self, key: i64) -> Result<(), BackendError> {
        tracing::debug!("Acquiring advisory lock {}", key);
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn unlock(&mut self, key: i64) -> Result<(), BackendError> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MigrationLog for PgDatabase {
    async fn ensure_storage(&mut self) -> Result<(), BackendError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                version TEXT PRIMARY KEY, \
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
            "INSERT INTO {} (version, description, applied_at, checksum, payload) VALUES ($1, $2, $3, $4, $5)",
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
        let sql = format!("DELETE FROM {} WHERE version = $1", self.log_table());
        sqlx::query(&sql).bind(version).execute(&mut self.conn).await?;
        Ok(())
    }
}
