//! SQL dialects
//!
//! The executor never builds SQL text itself: it emits structured
//! [`Statement`] values and asks the backend's [`Dialect`] to render them.
//! What a dialect can do in place is described by [`Capabilities`].

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

use std::fmt;

use crate::schema::{ColumnDefinition, ColumnType, IndexDefinition, TableDefinition};

/// A single structural statement, rendered to SQL by a dialect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Create a table with its columns and primary key; indexes are separate
    CreateTable(TableDefinition),
    DropTable { table: String },
    RenameTable { from: String, to: String },
    AddColumn { table: String, column: ColumnDefinition },
    DropColumn { table: String, column: String },
    AlterColumn {
        table: String,
        from: ColumnDefinition,
        to: ColumnDefinition,
    },
    CreateIndex(IndexDefinition),
    DropIndex { table: String, name: String },
    /// `INSERT INTO to (columns) SELECT columns FROM from`
    CopyRows {
        from: String,
        to: String,
        columns: Vec<String>,
    },
    /// Verbatim SQL, used by scripted migrations
    Raw(String),
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::CreateTable(table) => write!(f, "CREATE TABLE {}", table.name),
            Statement::DropTable { table } => write!(f, "DROP TABLE {}", table),
            Statement::RenameTable { from, to } => write!(f, "RENAME {} TO {}", from, to),
            Statement::AddColumn { table, column } => {
                write!(f, "ADD COLUMN {}.{}", table, column.name)
            }
            Statement::DropColumn { table, column } => {
                write!(f, "DROP COLUMN {}.{}", table, column)
            }
            Statement::AlterColumn { table, to, .. } => {
                write!(f, "ALTER COLUMN {}.{}", table, to.name)
            }
            Statement::CreateIndex(index) => write!(f, "CREATE INDEX {}", index.name),
            Statement::DropIndex { name, .. } => write!(f, "DROP INDEX {}", name),
            Statement::CopyRows { from, to, .. } => write!(f, "COPY ROWS {} -> {}", from, to),
            Statement::Raw(sql) => write!(f, "{}", sql),
        }
    }
}

/// What a database can change without rebuilding the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Change type, nullability, default or uniqueness of a column in place
    pub alter_column: bool,
    /// Add or remove a column from the primary key in place
    pub alter_primary_key: bool,
    pub drop_column: bool,
    /// Add a column that is primary key, unique, or NOT NULL without default
    pub add_constrained_column: bool,
    /// DDL participates in transactions
    pub transactional_ddl: bool,
}

impl Capabilities {
    /// Whether `from` can be changed into `to` without a rebuild
    pub fn supports_alter(&self, from: &ColumnDefinition, to: &ColumnDefinition) -> bool {
        if from.primary_key != to.primary_key && !self.alter_primary_key {
            return false;
        }
        self.alter_column
    }

    /// Whether the column can be appended with ADD COLUMN
    pub fn supports_add(&self, column: &ColumnDefinition) -> bool {
        let constrained = column.primary_key
            || column.unique
            || (!column.nullable && column.default.is_none());
        !constrained || self.add_constrained_column
    }

    pub fn supports_drop(&self) -> bool {
        self.drop_column
    }
}

/// A SQL dialect: capability query plus statement rendering
pub trait Dialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Quote an identifier
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Spelling of a column type in this dialect
    fn type_name(&self, column_type: &ColumnType) -> String {
        column_type.to_string()
    }

    /// Render a statement to one or more SQL strings, executed in order
    fn render(&self, statement: &Statement) -> Vec<String>;

    /// Column clause used by CREATE TABLE and ADD COLUMN
    fn column_sql(&self, column: &ColumnDefinition, inline_primary_key: bool) -> String {
        let mut sql = format!(
            "{} {}",
            self.quote_ident(&column.name),
            self.type_name(&column.column_type)
        );
        if column.primary_key && inline_primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        if column.unique && !column.primary_key {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = &column.default {
            sql.push_str(&format!(" DEFAULT {}", default));
        }
        sql
    }

    /// Full CREATE TABLE statement for the table's columns and primary key
    fn create_table_sql(&self, table: &TableDefinition) -> String {
        let inline_pk = table.primary_key.len() == 1;
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|c| self.column_sql(c, inline_pk))
            .collect();
        if table.primary_key.len() > 1 {
            let keys: Vec<String> = table.primary_key.iter().map(|k| self.quote_ident(k)).collect();
            parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }
        format!(
            "CREATE TABLE {} ({})",
            self.quote_ident(&table.name),
            parts.join(", ")
        )
    }

    fn create_index_sql(&self, index: &IndexDefinition) -> String {
        let columns: Vec<String> = index.columns.iter().map(|c| self.quote_ident(c)).collect();
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote_ident(&index.name),
            self.quote_ident(&index.table),
            columns.join(", ")
        )
    }

    fn copy_rows_sql(&self, from: &str, to: &str, columns: &[String]) -> String {
        let columns: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        let list = columns.join(", ");
        format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            self.quote_ident(to),
            list,
            list,
            self.quote_ident(from)
        )
    }
}
