//! SQLite dialect
//!
//! SQLite cannot alter or drop columns in place and refuses constrained
//! `ADD COLUMN`; the executor rebuilds the table for those operations.

use super::{Capabilities, Dialect, Statement};

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            alter_column: false,
            alter_primary_key: false,
            drop_column: false,
            add_constrained_column: false,
            transactional_ddl: true,
        }
    }

    fn render(&self, statement: &Statement) -> Vec<String> {
        match statement {
            Statement::CreateTable(table) => vec![self.create_table_sql(table)],
            Statement::DropTable { table } => {
                vec![format!("DROP TABLE {}", self.quote_ident(table))]
            }
            Statement::RenameTable { from, to } => vec![format!(
                "ALTER TABLE {} RENAME TO {}",
                self.quote_ident(from),
                self.quote_ident(to)
            )],
            Statement::AddColumn { table, column } => vec![format!(
                "ALTER TABLE {} ADD COLUMN {}",
                self.quote_ident(table),
                self.column_sql(column, true)
            )],
            Statement::DropColumn { table, column } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                self.quote_ident(table),
                self.quote_ident(column)
            )],
            // Never emitted: the executor rebuilds instead
            Statement::AlterColumn { table, to, .. } => vec![format!(
                "-- sqlite cannot alter {}.{} in place",
                table, to.name
            )],
            Statement::CreateIndex(index) => vec![self.create_index_sql(index)],
            Statement::DropIndex { name, .. } => {
                vec![format!("DROP INDEX {}", self.quote_ident(name))]
            }
            Statement::CopyRows { from, to, columns } => {
                vec![self.copy_rows_sql(from, to, columns)]
            }
            Statement::Raw(sql) => vec![sql.clone()],
        }
    }
}
