//! PostgreSQL dialect

use super::{Capabilities, Dialect, Statement};
use crate::schema::{ColumnType, TypeKind};

/// PostgreSQL: everything in place except primary key changes
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            alter_column: true,
            alter_primary_key: false,
            drop_column: true,
            add_constrained_column: true,
            transactional_ddl: true,
        }
    }

    fn type_name(&self, column_type: &ColumnType) -> String {
        match column_type.kind {
            TypeKind::Json => "JSONB".to_string(),
            TypeKind::Blob => "BYTEA".to_string(),
            _ => column_type.to_string(),
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
            Statement::AlterColumn { table, from, to } => {
                let prefix = format!(
                    "ALTER TABLE {} ALTER COLUMN {}",
                    self.quote_ident(table),
                    self.quote_ident(&to.name)
                );
                let mut sql = Vec::new();

                if from.column_type != to.column_type {
                    let ty = self.type_name(&to.column_type);
                    sql.push(format!(
                        "{} TYPE {} USING {}::{}",
                        prefix,
                        ty,
                        self.quote_ident(&to.name),
                        ty
                    ));
                }
                if from.nullable != to.nullable {
                    let action = if to.nullable { "DROP" } else { "SET" };
                    sql.push(format!("{} {} NOT NULL", prefix, action));
                }
                if from.default != to.default {
                    match &to.default {
                        Some(default) => sql.push(format!("{} SET DEFAULT {}", prefix, default)),
                        None => sql.push(format!("{} DROP DEFAULT", prefix)),
                    }
                }
                if from.unique != to.unique {
                    if to.unique {
                        sql.push(format!(
                            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
                            self.quote_ident(table),
                            self.quote_ident(&format!("{}_{}_key", table, to.name)),
                            self.quote_ident(&to.name)
                        ));
                    } else {
                        sql.push(drop_unique_sql(table, &to.name));
                    }
                }
                sql
            }
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

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Drop the single-column UNIQUE constraint on `table.column`, looked up by
/// column so renamed tables and rebuilt shadows keep working
fn drop_unique_sql(table: &str, column: &str) -> String {
    let table = quote_literal(table);
    let column = quote_literal(column);
    format!(
        "DO $$DECLARE con text; BEGIN \
         SELECT c.conname INTO con FROM pg_constraint c \
         JOIN pg_class t ON t.oid = c.conrelid \
         JOIN pg_namespace n ON n.oid = t.relnamespace \
         JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = c.conkey[1] \
         WHERE n.nspname = current_schema() AND t.relname = {table} AND a.attname = {column} \
         AND c.contype = 'u' AND array_length(c.conkey, 1) = 1 LIMIT 1; \
         IF con IS NULL THEN RAISE EXCEPTION 'no unique constraint on %.%', {table}, {column}; END IF; \
         EXECUTE format('ALTER TABLE %I DROP CONSTRAINT %I', {table}, con); \
         END$$",
        table = table,
        column = column
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDefinition, TableDefinition};

    #[test]
    fn test_create_table() {
        let table = TableDefinition::new(
            "users",
            vec![
                ColumnDefinition::new("id", ColumnType::integer()).primary_key(),
                ColumnDefinition::new("name", ColumnType::varchar(100)).not_null(),
                ColumnDefinition::new("settings", ColumnType::new(TypeKind::Json)),
            ],
        );
        let sql = PostgresDialect.render(&Statement::CreateTable(table));
        assert_eq!(
            sql,
            vec![r#"CREATE TABLE "users" ("id" INTEGER PRIMARY KEY NOT NULL, "name" VARCHAR(100) NOT NULL, "settings" JSONB)"#]
        );
    }

    #[test]
    fn test_alter_column_emits_one_statement_per_change() {
        let from = ColumnDefinition::new("age", ColumnType::integer());
        let to = ColumnDefinition::new("age", ColumnType::bigint())
            .not_null()
            .default_value("0");
        let sql = PostgresDialect.render(&Statement::AlterColumn {
            table: "users".to_string(),
            from,
            to,
        });
        assert_eq!(
            sql,
            vec![
                r#"ALTER TABLE "users" ALTER COLUMN "age" TYPE BIGINT USING "age"::BIGINT"#,
                r#"ALTER TABLE "users" ALTER COLUMN "age" SET NOT NULL"#,
                r#"ALTER TABLE "users" ALTER COLUMN "age" SET DEFAULT 0"#,
            ]
        );
    }

    #[test]
    fn test_dropping_unique_looks_up_constraint_name() {
        let from = ColumnDefinition::new("email", ColumnType::varchar(255)).unique();
        let to = ColumnDefinition::new("email", ColumnType::varchar(255));
        let sql = PostgresDialect.render(&Statement::AlterColumn {
            table: "users".to_string(),
            from,
            to,
        });

        assert_eq!(sql.len(), 1);
        assert!(sql[0].starts_with("DO $$"));
        assert!(sql[0].contains("t.relname = 'users' AND a.attname = 'email'"));
        assert!(!sql[0].contains("users_email_key"));
        assert!(sql[0].contains("EXECUTE format('ALTER TABLE %I DROP CONSTRAINT %I', 'users', con)"));
    }

    #[test]
    fn test_literal_quoting() {
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_composite_primary_key() {
        let table = TableDefinition::new(
            "memberships",
            vec![
                ColumnDefinition::new("user_id", ColumnType::integer()).primary_key(),
                ColumnDefinition::new("team_id", ColumnType::integer()).primary_key(),
            ],
        );
        let sql = PostgresDialect.create_table_sql(&table);
        assert!(sql.ends_with(r#"PRIMARY KEY ("user_id", "team_id"))"#));
        assert!(!sql.contains("INTEGER PRIMARY KEY"));
    }
}
