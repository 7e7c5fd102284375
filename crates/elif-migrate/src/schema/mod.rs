//! Schema Model
//!
//! Typed representation of a database structure: tables, columns and
//! indexes, plus the lookup and equality rules the diff engine relies on.

mod simulate;
mod types;

pub use types::{ColumnType, TypeKind, DEFAULT_TIME_PRECISION};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::SchemaError;

fn default_true() -> bool {
    true
}

/// A single column. Immutable: changes produce a new definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Default as a SQL expression, e.g. `0`, `'draft'` or `CURRENT_TIMESTAMP`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
}

impl ColumnDefinition {
    /// Create a nullable column without default or constraints
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
            primary_key: false,
            unique: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Primary key columns are never nullable
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }

    pub fn with_type(mut self, column_type: ColumnType) -> Self {
        self.column_type = column_type;
        self
    }
}

/// An index on one table. Identity is name + column list + uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    /// Owning table; may be omitted in descriptors where the table is implied
    #[serde(default)]
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new<I, S>(name: impl Into<String>, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn references_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// A table: ordered columns, a set of indexes and the primary key column list
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default)]
    pub primary_key: Vec<String>,
}

impl TableDefinition {
    /// Create a table, deriving the primary key from the column flags
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDefinition>) -> Self {
        let primary_key = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect();
        Self {
            name: name.into(),
            columns,
            indexes: Vec::new(),
            primary_key,
        }
    }

    /// Add an index owned by this table
    pub fn with_index(mut self, mut index: IndexDefinition) -> Self {
        index.table = self.name.clone();
        self.indexes.push(index);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn index(&self, name: &str) -> Option<&IndexDefinition> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Fill defaults that descriptors may omit: owning table on indexes and
    /// the primary key list when only column flags are given
    pub fn normalized(mut self) -> Self {
        for index in &mut self.indexes {
            if index.table.is_empty() {
                index.table = self.name.clone();
            }
        }
        if self.primary_key.is_empty() {
            self.primary_key = self
                .columns
                .iter()
                .filter(|c| c.primary_key)
                .map(|c| c.name.clone())
                .collect();
        }
        for column in &mut self.columns {
            if column.primary_key {
                column.nullable = false;
            }
        }
        self
    }

    /// Same table under another name; indexes follow the table
    pub fn renamed(mut self, name: &str) -> Self {
        self.name = name.to_string();
        for index in &mut self.indexes {
            index.table = name.to_string();
        }
        self
    }

    /// Check name uniqueness and primary key consistency
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut seen = BTreeSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::DuplicateColumn {
                    table: self.name.clone(),
                    column: column.name.clone(),
                });
            }
        }

        let mut index_names = BTreeSet::new();
        for index in &self.indexes {
            if !index_names.insert(index.name.as_str()) {
                return Err(SchemaError::DuplicateIndex {
                    table: self.name.clone(),
                    index: index.name.clone(),
                });
            }
            if let Some(missing) = index.columns.iter().find(|c| !self.has_column(c)) {
                return Err(SchemaError::UnknownIndexColumn {
                    index: index.name.clone(),
                    table: self.name.clone(),
                    column: missing.clone(),
                });
            }
        }

        let flagged: BTreeSet<&str> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect();
        let declared: BTreeSet<&str> = self.primary_key.iter().map(String::as_str).collect();
        if flagged != declared {
            return Err(SchemaError::PrimaryKeyMismatch(self.name.clone()));
        }
        Ok(())
    }
}

impl PartialEq for TableDefinition {
    /// Columns compare by name (in-place ADD COLUMN appends, so position is not
    /// identity); indexes compare as a set
    fn eq(&self, other: &Self) -> bool {
        if self.name != other.name || self.columns.len() != other.columns.len() {
            return false;
        }
        let columns_match = self
            .columns
            .iter()
            .all(|c| other.column(&c.name) == Some(c));
        let indexes_match = self.indexes.len() == other.indexes.len()
            && self.indexes.iter().all(|i| other.index(&i.name) == Some(i));
        let pk: BTreeSet<&String> = self.primary_key.iter().collect();
        let other_pk: BTreeSet<&String> = other.primary_key.iter().collect();
        columns_match && indexes_match && pk == other_pk
    }
}

/// Table name → definition, either declared or introspected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaSnapshot {
    tables: BTreeMap<String, TableDefinition>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: impl IntoIterator<Item = TableDefinition>) -> Self {
        let mut snapshot = Self::new();
        for table in tables {
            snapshot.insert(table);
        }
        snapshot
    }

    pub fn with_table(mut self, table: TableDefinition) -> Self {
        self.insert(table);
        self
    }

    pub fn insert(&mut self, table: TableDefinition) -> Option<TableDefinition> {
        self.tables.insert(table.name.clone(), table)
    }

    pub fn remove(&mut self, name: &str) -> Option<TableDefinition> {
        self.tables.remove(name)
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDefinition> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Copy of this snapshot without the given tables
    pub fn without<'a>(&self, ignored: impl IntoIterator<Item = &'a String>) -> Self {
        let mut copy = self.clone();
        for name in ignored {
            copy.tables.remove(name);
        }
        copy
    }

    /// Drop tables whose name starts with a prefix (rebuild leftovers)
    pub fn without_prefix(mut self, prefix: &str) -> Self {
        if !prefix.is_empty() {
            self.tables.retain(|name, _| !name.starts_with(prefix));
        }
        self
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Option<&mut TableDefinition> {
        self.tables.get_mut(name)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        for (name, table) in &self.tables {
            if name != &table.name {
                return Err(SchemaError::MisregisteredTable {
                    table: table.name.clone(),
                    key: name.clone(),
                });
            }
            table.validate()?;
        }
        Ok(())
    }
}

/// Old table name → new table name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenameMap {
    renames: BTreeMap<String, String>,
}

impl RenameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.insert(from, to);
        self
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.renames.insert(from.into(), to.into());
    }

    pub fn get(&self, from: &str) -> Option<&String> {
        self.renames.get(from)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.renames.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
    }

    /// Reject maps where two tables become one, or a rename chains into another
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut targets = BTreeSet::new();
        for (from, to) in &self.renames {
            if from == to {
                return Err(SchemaError::SelfRename(from.clone()));
            }
            if !targets.insert(to) {
                return Err(SchemaError::RenameCollision(to.clone()));
            }
        }
        if let Some(chained) = self.renames.values().find(|to| self.renames.contains_key(*to)) {
            return Err(SchemaError::ChainedRename(chained.clone()));
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for RenameMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            renames: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDefinition {
        TableDefinition::new(
            "users",
            vec![
                ColumnDefinition::new("id", ColumnType::integer()).primary_key(),
                ColumnDefinition::new("name", ColumnType::varchar(100)).not_null(),
                ColumnDefinition::new("age", ColumnType::integer()),
            ],
        )
        .with_index(IndexDefinition::new("idx_users_name", "", ["name"]))
    }

    #[test]
    fn test_primary_key_is_derived() {
        let table = users();
        assert_eq!(table.primary_key, vec!["id".to_string()]);
        assert!(!table.column("id").unwrap().nullable);
        assert_eq!(table.indexes[0].table, "users");
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_equality_ignores_column_position() {
        let mut reordered = users();
        reordered.columns.reverse();
        assert_eq!(users(), reordered);

        let mut changed = users();
        changed.columns[2] = changed.columns[2].clone().not_null();
        assert_ne!(users(), changed);
    }

    #[test]
    fn test_validate_rejects_inconsistent_primary_key() {
        let mut table = users();
        table.primary_key.clear();
        assert_eq!(
            table.validate().unwrap_err(),
            SchemaError::PrimaryKeyMismatch("users".to_string())
        );

        let table = users().with_index(IndexDefinition::new("idx_missing", "", ["missing"]));
        assert!(matches!(
            table.validate().unwrap_err(),
            SchemaError::UnknownIndexColumn { column, .. } if column == "missing"
        ));
    }

    #[test]
    fn test_renamed_table_moves_indexes() {
        let table = users().renamed("members");
        assert_eq!(table.name, "members");
        assert_eq!(table.indexes[0].table, "members");
    }

    #[test]
    fn test_rename_map_conflicts() {
        let ok = RenameMap::new().with("legacy_users", "users");
        assert!(ok.validate().is_ok());

        let duplicate = RenameMap::new().with("a", "users").with("b", "users");
        assert_eq!(
            duplicate.validate().unwrap_err(),
            SchemaError::RenameCollision("users".to_string())
        );

        let chained = RenameMap::new().with("a", "b").with("b", "c");
        assert_eq!(
            chained.validate().unwrap_err(),
            SchemaError::ChainedRename("b".to_string())
        );
    }

    #[test]
    fn test_table_definition_from_yaml_is_normalized() {
        let yaml = r#"
name: posts
columns:
  - name: id
    type: INTEGER
    primary_key: true
  - name: title
    type: VARCHAR(200)
indexes:
  - name: idx_posts_title
    columns: [title]
"#;
        let table: TableDefinition = serde_yaml::from_str(yaml).unwrap();
        let table = table.normalized();
        assert_eq!(table.primary_key, vec!["id".to_string()]);
        assert_eq!(table.indexes[0].table, "posts");
        assert!(table.column("title").unwrap().nullable);
        assert!(table.validate().is_ok());
    }
}
