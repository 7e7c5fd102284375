//! Scripted migrations
//!
//! A script is an opaque forward/backward procedure run on the migration's
//! connection and transaction. Its backward half is trusted as authored.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::backend::Database;
use crate::dialect::Statement;
use crate::error::BackendError;
use crate::operation::ScriptDirection;

/// A hand-written migration procedure
#[async_trait]
pub trait MigrationScript: Send + Sync {
    async fn up(&self, db: &mut dyn Database) -> Result<(), BackendError>;

    async fn down(&self, db: &mut dyn Database) -> Result<(), BackendError>;

    /// Run one direction
    async fn run(&self, direction: ScriptDirection, db: &mut dyn Database) -> Result<(), BackendError> {
        match direction {
            ScriptDirection::Up => self.up(db).await,
            ScriptDirection::Down => self.down(db).await,
        }
    }
}

/// A script made of two lists of raw SQL statements
#[derive(Debug, Clone, Default)]
pub struct SqlScript {
    up: Vec<String>,
    down: Vec<String>,
}

impl SqlScript {
    pub fn new<U, D>(up: U, down: D) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            up: up.into_iter().map(Into::into).collect(),
            down: down.into_iter().map(Into::into).collect(),
        }
    }

    async fn run_all(statements: &[String], db: &mut dyn Database) -> Result<(), BackendError> {
        for sql in statements {
            db.execute(&Statement::Raw(sql.clone())).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationScript for SqlScript {
    async fn up(&self, db: &mut dyn Database) -> Result<(), BackendError> {
        Self::run_all(&self.up, db).await
    }

    async fn down(&self, db: &mut dyn Database) -> Result<(), BackendError> {
        Self::run_all(&self.down, db).await
    }
}

/// Scripts by name, supplied by the loader
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: HashMap<String, Arc<dyn MigrationScript>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, script: impl MigrationScript + 'static) {
        self.scripts.insert(name.into(), Arc::new(script));
    }

    pub fn with(mut self, name: impl Into<String>, script: impl MigrationScript + 'static) -> Self {
        self.register(name, script);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MigrationScript>> {
        self.scripts.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scripts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("scripts", &self.names())
            .finish()
    }
}
