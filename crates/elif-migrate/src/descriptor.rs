//! Migration descriptors and resolved plans

use serde::{Deserialize, Serialize};

use crate::operation::Operation;

/// Reference to a registered migration script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRef {
    pub name: String,
}

/// Body of a migration: an explicit operation list or a scripted procedure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationBody {
    Declarative(Vec<Operation>),
    Scripted(ScriptRef),
}

/// A versioned migration, immutable once loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDescriptor {
    /// Lexicographically ordered version, e.g. `20250101120000`
    pub version: String,
    pub description: String,
    pub body: MigrationBody,
}

impl MigrationDescriptor {
    pub fn declarative(
        version: impl Into<String>,
        description: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            version: version.into(),
            description: description.into(),
            body: MigrationBody::Declarative(operations),
        }
    }

    pub fn scripted(
        version: impl Into<String>,
        description: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            description: description.into(),
            body: MigrationBody::Scripted(ScriptRef {
                name: script.into(),
            }),
        }
    }

    /// Generate a timestamp version, the way migration files are named
    pub fn timestamp_version() -> String {
        chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
    }

    /// blake3 hex digest of the canonical JSON of the body
    pub fn checksum(&self) -> String {
        // Serializing plain data into a Vec cannot fail
        let canonical = serde_json::to_vec(&self.body).unwrap_or_default();
        blake3::hash(&canonical).to_hex().to_string()
    }
}

/// A descriptor resolved to the ordered operations the applier runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub version: String,
    pub description: String,
    pub checksum: String,
    pub steps: Vec<Operation>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_tracks_content() {
        let a = MigrationDescriptor::declarative(
            "1",
            "drop legacy",
            vec![Operation::DropTable {
                table: "legacy".to_string(),
                reverse: None,
            }],
        );
        let mut b = a.clone();
        b.description = "same body, new description".to_string();
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);

        let c = MigrationDescriptor::scripted("1", "drop legacy", "drop_legacy");
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn test_timestamp_version_shape() {
        let version = MigrationDescriptor::timestamp_version();
        assert_eq!(version.len(), 14);
        assert!(version.chars().all(|c| c.is_ascii_digit()));
    }
}
