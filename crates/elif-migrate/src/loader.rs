//! Descriptor Loader - YAML migration files and rename maps
//!
//! A migration file holds a version, a description and either an ordered
//! `operations` list or a `script` name:
//!
//! ```yaml
//! version: "20250101120000"
//! description: create users
//! operations:
//!   - op: create_table
//!     table:
//!       name: users
//!       columns:
//!         - { name: id, type: INTEGER, primary_key: true }
//! ```
//!
//! A `changes` list of single-key maps is read the same way as
//! `operations`, with the key naming the operation:
//!
//! ```yaml
//! changes:
//!   - drop_column: { table: users, column: email }
//!   - rename_table: { from: legacy_users, to: users }
//! ```
//!
//! When `version` or `description` is omitted it is taken from the file
//! name, `<version>_<description>.yaml`.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;

use crate::descriptor::{MigrationBody, MigrationDescriptor, ScriptRef};
use crate::error::{MigrateError, MigrateResult};
use crate::operation::Operation;
use crate::schema::RenameMap;

/// On-disk shape of a migration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DescriptorFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    operations: Option<Vec<Operation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    changes: Option<Vec<Mapping>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script: Option<String>,
}

/// Turn `{kind: {fields}}` into the tagged operation it names
fn change_to_operation(change: Mapping) -> Result<Operation, String> {
    let mut entries = change.into_iter();
    let (kind, payload) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => return Err("a change must be a map with exactly one key".to_string()),
    };
    let name = kind.as_str().unwrap_or_default().to_string();

    let mut fields = match payload {
        Value::Mapping(fields) => fields,
        Value::Null => Mapping::new(),
        _ => return Err(format!("change '{}' must map to its fields", name)),
    };
    fields.insert(Value::String("op".to_string()), kind);
    serde_yaml::from_value(Value::Mapping(fields)).map_err(|e| format!("change '{}': {}", name, e))
}

/// Load one migration file
pub fn load_descriptor(path: impl AsRef<Path>) -> MigrateResult<MigrationDescriptor> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let file: DescriptorFile = serde_yaml::from_str(&content).map_err(|e| {
        MigrateError::Descriptor(format!("{}: {}", path.display(), e))
    })?;

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let (stem_version, stem_description) = match stem.split_once('_') {
        Some((version, rest)) => (version, rest.replace('_', " ")),
        None => (stem, String::new()),
    };

    let version = file
        .version
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| stem_version.to_string());
    if version.is_empty() {
        return Err(MigrateError::Descriptor(format!(
            "{}: migration has no version",
            path.display()
        )));
    }
    let description = file.description.unwrap_or(stem_description);

    let operations = match (file.operations, file.changes) {
        (Some(_), Some(_)) => {
            return Err(MigrateError::Descriptor(format!(
                "{}: a migration has either operations or changes, not both",
                path.display()
            )))
        }
        (Some(operations), None) => Some(operations),
        (None, Some(changes)) => Some(
            changes
                .into_iter()
                .enumerate()
                .map(|(i, change)| {
                    change_to_operation(change).map_err(|e| {
                        MigrateError::Descriptor(format!("{}: change {}: {}", path.display(), i + 1, e))
                    })
                })
                .collect::<MigrateResult<Vec<_>>>()?,
        ),
        (None, None) => None,
    };

    let body = match (operations, file.script) {
        (Some(operations), None) => MigrationBody::Declarative(operations),
        (None, Some(name)) => MigrationBody::Scripted(ScriptRef { name }),
        (Some(_), Some(_)) => {
            return Err(MigrateError::Descriptor(format!(
                "{}: a migration has either operations or a script, not both",
                path.display()
            )))
        }
        (None, None) => {
            return Err(MigrateError::Descriptor(format!(
                "{}: migration has neither operations nor a script",
                path.display()
            )))
        }
    };

    Ok(MigrationDescriptor {
        version,
        description,
        body,
    })
}

/// Load every `.yaml`/`.yml` migration in a directory, sorted by version
pub fn load_descriptors(dir: impl AsRef<Path>) -> MigrateResult<Vec<MigrationDescriptor>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut descriptors = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path
            .extension()
            .map_or(false, |ext| ext == "yaml" || ext == "yml")
        {
            descriptors.push(load_descriptor(&path)?);
        }
    }

    // Sort by version (timestamp)
    descriptors.sort_by(|a, b| a.version.cmp(&b.version));
    if let Some(pair) = descriptors.windows(2).find(|w| w[0].version == w[1].version) {
        return Err(MigrateError::Descriptor(format!(
            "duplicate migration version {} in {}",
            pair[0].version,
            dir.display()
        )));
    }

    tracing::debug!("Loaded {} migrations from {}", descriptors.len(), dir.display());
    Ok(descriptors)
}

/// Load an `old: new` table rename map, either at the top level or under a
/// `table_renames` key; a missing file is an empty map
pub fn load_rename_map(path: impl AsRef<Path>) -> MigrateResult<RenameMap> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(RenameMap::new());
    }

    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(RenameMap::new());
    }
    let mut value: Value = serde_yaml::from_str(&content)?;
    if let Some(renames) = value.get("table_renames").cloned() {
        value = renames;
    }
    if value.is_null() {
        return Ok(RenameMap::new());
    }
    let map: RenameMap = serde_yaml::from_value(value)?;
    map.validate()
        .map_err(|e| MigrateError::Descriptor(format!("{}: {}", path.display(), e)))?;
    Ok(map)
}

/// Write a descriptor as `<dir>/<version>_<description>.yaml`
pub fn write_descriptor(
    dir: impl AsRef<Path>,
    descriptor: &MigrationDescriptor,
) -> MigrateResult<std::path::PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let slug: String = descriptor
        .description
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let filename = if slug.is_empty() {
        format!("{}.yaml", descriptor.version)
    } else {
        format!("{}_{}.yaml", descriptor.version, slug)
    };

    let (operations, script) = match &descriptor.body {
        MigrationBody::Declarative(operations) => (Some(operations.clone()), None),
        MigrationBody::Scripted(script) => (None, Some(script.name.clone())),
    };
    let file = DescriptorFile {
        version: Some(descriptor.version.clone()),
        description: Some(descriptor.description.clone()),
        operations,
        changes: None,
        script,
    };

    let path = dir.join(filename);
    fs::write(&path, serde_yaml::to_string(&file)?)?;
    Ok(path)
}
