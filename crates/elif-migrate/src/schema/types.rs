//! Dialect-neutral column type descriptors
//!
//! Types are parsed from and rendered to a generic SQL spelling
//! (`VARCHAR(255)`, `NUMERIC(10,2)`, `TIMESTAMPTZ`, ...). Dialects map them to
//! their own vocabulary when rendering DDL and back when introspecting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical kind of a column type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal,
    Boolean,
    Char,
    Varchar,
    Text,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Blob,
    /// A type outside the shared vocabulary, kept verbatim (upper-cased)
    Other(String),
}

/// Column type: kind plus size (length or precision) and scale where relevant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ColumnType {
    pub kind: TypeKind,
    pub size: Option<u32>,
    pub scale: Option<u32>,
}

impl ColumnType {
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            size: None,
            scale: None,
        }
    }

    pub fn with_size(kind: TypeKind, size: u32) -> Self {
        Self {
            kind,
            size: Some(size),
            scale: None,
        }
    }

    pub fn integer() -> Self {
        Self::new(TypeKind::Integer)
    }

    pub fn bigint() -> Self {
        Self::new(TypeKind::BigInt)
    }

    pub fn text() -> Self {
        Self::new(TypeKind::Text)
    }

    pub fn varchar(length: u32) -> Self {
        Self::with_size(TypeKind::Varchar, length)
    }

    pub fn boolean() -> Self {
        Self::new(TypeKind::Boolean)
    }

    pub fn timestamp() -> Self {
        Self::new(TypeKind::Timestamp)
    }

    pub fn decimal(precision: u32, scale: u32) -> Self {
        Self {
            kind: TypeKind::Decimal,
            size: Some(precision),
            scale: Some(scale),
        }
    }

    /// Parse a generic or dialect type spelling such as `character varying(40)`
    pub fn parse(raw: &str) -> Result<Self, String> {
        let normalized = raw.trim().to_uppercase();
        if normalized.is_empty() {
            return Err("empty column type".to_string());
        }

        let (name, args) = match normalized.find('(') {
            Some(open) => {
                let close = normalized
                    .rfind(')')
                    .filter(|close| *close > open)
                    .ok_or_else(|| format!("unbalanced parentheses in type '{}'", raw))?;
                let args: Vec<u32> = normalized[open + 1..close]
                    .split(',')
                    .map(|a| a.trim().parse::<u32>())
                    .collect::<Result<_, _>>()
                    .map_err(|_| format!("invalid type arguments in '{}'", raw))?;
                let suffix = normalized[close + 1..].trim();
                let name = if suffix.is_empty() {
                    normalized[..open].trim().to_string()
                } else {
                    // e.g. TIMESTAMP(3) WITH TIME ZONE
                    format!("{} {}", normalized[..open].trim(), suffix)
                };
                (name, args)
            }
            None => (normalized.clone(), Vec::new()),
        };

        let kind = match name.split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
            "SMALLINT" | "INT2" => TypeKind::SmallInt,
            "INTEGER" | "INT" | "INT4" => TypeKind::Integer,
            "BIGINT" | "INT8" => TypeKind::BigInt,
            "REAL" | "FLOAT4" => TypeKind::Real,
            "DOUBLE" | "DOUBLE PRECISION" | "FLOAT" | "FLOAT8" => TypeKind::Double,
            "DECIMAL" | "NUMERIC" => TypeKind::Decimal,
            "BOOLEAN" | "BOOL" => TypeKind::Boolean,
            "CHAR" | "CHARACTER" | "BPCHAR" => TypeKind::Char,
            "VARCHAR" | "CHARACTER VARYING" => TypeKind::Varchar,
            "TEXT" => TypeKind::Text,
            "DATE" => TypeKind::Date,
            "TIME" | "TIME WITHOUT TIME ZONE" => TypeKind::Time,
            "TIMESTAMP" | "DATETIME" | "TIMESTAMP WITHOUT TIME ZONE" => TypeKind::Timestamp,
            "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => TypeKind::TimestampTz,
            "UUID" => TypeKind::Uuid,
            "JSON" | "JSONB" => TypeKind::Json,
            "BLOB" | "BYTEA" => TypeKind::Blob,
            _ => return Ok(Self::new(TypeKind::Other(normalized))),
        };

        let (size, scale) = match kind {
            TypeKind::Char | TypeKind::Varchar | TypeKind::Decimal => {
                (args.first().copied(), args.get(1).copied())
            }
            // Fractional seconds; 6 is the default and spelled without arguments
            TypeKind::Time | TypeKind::Timestamp | TypeKind::TimestampTz => {
                (args.first().copied().filter(|p| *p != DEFAULT_TIME_PRECISION), None)
            }
            _ => (None, None),
        };
        Ok(Self { kind, size, scale })
    }
}

/// Fractional-second precision used when a time type declares none
pub const DEFAULT_TIME_PRECISION: u32 = 6;

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.kind {
            TypeKind::SmallInt => "SMALLINT",
            TypeKind::Integer => "INTEGER",
            TypeKind::BigInt => "BIGINT",
            TypeKind::Real => "REAL",
            TypeKind::Double => "DOUBLE PRECISION",
            TypeKind::Decimal => "NUMERIC",
            TypeKind::Boolean => "BOOLEAN",
            TypeKind::Char => "CHAR",
            TypeKind::Varchar => "VARCHAR",
            TypeKind::Text => "TEXT",
            TypeKind::Date => "DATE",
            TypeKind::Time => "TIME",
            TypeKind::Timestamp => "TIMESTAMP",
            TypeKind::TimestampTz => "TIMESTAMPTZ",
            TypeKind::Uuid => "UUID",
            TypeKind::Json => "JSON",
            TypeKind::Blob => "BLOB",
            TypeKind::Other(raw) => return write!(f, "{}", raw),
        };

        match (self.size, self.scale) {
            (Some(size), Some(scale)) => write!(f, "{}({},{})", name, size, scale),
            (Some(size), None) => write!(f, "{}({})", name, size),
            _ => write!(f, "{}", name),
        }
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ColumnType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sized_types() {
        assert_eq!(ColumnType::parse("varchar(100)").unwrap(), ColumnType::varchar(100));
        assert_eq!(
            ColumnType::parse("character varying(40)").unwrap(),
            ColumnType::varchar(40)
        );
        assert_eq!(
            ColumnType::parse("NUMERIC(10, 2)").unwrap(),
            ColumnType::decimal(10, 2)
        );
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!(ColumnType::parse("int4").unwrap(), ColumnType::integer());
        assert_eq!(ColumnType::parse("bool").unwrap(), ColumnType::boolean());
        assert_eq!(
            ColumnType::parse("timestamp with time zone").unwrap().kind,
            TypeKind::TimestampTz
        );
        assert_eq!(ColumnType::parse("jsonb").unwrap().kind, TypeKind::Json);
    }

    #[test]
    fn test_display_parses_back() {
        for raw in ["INTEGER", "VARCHAR(255)", "NUMERIC(12,4)", "DOUBLE PRECISION", "TIMESTAMPTZ"] {
            let parsed = ColumnType::parse(raw).unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn test_time_precision_is_kept() {
        let ts = ColumnType::parse("timestamp(3)").unwrap();
        assert_eq!(ts.kind, TypeKind::Timestamp);
        assert_eq!(ts.size, Some(3));
        assert_eq!(ts.to_string(), "TIMESTAMP(3)");

        let tz = ColumnType::parse("TIMESTAMP(0) WITH TIME ZONE").unwrap();
        assert_eq!((tz.kind.clone(), tz.size), (TypeKind::TimestampTz, Some(0)));
        assert_eq!(ColumnType::parse(&tz.to_string()).unwrap(), tz);

        assert_eq!(ColumnType::parse("TIME(6)").unwrap(), ColumnType::new(TypeKind::Time));
        assert_ne!(ColumnType::parse("TIME(2)").unwrap(), ColumnType::new(TypeKind::Time));
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let ty = ColumnType::parse("geometry").unwrap();
        assert_eq!(ty.kind, TypeKind::Other("GEOMETRY".to_string()));
        assert_eq!(ty.to_string(), "GEOMETRY");
    }

    #[test]
    fn test_invalid_types() {
        assert!(ColumnType::parse("").is_err());
        assert!(ColumnType::parse("varchar(abc)").is_err());
        assert!(ColumnType::parse("varchar(10").is_err());
    }
}
