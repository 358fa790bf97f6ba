//! Schema model shared by every backend.
//!
//! A schema is an ordered list of [`SchemaField`]s. Fields are either one of
//! the fixed primitive kinds or a nested record carrying its own ordered
//! child list. Backends never inspect type names directly; they compile the
//! tree with the tables in [`crate::mapping`].

use crate::error::{StorageError, StorageResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Primitive field kinds.
///
/// `Other` keeps an unrecognized type name around so it can be reported;
/// every backend compiles it to its generic string type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    DateTime,
    Date,
    Other(String),
}

impl PrimitiveKind {
    /// Parse a type name, accepting the usual aliases (`str`, `int`, `bool`, ...).
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "str" | "string" => PrimitiveKind::String,
            "int" | "integer" | "int64" => PrimitiveKind::Integer,
            "float" | "float64" | "double" => PrimitiveKind::Float,
            "bool" | "boolean" => PrimitiveKind::Boolean,
            "timestamp" => PrimitiveKind::Timestamp,
            "datetime" => PrimitiveKind::DateTime,
            "date" => PrimitiveKind::Date,
            _ => PrimitiveKind::Other(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PrimitiveKind::String => "string",
            PrimitiveKind::Integer => "integer",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Boolean => "boolean",
            PrimitiveKind::Timestamp => "timestamp",
            PrimitiveKind::DateTime => "datetime",
            PrimitiveKind::Date => "date",
            PrimitiveKind::Other(name) => name,
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Field type: a primitive or a nested record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Primitive(PrimitiveKind),
    Record(Vec<SchemaField>),
}

/// Field mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FieldMode {
    /// Value may be null or absent (default)
    #[default]
    Nullable,
    /// Value must be present and non-null
    Required,
    /// Value is a list of the field type
    Repeated,
}

impl FieldMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldMode::Nullable => "nullable",
            FieldMode::Required => "required",
            FieldMode::Repeated => "repeated",
        }
    }
}

impl fmt::Display for FieldMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FieldMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nullable" => Ok(FieldMode::Nullable),
            "required" => Ok(FieldMode::Required),
            "repeated" => Ok(FieldMode::Repeated),
            _ => Err(format!(
                "Invalid field mode: '{}'. Expected: nullable, required, or repeated",
                s
            )),
        }
    }
}

/// Typed field descriptor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "SchemaFieldDef")]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
    pub mode: FieldMode,
    pub default: Option<Value>,
    pub description: Option<String>,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, kind: PrimitiveKind) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Primitive(kind),
            mode: FieldMode::default(),
            default: None,
            description: None,
        }
    }

    /// Nested record field with an ordered child list.
    pub fn record(name: impl Into<String>, fields: Vec<SchemaField>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Record(fields),
            mode: FieldMode::default(),
            default: None,
            description: None,
        }
    }

    pub fn with_mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn required(self) -> Self {
        self.with_mode(FieldMode::Required)
    }

    pub fn repeated(self) -> Self {
        self.with_mode(FieldMode::Repeated)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Child fields, only for records.
    pub fn children(&self) -> Option<&[SchemaField]> {
        match &self.field_type {
            FieldType::Record(fields) => Some(fields),
            FieldType::Primitive(_) => None,
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self.field_type, FieldType::Record(_))
    }
}

/// Validate field-name uniqueness at every nesting level.
pub fn validate_schema(fields: &[SchemaField]) -> StorageResult<()> {
    validate_level(fields, "")
}

fn validate_level(fields: &[SchemaField], parent: &str) -> StorageResult<()> {
    let mut seen = HashSet::new();
    for field in fields {
        let path = if parent.is_empty() {
            field.name.clone()
        } else {
            format!("{}.{}", parent, field.name)
        };
        if field.name.trim().is_empty() {
            return Err(StorageError::config(format!(
                "Schema field under '{}' has an empty name",
                if parent.is_empty() { "<root>" } else { parent }
            )));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(StorageError::config(format!(
                "Duplicate schema field name: '{}'",
                path
            )));
        }
        if let FieldType::Record(children) = &field.field_type {
            if children.is_empty() {
                return Err(StorageError::config(format!(
                    "Record field '{}' has no child fields",
                    path
                )));
            }
            validate_level(children, &path)?;
        }
    }
    Ok(())
}

/// Serialized form: `{"name": .., "type": .., "mode": .., "fields": [..]}`.
#[derive(Debug, Deserialize)]
struct SchemaFieldDef {
    name: String,
    #[serde(rename = "type", alias = "field_type")]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    fields: Option<Vec<SchemaField>>,
}

impl TryFrom<SchemaFieldDef> for SchemaField {
    type Error = String;

    fn try_from(def: SchemaFieldDef) -> Result<Self, Self::Error> {
        let is_record = matches!(
            def.field_type.to_ascii_lowercase().as_str(),
            "record" | "struct"
        );
        let field_type = match (is_record, def.fields) {
            (true, Some(fields)) => FieldType::Record(fields),
            (true, None) => {
                return Err(format!("Record field '{}' needs a 'fields' list", def.name))
            }
            (false, Some(_)) => {
                return Err(format!(
                    "Field '{}' of type '{}' cannot carry child fields",
                    def.name, def.field_type
                ))
            }
            (false, None) => FieldType::Primitive(PrimitiveKind::parse(&def.field_type)),
        };
        let mode = match def.mode {
            Some(mode) => mode.parse()?,
            None => FieldMode::default(),
        };
        Ok(SchemaField {
            name: def.name,
            field_type,
            mode,
            default: def.default,
            description: def.description,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(PrimitiveKind::parse("str"), PrimitiveKind::String);
        assert_eq!(PrimitiveKind::parse("INT"), PrimitiveKind::Integer);
        assert_eq!(PrimitiveKind::parse("float"), PrimitiveKind::Float);
        assert_eq!(PrimitiveKind::parse("bool"), PrimitiveKind::Boolean);
        assert_eq!(PrimitiveKind::parse("DateTime"), PrimitiveKind::DateTime);
        assert_eq!(
            PrimitiveKind::parse("geography"),
            PrimitiveKind::Other("geography".to_string())
        );
    }

    #[test]
    fn test_validate_rejects_duplicates_per_level() {
        let schema = vec![
            SchemaField::new("id", PrimitiveKind::Integer),
            SchemaField::new("id", PrimitiveKind::String),
        ];
        let err = validate_schema(&schema).unwrap_err();
        assert!(err.is_config());

        // Same name at different levels is fine
        let schema = vec![
            SchemaField::new("id", PrimitiveKind::Integer),
            SchemaField::record("child", vec![SchemaField::new("id", PrimitiveKind::Integer)]),
        ];
        validate_schema(&schema).unwrap();

        let schema = vec![SchemaField::record(
            "child",
            vec![
                SchemaField::new("x", PrimitiveKind::Integer),
                SchemaField::new("x", PrimitiveKind::Float),
            ],
        )];
        let err = validate_schema(&schema).unwrap_err();
        assert!(err.to_string().contains("child.x"));
    }

    #[test]
    fn test_validate_rejects_empty_record() {
        let schema = vec![SchemaField::record("empty", vec![])];
        assert!(validate_schema(&schema).unwrap_err().is_config());
    }

    #[test]
    fn test_deserialize_nested() {
        let schema: Vec<SchemaField> = serde_json::from_str(
            r#"[
                {"name": "creation_time", "type": "datetime"},
                {"name": "forecast", "type": "RECORD", "mode": "REPEATED", "fields": [
                    {"name": "hours", "type": "int", "mode": "REQUIRED"},
                    {"name": "temperature", "type": "float", "description": "2m"}
                ]}
            ]"#,
        )
        .unwrap();

        assert_eq!(schema.len(), 2);
        assert_eq!(
            schema[0].field_type,
            FieldType::Primitive(PrimitiveKind::DateTime)
        );
        assert_eq!(schema[1].mode, FieldMode::Repeated);
        let children = schema[1].children().unwrap();
        assert_eq!(children[0].mode, FieldMode::Required);
        assert_eq!(children[1].description.as_deref(), Some("2m"));
    }

    #[test]
    fn test_deserialize_rejects_children_on_primitive() {
        let result: Result<SchemaField, _> = serde_json::from_str(
            r#"{"name": "v", "type": "int", "fields": [{"name": "x", "type": "int"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_rejects_unknown_mode() {
        let result: Result<SchemaField, _> =
            serde_json::from_str(r#"{"name": "v", "type": "int", "mode": "sometimes"}"#);
        assert!(result.is_err());
    }
}
