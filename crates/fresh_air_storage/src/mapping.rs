//! Per-backend type mapping.
//!
//! Every primitive kind maps to exactly one native type. Unrecognized kinds
//! compile to the backend's generic string type instead of failing; a
//! warning is logged so a misspelled type name is still visible.

use crate::schema::{FieldMode, FieldType, PrimitiveKind, SchemaField};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

/// Avro primitive for a field kind.
pub fn avro_type(kind: &PrimitiveKind) -> &'static str {
    match kind {
        PrimitiveKind::String => "string",
        PrimitiveKind::Integer => "long",
        PrimitiveKind::Float => "double",
        PrimitiveKind::Boolean => "boolean",
        // Epoch seconds, fractional
        PrimitiveKind::Timestamp => "double",
        PrimitiveKind::DateTime => "string",
        PrimitiveKind::Date => "string",
        PrimitiveKind::Other(_) => "string",
    }
}

/// BigQuery standard SQL type for a field kind.
pub fn bigquery_type(kind: &PrimitiveKind) -> &'static str {
    match kind {
        PrimitiveKind::String => "STRING",
        PrimitiveKind::Integer => "INTEGER",
        PrimitiveKind::Float => "FLOAT",
        PrimitiveKind::Boolean => "BOOLEAN",
        PrimitiveKind::Timestamp => "TIMESTAMP",
        PrimitiveKind::DateTime => "DATETIME",
        PrimitiveKind::Date => "DATE",
        PrimitiveKind::Other(_) => "STRING",
    }
}

fn warn_fallback(field: &SchemaField, kind: &PrimitiveKind, native: &str) {
    if let PrimitiveKind::Other(name) = kind {
        warn!(
            "Unrecognized type '{}' for field '{}', falling back to {}",
            name, field.name, native
        );
    }
}

/// Make a string usable as an Avro record name.
pub fn avro_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' { ch } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|ch: char| ch.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Compile a schema into an Avro record schema (JSON form).
///
/// Nested record names are derived from the field path so they stay unique
/// within the container schema.
pub fn compile_avro(record_name: &str, fields: &[SchemaField]) -> Value {
    let name = avro_name(record_name);
    avro_record(&name, fields)
}

fn avro_record(name: &str, fields: &[SchemaField]) -> Value {
    let fields: Vec<Value> = fields.iter().map(|f| avro_field(name, f)).collect();
    json!({
        "type": "record",
        "name": name,
        "fields": fields,
    })
}

fn avro_field(parent: &str, field: &SchemaField) -> Value {
    let inner = match &field.field_type {
        FieldType::Primitive(kind) => {
            let native = avro_type(kind);
            warn_fallback(field, kind, native);
            Value::String(native.to_string())
        }
        FieldType::Record(children) => {
            let nested = format!("{}_{}", parent, avro_name(&field.name));
            avro_record(&nested, children)
        }
    };

    let field_type = match field.mode {
        FieldMode::Nullable => json!([inner, "null"]),
        FieldMode::Required => inner,
        FieldMode::Repeated => json!({"type": "array", "items": inner}),
    };

    let mut out = Map::new();
    out.insert("name".to_string(), Value::String(field.name.clone()));
    out.insert("type".to_string(), field_type);
    if let Some(doc) = &field.description {
        out.insert("doc".to_string(), Value::String(doc.clone()));
    }
    // A null default would not match the first union branch
    if let Some(default) = field.default.as_ref().filter(|d| !d.is_null()) {
        out.insert("default".to_string(), default.clone());
    }
    Value::Object(out)
}

/// BigQuery `TableFieldSchema` as used by the REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableFieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<TableFieldSchema>>,
}

impl TableFieldSchema {
    pub fn is_repeated(&self) -> bool {
        self.mode
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("REPEATED"))
    }

    pub fn is_record(&self) -> bool {
        matches!(self.field_type.as_str(), "RECORD" | "STRUCT")
    }
}

/// Compile a schema into BigQuery table fields.
pub fn compile_bigquery(fields: &[SchemaField]) -> Vec<TableFieldSchema> {
    fields.iter().map(bigquery_field).collect()
}

fn bigquery_field(field: &SchemaField) -> TableFieldSchema {
    let (field_type, fields) = match &field.field_type {
        FieldType::Primitive(kind) => {
            let native = bigquery_type(kind);
            warn_fallback(field, kind, native);
            (native.to_string(), None)
        }
        FieldType::Record(children) => ("RECORD".to_string(), Some(compile_bigquery(children))),
    };
    TableFieldSchema {
        name: field.name.clone(),
        field_type,
        mode: Some(field.mode.as_str().to_ascii_uppercase()),
        description: field.description.clone(),
        fields,
    }
}
