//! Warehouse client contract.
//!
//! A `WarehouseClient` is an explicitly owned handle shared by every table
//! built from one factory. Implementations must treat "already exists" as
//! success for dataset and table creation and surface remote job failures
//! with their message unchanged.

use crate::error::StorageResult;
use crate::mapping::TableFieldSchema;
use crate::resource::{PartitionScale, Record};
use serde_json::Value;
use std::fmt;

/// Fully qualified table reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }

    /// `project.dataset.table`
    pub fn qualified(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

/// Time partitioning of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitioning {
    pub field: String,
    pub scale: PartitionScale,
}

/// Schema and physical layout used when creating or loading a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub schema: Vec<TableFieldSchema>,
    pub partitioning: Option<Partitioning>,
    pub clustering: Vec<String>,
}

/// How a load job treats existing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Keep rows, allow new nullable fields
    Append,
    /// Replace rows and schema
    Truncate,
}

impl WriteDisposition {
    pub fn from_append(append: bool) -> Self {
        if append {
            WriteDisposition::Append
        } else {
            WriteDisposition::Truncate
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::Append => "WRITE_APPEND",
            WriteDisposition::Truncate => "WRITE_TRUNCATE",
        }
    }
}

/// Named standard-SQL query parameter.
///
/// A JSON array becomes an `ARRAY` parameter (`IN UNNEST(@name)`) whose
/// element type is inferred from the first non-null element, `STRING` when
/// there is none.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameter {
    pub name: String,
    /// Standard SQL type, e.g. `STRING`, `INT64`, `ARRAY`
    pub param_type: String,
    /// Element type, only for `ARRAY`
    pub array_type: Option<String>,
    pub value: Value,
}

fn scalar_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "BOOL",
        Value::Number(n) if n.is_f64() => "FLOAT64",
        Value::Number(_) => "INT64",
        _ => "STRING",
    }
}

impl QueryParameter {
    /// Parameter with its type inferred from the JSON value.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        match value.into() {
            Value::Array(values) => {
                let element_type = values
                    .iter()
                    .find(|v| !v.is_null())
                    .map_or("STRING", scalar_type);
                Self::array(name, element_type, values)
            }
            value => Self::typed(name, scalar_type(&value), value),
        }
    }

    pub fn typed(name: impl Into<String>, param_type: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            array_type: None,
            value,
        }
    }

    /// `ARRAY<element_type>` parameter.
    pub fn array(
        name: impl Into<String>,
        element_type: impl Into<String>,
        values: Vec<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type: "ARRAY".to_string(),
            array_type: Some(element_type.into()),
            value: Value::Array(values),
        }
    }

    pub fn is_array(&self) -> bool {
        self.array_type.is_some()
    }

    /// Wire form of a scalar value: the API takes every scalar as a string.
    /// `None` for null and for arrays.
    pub fn value_string(&self) -> Option<String> {
        match &self.value {
            Value::Array(_) => None,
            value => wire_string(value),
        }
    }

    /// Wire form of each array element.
    pub fn array_values(&self) -> Vec<Option<String>> {
        match &self.value {
            Value::Array(values) => values.iter().map(wire_string).collect(),
            _ => Vec::new(),
        }
    }
}

fn wire_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Handle to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReference {
    pub project_id: String,
    pub job_id: String,
    pub location: Option<String>,
}

/// Operations the table backend needs from a warehouse.
///
/// All calls block. `load_rows` returns once the load job has finished.
pub trait WarehouseClient: Send + Sync {
    /// Create a dataset; an existing one is not an error.
    fn create_dataset(&self, project_id: &str, dataset_id: &str) -> StorageResult<()>;

    /// Create a table; an existing one is left as is.
    fn create_table(&self, table: &TableRef, definition: &TableDefinition) -> StorageResult<()>;

    /// Load rows and wait for the job.
    fn load_rows(
        &self,
        table: &TableRef,
        definition: &TableDefinition,
        rows: &[Record],
        disposition: WriteDisposition,
    ) -> StorageResult<()>;

    /// Every row of a table, all pages.
    fn list_rows(&self, table: &TableRef) -> StorageResult<Vec<Record>>;

    /// Submit a standard-SQL query job without waiting.
    fn submit_query(
        &self,
        project_id: &str,
        query: &str,
        params: &[QueryParameter],
    ) -> StorageResult<JobReference>;

    fn job_done(&self, job: &JobReference) -> StorageResult<bool>;

    /// Block until the job finishes; a failed job is an error.
    fn wait_job(&self, job: &JobReference) -> StorageResult<()>;

    /// Result rows of a finished query job.
    fn query_rows(&self, job: &JobReference) -> StorageResult<Vec<Record>>;
}
