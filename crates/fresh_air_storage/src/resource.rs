//! The Resource contract shared by every backend.

use crate::error::{StorageError, StorageResult};
use crate::schema::SchemaField;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// One structured record.
pub type Record = Map<String, Value>;

/// Lazy sequence of decoded records.
pub type RecordStream = Box<dyn Iterator<Item = StorageResult<Record>> + Send>;

/// Uniform write/read contract over all storage backends.
///
/// All calls block until the underlying I/O completes.
pub trait Resource: Send + Sync {
    fn path(&self) -> &ResourcePath;

    /// Write a batch, creating the container if needed.
    ///
    /// Every record is stamped with one shared ETL timestamp. With
    /// `append == false` previous content is replaced.
    fn write(&self, records: Vec<Record>, append: bool) -> StorageResult<()>;

    /// Every stored record, in whatever order the backend preserves.
    fn read(&self) -> StorageResult<RecordStream>;

    fn read_all(&self) -> StorageResult<Vec<Record>> {
        self.read()?.collect()
    }
}

/// Hierarchical resource location; the last segment names the object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn new<I, S>(segments: I) -> StorageResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(StorageError::config("Resource path has no segments"));
        }
        if let Some(pos) = segments.iter().position(|s| s.trim().is_empty()) {
            return Err(StorageError::config(format!(
                "Resource path segment {} is empty in '{}'",
                pos,
                segments.join(".")
            )));
        }
        Ok(Self { segments })
    }

    /// Parse a `.`-separated path such as `gfs.forecasts`.
    pub fn parse(path: &str) -> StorageResult<Self> {
        Self::new(path.split('.'))
    }

    /// Object name (last segment).
    pub fn name(&self) -> &str {
        // Never empty: checked in `new`
        &self.segments[self.segments.len() - 1]
    }

    /// Segments before the name.
    pub fn namespace(&self) -> &[String] {
        &self.segments[..self.segments.len() - 1]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for ResourcePath {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Time granularity of warehouse table partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionScale {
    Hour,
    Day,
    Month,
    Year,
}

impl PartitionScale {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionScale::Hour => "HOUR",
            PartitionScale::Day => "DAY",
            PartitionScale::Month => "MONTH",
            PartitionScale::Year => "YEAR",
        }
    }
}

impl fmt::Display for PartitionScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PartitionScale {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hour" => Ok(PartitionScale::Hour),
            "day" => Ok(PartitionScale::Day),
            "month" => Ok(PartitionScale::Month),
            "year" => Ok(PartitionScale::Year),
            _ => Err(StorageError::config(format!(
                "Invalid partition scale: '{}'. Expected: hour, day, month, or year",
                s
            ))),
        }
    }
}

/// Everything a backend needs to construct a resource.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub path: ResourcePath,
    pub schema: Vec<SchemaField>,
    /// Local: root directory under the base dir. Warehouse: project id.
    pub project_id: Option<String>,
    pub partition_field: Option<String>,
    pub partition_scale: Option<PartitionScale>,
    /// Warehouse only.
    pub clustering_fields: Vec<String>,
}

impl ResourceSpec {
    pub fn new(path: ResourcePath, schema: Vec<SchemaField>) -> Self {
        Self {
            path,
            schema,
            project_id: None,
            partition_field: None,
            partition_scale: None,
            clustering_fields: Vec::new(),
        }
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_partitioning(self, field: impl Into<String>, scale: PartitionScale) -> Self {
        self.with_partition_field(field).with_partition_scale(scale)
    }

    pub fn with_partition_field(mut self, field: impl Into<String>) -> Self {
        self.partition_field = Some(field.into());
        self
    }

    pub fn with_partition_scale(mut self, scale: PartitionScale) -> Self {
        self.partition_scale = Some(scale);
        self
    }

    pub fn with_clustering_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clustering_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_parse() {
        let path = ResourcePath::parse("eea_aqd.measurements.raw").unwrap();
        assert_eq!(path.name(), "raw");
        assert_eq!(path.namespace(), ["eea_aqd", "measurements"]);
        assert_eq!(path.to_string(), "eea_aqd.measurements.raw");

        let single: ResourcePath = "points".parse().unwrap();
        assert_eq!(single.name(), "points");
        assert!(single.namespace().is_empty());
    }

    #[test]
    fn test_path_rejects_empty_segments() {
        assert!(ResourcePath::parse("").unwrap_err().is_config());
        assert!(ResourcePath::parse("a..b").unwrap_err().is_config());
        assert!(ResourcePath::new(Vec::<String>::new()).unwrap_err().is_config());
    }

    #[test]
    fn test_partition_scale_parse() {
        assert_eq!("month".parse::<PartitionScale>().unwrap(), PartitionScale::Month);
        assert_eq!("DAY".parse::<PartitionScale>().unwrap(), PartitionScale::Day);
        assert!("week".parse::<PartitionScale>().unwrap_err().is_config());
    }
}
