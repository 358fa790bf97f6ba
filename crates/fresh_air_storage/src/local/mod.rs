//! Local file resources.
//!
//! A local resource lives at
//! `<base_dir>/<project_id or "_default">/<namespace...>/<name>.<ext>`.
//! The file format is chosen once from settings: JSON lines (default) or
//! Avro object container files.

pub mod avro;
pub mod json;

pub use avro::AvroFile;
pub use json::JsonLinesFile;

use crate::error::{StorageError, StorageResult};
use crate::lock::{FileLockCoordinator, LockCoordinator};
use crate::resource::{Record, RecordStream, Resource, ResourcePath, ResourceSpec};
use crate::schema::validate_schema;
use apache_avro::Codec;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Project directory used when a resource names none.
pub const DEFAULT_PROJECT_DIR: &str = "_default";

/// Local file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LocalFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Avro object container file
    Avro,
}

impl LocalFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalFormat::Json => "json",
            LocalFormat::Avro => "avro",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            LocalFormat::Json => "jsonl",
            LocalFormat::Avro => "avro",
        }
    }
}

impl fmt::Display for LocalFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LocalFormat {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" | "jsonl" => Ok(LocalFormat::Json),
            "avro" => Ok(LocalFormat::Avro),
            _ => Err(StorageError::config(format!(
                "Unknown local file format: '{}'. Expected: json or avro",
                s
            ))),
        }
    }
}

/// Parse an Avro block codec name.
pub fn parse_codec(name: &str) -> StorageResult<Codec> {
    match name.to_lowercase().as_str() {
        "null" | "none" => Ok(Codec::Null),
        "deflate" => Ok(Codec::Deflate),
        _ => Err(StorageError::config(format!(
            "Unsupported Avro codec: '{}'. Expected: deflate or null",
            name
        ))),
    }
}

/// Where a local file lives and who coordinates its writers.
#[derive(Debug, Clone)]
pub struct FileLocation {
    dir: PathBuf,
    file_name: String,
    coordinator: Option<Arc<dyn LockCoordinator>>,
}

impl FileLocation {
    pub fn new(
        dir: impl Into<PathBuf>,
        name: &str,
        extension: &str,
        coordinator: Option<Arc<dyn LockCoordinator>>,
    ) -> Self {
        Self {
            dir: dir.into(),
            file_name: format!("{}.{}", name, extension),
            coordinator,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn full_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    pub fn coordinator(&self) -> Option<&Arc<dyn LockCoordinator>> {
        self.coordinator.as_ref()
    }

    /// Create the storage directory if missing.
    pub fn ensure_dir(&self) -> StorageResult<()> {
        if !self.dir.exists() {
            info!("Storage folder does not exist, creating {}", self.dir.display());
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| StorageError::io(&self.dir, e))
    }

    /// Full path, or `NotFound` if nothing was written yet.
    pub fn existing_path(&self) -> StorageResult<PathBuf> {
        let path = self.full_path();
        if !path.exists() {
            return Err(StorageError::not_found(format!(
                "No stored data at {}",
                path.display()
            )));
        }
        Ok(path)
    }
}

/// Options shared by every local resource built from one configuration.
#[derive(Debug, Clone)]
pub struct LocalOptions {
    pub base_dir: PathBuf,
    pub format: LocalFormat,
    pub codec: Codec,
    pub coordinator: Option<Arc<dyn LockCoordinator>>,
}

impl LocalOptions {
    /// JSON lines under `base_dir`, file locking on.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            format: LocalFormat::Json,
            codec: Codec::Deflate,
            coordinator: Some(Arc::new(FileLockCoordinator::new())),
        }
    }

    pub fn with_format(mut self, format: LocalFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_coordinator(mut self, coordinator: Arc<dyn LockCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Leave writers uncoordinated; the caller serializes them.
    pub fn without_locking(mut self) -> Self {
        self.coordinator = None;
        self
    }
}

enum LocalFile {
    Json(JsonLinesFile),
    Avro(Box<AvroFile>),
}

/// Resource stored in a file on the local filesystem.
pub struct LocalResource {
    path: ResourcePath,
    file: LocalFile,
}

impl LocalResource {
    pub fn new(spec: ResourceSpec, options: &LocalOptions) -> StorageResult<Self> {
        validate_schema(&spec.schema)?;
        if spec.partition_field.is_some() || !spec.clustering_fields.is_empty() {
            debug!("Ignoring partitioning/clustering for local resource {}", spec.path);
        }

        let project = spec.project_id.as_deref().unwrap_or(DEFAULT_PROJECT_DIR);
        let mut dir = options.base_dir.join(project);
        for segment in spec.path.namespace() {
            dir.push(segment);
        }

        let location = FileLocation::new(
            dir,
            spec.path.name(),
            options.format.extension(),
            options.coordinator.clone(),
        );
        let file = match options.format {
            LocalFormat::Json => LocalFile::Json(JsonLinesFile::new(location)),
            LocalFormat::Avro => LocalFile::Avro(Box::new(AvroFile::new(
                location,
                spec.path.name(),
                &spec.schema,
                options.codec,
            )?)),
        };

        Ok(Self {
            path: spec.path,
            file,
        })
    }

    pub fn format(&self) -> LocalFormat {
        match &self.file {
            LocalFile::Json(_) => LocalFormat::Json,
            LocalFile::Avro(_) => LocalFormat::Avro,
        }
    }

    /// Resolved data file path.
    pub fn file_path(&self) -> PathBuf {
        match &self.file {
            LocalFile::Json(file) => file.location().full_path(),
            LocalFile::Avro(file) => file.location().full_path(),
        }
    }
}

impl Resource for LocalResource {
    fn path(&self) -> &ResourcePath {
        &self.path
    }

    fn write(&self, records: Vec<Record>, append: bool) -> StorageResult<()> {
        info!("Saving {}", self.path);
        match &self.file {
            LocalFile::Json(file) => file.write(records, append),
            LocalFile::Avro(file) => file.write(records, append),
        }
    }

    fn read(&self) -> StorageResult<RecordStream> {
        info!("Reading {}", self.path);
        match &self.file {
            LocalFile::Json(file) => file.read(),
            LocalFile::Avro(file) => file.read(),
        }
    }
}
