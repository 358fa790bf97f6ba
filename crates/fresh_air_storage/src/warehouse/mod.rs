//! Warehouse table resources.
//!
//! A `BigQueryTable` is addressed as `dataset.table` (project from
//! settings) or `project.dataset.table`. The table definition (compiled
//! schema, partitioning, clustering) is built once at construction; the
//! dataset and table are created on first use.

pub mod client;
pub mod memory;
pub mod rest;

pub use client::{
    JobReference, Partitioning, QueryParameter, TableDefinition, TableRef, WarehouseClient,
    WriteDisposition,
};
pub use memory::{InMemoryWarehouse, RecordedQuery};
pub use rest::{BigQueryRestClient, ServiceAccountKey, TokenSource};

use crate::error::{StorageError, StorageResult};
use crate::mapping::compile_bigquery;
use crate::meta::{stamp_batch, with_meta_fields};
use crate::resource::{Record, RecordStream, Resource, ResourcePath, ResourceSpec};
use crate::schema::{validate_schema, SchemaField};
use std::sync::Arc;
use tracing::{debug, info};

/// Placeholder replaced by `project.dataset.table` in `run_query`.
///
/// The name is substituted bare, so queries quote it themselves:
/// ``SELECT * FROM `{table}` ``.
pub const TABLE_PLACEHOLDER: &str = "{table}";

/// Resource stored in a warehouse table.
pub struct BigQueryTable {
    path: ResourcePath,
    table: TableRef,
    definition: TableDefinition,
    client: Arc<dyn WarehouseClient>,
}

impl std::fmt::Debug for BigQueryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryTable")
            .field("table", &self.table)
            .field("definition", &self.definition)
            .finish()
    }
}

impl BigQueryTable {
    /// Validate the `ResourceSpec` and compile the table definition.
    ///
    /// `default_project` is used when neither the path nor `spec.project_id` names a
    /// project.
    pub fn new(
        spec: ResourceSpec,
        default_project: Option<&str>,
        client: Arc<dyn WarehouseClient>,
    ) -> StorageResult<Self> {
        let table = resolve_table(&spec, default_project)?;
        validate_schema(&spec.schema)?;
        let fields = with_meta_fields(&spec.schema);
        validate_schema(&fields)?;

        let partitioning = match (&spec.partition_field, spec.partition_scale) {
            (Some(field), Some(scale)) => {
                require_top_level(&fields, field, "Partition")?;
                Some(Partitioning {
                    field: field.clone(),
                    scale,
                })
            }
            (None, None) => None,
            _ => {
                return Err(StorageError::config(format!(
                    "Table {}: partition_field and partition_scale must be set together",
                    spec.path
                )))
            }
        };
        for field in &spec.clustering_fields {
            require_top_level(&fields, field, "Clustering")?;
        }

        let definition = TableDefinition {
            schema: compile_bigquery(&fields),
            partitioning,
            clustering: spec.clustering_fields.clone(),
        };
        debug!("Compiled table definition for {}", table);

        Ok(Self {
            path: spec.path,
            table,
            definition,
            client,
        })
    }

    pub fn table_ref(&self) -> &TableRef {
        &self.table
    }

    pub fn definition(&self) -> &TableDefinition {
        &self.definition
    }

    /// Create the dataset, then the table; both may already exist.
    pub fn ensure_exists(&self) -> StorageResult<()> {
        self.client
            .create_dataset(&self.table.project_id, &self.table.dataset_id)?;
        self.client.create_table(&self.table, &self.definition)
    }

    /// Run a standard-SQL query against this table.
    ///
    /// Every `{table}` in `query` becomes the unquoted `project.dataset.table`
    /// name; the query supplies the backticks around it.
    /// With `wait` the call returns only after the job has finished.
    pub fn run_query(
        &self,
        query: &str,
        params: &[QueryParameter],
        wait: bool,
    ) -> StorageResult<QueryJob> {
        self.ensure_exists()?;
        let sql = query.replace(TABLE_PLACEHOLDER, &self.table.qualified());
        debug!("Running query on {}: {}", self.table, sql);
        let job = self
            .client
            .submit_query(&self.table.project_id, &sql, params)?;
        let job = QueryJob {
            client: Arc::clone(&self.client),
            job,
        };
        if wait {
            job.wait()?;
        }
        Ok(job)
    }
}

fn resolve_table(spec: &ResourceSpec, default_project: Option<&str>) -> StorageResult<TableRef> {
    let segments = spec.path.segments();
    match segments {
        [project, dataset, table] => Ok(TableRef::new(project, dataset, table)),
        [dataset, table] => {
            let project = spec
                .project_id
                .as_deref()
                .or(default_project)
                .ok_or_else(|| {
                    StorageError::config(format!(
                        "Table {} has no project: set storage.bigquery.project_id or use project.dataset.table",
                        spec.path
                    ))
                })?;
            Ok(TableRef::new(project, dataset, table))
        }
        _ => Err(StorageError::config(format!(
            "Table path '{}' must be dataset.table or project.dataset.table",
            spec.path
        ))),
    }
}

fn require_top_level(fields: &[SchemaField], name: &str, what: &str) -> StorageResult<()> {
    if fields.iter().any(|f| f.name == name) {
        Ok(())
    } else {
        Err(StorageError::config(format!(
            "{} field '{}' is not a top-level schema field",
            what, name
        )))
    }
}

impl Resource for BigQueryTable {
    fn path(&self) -> &ResourcePath {
        &self.path
    }

    fn write(&self, records: Vec<Record>, append: bool) -> StorageResult<()> {
        info!("Saving {}", self.path);
        self.ensure_exists()?;
        let rows: Vec<Record> = stamp_batch(records).collect();
        self.client.load_rows(
            &self.table,
            &self.definition,
            &rows,
            WriteDisposition::from_append(append),
        )
    }

    fn read(&self) -> StorageResult<RecordStream> {
        info!("Reading {}", self.path);
        let rows = self.client.list_rows(&self.table)?;
        Ok(Box::new(rows.into_iter().map(Ok)))
    }
}

/// Handle to a submitted query job.
pub struct QueryJob {
    client: Arc<dyn WarehouseClient>,
    job: JobReference,
}

impl QueryJob {
    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }

    pub fn reference(&self) -> &JobReference {
        &self.job
    }

    pub fn is_done(&self) -> StorageResult<bool> {
        self.client.job_done(&self.job)
    }

    /// Block until the job finishes; the job's own error text on failure.
    pub fn wait(&self) -> StorageResult<()> {
        self.client.wait_job(&self.job)
    }

    /// Result rows, waiting for the job first.
    pub fn rows(&self) -> StorageResult<Vec<Record>> {
        self.client.query_rows(&self.job)
    }
}

impl std::fmt::Debug for QueryJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryJob").field("job", &self.job).finish()
    }
}
