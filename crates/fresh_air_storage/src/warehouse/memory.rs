//! Process-local warehouse.
//!
//! Follows the same disposition rules as the real service: appends may add
//! nullable fields but not change existing ones, truncating loads replace
//! both rows and schema. Query jobs are recorded and answer with rows queued
//! by the caller.

use super::client::{
    JobReference, QueryParameter, TableDefinition, TableRef, WarehouseClient, WriteDisposition,
};
use crate::error::{StorageError, StorageResult};
use crate::mapping::TableFieldSchema;
use crate::resource::Record;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// A query job as it was submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQuery {
    pub project_id: String,
    pub query: String,
    pub params: Vec<QueryParameter>,
}

#[derive(Debug, Clone)]
struct StoredTable {
    definition: TableDefinition,
    rows: Vec<Record>,
}

#[derive(Debug)]
struct JobState {
    rows: Vec<Record>,
    error: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    datasets: HashSet<(String, String)>,
    tables: HashMap<TableRef, StoredTable>,
    jobs: HashMap<String, JobState>,
    queries: Vec<RecordedQuery>,
    query_results: VecDeque<Vec<Record>>,
    failures: VecDeque<String>,
}

/// In-memory `WarehouseClient`.
#[derive(Debug, Default)]
pub struct InMemoryWarehouse {
    state: Mutex<State>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next load or query job with `message`.
    pub fn fail_next_job(&self, message: impl Into<String>) {
        self.state().failures.push_back(message.into());
    }

    /// Rows answered by the next query job.
    pub fn push_query_result(&self, rows: Vec<Record>) {
        self.state().query_results.push_back(rows);
    }

    pub fn queries(&self) -> Vec<RecordedQuery> {
        self.state().queries.clone()
    }

    pub fn dataset_exists(&self, project_id: &str, dataset_id: &str) -> bool {
        self.state()
            .datasets
            .contains(&(project_id.to_string(), dataset_id.to_string()))
    }

    pub fn table_definition(&self, table: &TableRef) -> Option<TableDefinition> {
        self.state().tables.get(table).map(|t| t.definition.clone())
    }

    pub fn table_rows(&self, table: &TableRef) -> Option<Vec<Record>> {
        self.state().tables.get(table).map(|t| t.rows.clone())
    }
}

fn missing_table(table: &TableRef) -> StorageError {
    StorageError::warehouse(format!(
        "Not found: Table {}:{}.{}",
        table.project_id, table.dataset_id, table.table_id
    ))
}

/// Existing schema plus any new top-level fields; changed fields are refused.
fn merge_additive(
    table: &TableRef,
    existing: &[TableFieldSchema],
    incoming: &[TableFieldSchema],
) -> StorageResult<Vec<TableFieldSchema>> {
    let mut merged = existing.to_vec();
    for field in incoming {
        match existing.iter().find(|f| f.name == field.name) {
            Some(current) if current.field_type != field.field_type => {
                return Err(StorageError::warehouse(format!(
                    "Provided Schema does not match Table {}. Field {} has changed type from {} to {}",
                    table, field.name, current.field_type, field.field_type
                )));
            }
            Some(_) => {}
            None => {
                if field.mode.as_deref() == Some("REQUIRED") {
                    return Err(StorageError::warehouse(format!(
                        "Provided Schema does not match Table {}. Cannot add required field {}",
                        table, field.name
                    )));
                }
                merged.push(field.clone());
            }
        }
    }
    Ok(merged)
}

fn check_rows(table: &TableRef, schema: &[TableFieldSchema], rows: &[Record]) -> StorageResult<()> {
    for row in rows {
        if let Some(key) = row.keys().find(|k| !schema.iter().any(|f| &f.name == *k)) {
            return Err(StorageError::warehouse(format!(
                "Error while reading data for {}: no such field: {}.",
                table, key
            )));
        }
        for field in schema.iter().filter(|f| f.mode.as_deref() == Some("REQUIRED")) {
            if row.get(&field.name).map_or(true, |v| v.is_null()) {
                return Err(StorageError::warehouse(format!(
                    "Error while reading data for {}: missing required field {}.",
                    table, field.name
                )));
            }
        }
    }
    Ok(())
}

impl WarehouseClient for InMemoryWarehouse {
    fn create_dataset(&self, project_id: &str, dataset_id: &str) -> StorageResult<()> {
        self.state()
            .datasets
            .insert((project_id.to_string(), dataset_id.to_string()));
        Ok(())
    }

    fn create_table(&self, table: &TableRef, definition: &TableDefinition) -> StorageResult<()> {
        let mut state = self.state();
        let dataset = (table.project_id.clone(), table.dataset_id.clone());
        if !state.datasets.contains(&dataset) {
            return Err(StorageError::warehouse(format!(
                "Not found: Dataset {}:{}",
                table.project_id, table.dataset_id
            )));
        }
        state
            .tables
            .entry(table.clone())
            .or_insert_with(|| StoredTable {
                definition: definition.clone(),
                rows: Vec::new(),
            });
        Ok(())
    }

    fn load_rows(
        &self,
        table: &TableRef,
        definition: &TableDefinition,
        rows: &[Record],
        disposition: WriteDisposition,
    ) -> StorageResult<()> {
        let mut state = self.state();
        if let Some(message) = state.failures.pop_front() {
            return Err(StorageError::warehouse(message));
        }

        let stored = state.tables.get(table);
        let schema = match (disposition, stored) {
            (WriteDisposition::Append, Some(stored)) => {
                merge_additive(table, &stored.definition.schema, &definition.schema)?
            }
            _ => definition.schema.clone(),
        };
        check_rows(table, &schema, rows)?;

        let stored = state
            .tables
            .entry(table.clone())
            .or_insert_with(|| StoredTable {
                definition: definition.clone(),
                rows: Vec::new(),
            });
        stored.definition.schema = schema;
        if disposition == WriteDisposition::Truncate {
            stored.rows.clear();
        }
        stored.rows.extend(rows.iter().cloned());
        debug!("Loaded {} rows into {} ({})", rows.len(), table, disposition.as_str());
        Ok(())
    }

    fn list_rows(&self, table: &TableRef) -> StorageResult<Vec<Record>> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .ok_or_else(|| missing_table(table))
    }

    fn submit_query(
        &self,
        project_id: &str,
        query: &str,
        params: &[QueryParameter],
    ) -> StorageResult<JobReference> {
        let mut state = self.state();
        state.queries.push(RecordedQuery {
            project_id: project_id.to_string(),
            query: query.to_string(),
            params: params.to_vec(),
        });
        let job = JobState {
            error: state.failures.pop_front(),
            rows: state.query_results.pop_front().unwrap_or_default(),
        };
        let job_id = format!("memory_{}", Uuid::new_v4().simple());
        state.jobs.insert(job_id.clone(), job);
        Ok(JobReference {
            project_id: project_id.to_string(),
            job_id,
            location: None,
        })
    }

    fn job_done(&self, job: &JobReference) -> StorageResult<bool> {
        if self.state().jobs.contains_key(&job.job_id) {
            Ok(true)
        } else {
            Err(StorageError::warehouse(format!("Not found: Job {}", job.job_id)))
        }
    }

    fn wait_job(&self, job: &JobReference) -> StorageResult<()> {
        match self.state().jobs.get(&job.job_id) {
            Some(JobState { error: Some(message), .. }) => Err(StorageError::warehouse(message.clone())),
            Some(_) => Ok(()),
            None => Err(StorageError::warehouse(format!("Not found: Job {}", job.job_id))),
        }
    }

    fn query_rows(&self, job: &JobReference) -> StorageResult<Vec<Record>> {
        self.wait_job(job)?;
        Ok(self
            .state()
            .jobs
            .get(&job.job_id)
            .map(|j| j.rows.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, field_type: &str, mode: &str) -> TableFieldSchema {
        TableFieldSchema {
            name: name.to_string(),
            field_type: field_type.to_string(),
            mode: Some(mode.to_string()),
            description: None,
            fields: None,
        }
    }

    fn definition(fields: Vec<TableFieldSchema>) -> TableDefinition {
        TableDefinition {
            schema: fields,
            partitioning: None,
            clustering: Vec::new(),
        }
    }

    fn row(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_table_requires_dataset() {
        let warehouse = InMemoryWarehouse::new();
        let table = TableRef::new("p", "d", "t");
        let def = definition(vec![field("v", "INTEGER", "NULLABLE")]);
        assert!(warehouse.create_table(&table, &def).is_err());

        warehouse.create_dataset("p", "d").unwrap();
        warehouse.create_dataset("p", "d").unwrap();
        warehouse.create_table(&table, &def).unwrap();
        warehouse.create_table(&table, &def).unwrap();
        assert!(warehouse.dataset_exists("p", "d"));
        assert_eq!(warehouse.table_rows(&table), Some(Vec::new()));
    }

    #[test]
    fn test_type_change_on_append_refused() {
        let warehouse = InMemoryWarehouse::new();
        let table = TableRef::new("p", "d", "t");
        warehouse
            .load_rows(
                &table,
                &definition(vec![field("v", "INTEGER", "NULLABLE")]),
                &[row(json!({"v": 1}))],
                WriteDisposition::Truncate,
            )
            .unwrap();

        let err = warehouse
            .load_rows(
                &table,
                &definition(vec![field("v", "STRING", "NULLABLE")]),
                &[row(json!({"v": "x"}))],
                WriteDisposition::Append,
            )
            .unwrap_err();
        assert!(err.to_string().contains("has changed type from INTEGER to STRING"));
        assert_eq!(warehouse.table_rows(&table).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_column_refused() {
        let warehouse = InMemoryWarehouse::new();
        let table = TableRef::new("p", "d", "t");
        let err = warehouse
            .load_rows(
                &table,
                &definition(vec![field("v", "INTEGER", "NULLABLE")]),
                &[row(json!({"w": 1}))],
                WriteDisposition::Append,
            )
            .unwrap_err();
        assert!(err.to_string().contains("no such field: w."));
    }

    #[test]
    fn test_injected_failure_is_verbatim_and_consumed() {
        let warehouse = InMemoryWarehouse::new();
        let table = TableRef::new("p", "d", "t");
        let def = definition(vec![field("v", "INTEGER", "NULLABLE")]);
        warehouse.fail_next_job("Quota exceeded: too many table update operations");

        let err = warehouse
            .load_rows(&table, &def, &[row(json!({"v": 1}))], WriteDisposition::Append)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Warehouse error: Quota exceeded: too many table update operations"
        );
        warehouse
            .load_rows(&table, &def, &[row(json!({"v": 1}))], WriteDisposition::Append)
            .unwrap();
    }

    #[test]
    fn test_query_jobs_recorded() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.push_query_result(vec![row(json!({"n": 3}))]);
        let job = warehouse
            .submit_query("p", "SELECT 3 AS n", &[QueryParameter::new("x", 1)])
            .unwrap();
        assert!(warehouse.job_done(&job).unwrap());
        assert_eq!(warehouse.query_rows(&job).unwrap()[0]["n"], json!(3));

        let queries = warehouse.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].query, "SELECT 3 AS n");
        assert_eq!(queries[0].params[0].name, "x");
    }
}
