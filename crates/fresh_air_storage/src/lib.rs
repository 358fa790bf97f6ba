//! Fresh Air Storage
//!
//! Typed storage resources with one write/read contract over local files
//! (JSON lines or Avro containers) and warehouse tables (BigQuery).
//!
//! # Example
//!
//! ```no_run
//! use fresh_air_storage::{resource_factory, PrimitiveKind, ResourcePath, ResourceSpec, SchemaField};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), fresh_air_storage::StorageError> {
//! let spec = ResourceSpec::new(
//!     ResourcePath::parse("gfs.forecasts")?,
//!     vec![SchemaField::new("v", PrimitiveKind::Integer)],
//! );
//! let resource = resource_factory()?.open(spec)?;
//! let record = json!({"v": 1}).as_object().cloned().unwrap_or_default();
//! resource.write(vec![record], false)?;
//! for record in resource.read()? {
//!     println!("{:?}", record?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod local;
pub mod lock;
pub mod mapping;
pub mod meta;
pub mod resource;
pub mod schema;
pub mod warehouse;

pub use config::Settings;
pub use error::{ErrorKind, StorageError, StorageResult};
pub use factory::{resource_factory, BackendKind, ResourceFactory};
pub use local::{LocalFormat, LocalOptions, LocalResource};
pub use lock::{FileLockCoordinator, LockCoordinator, LockError};
pub use meta::{EtlStamp, ETL_TIMESTAMP_FIELD};
pub use resource::{PartitionScale, Record, RecordStream, Resource, ResourcePath, ResourceSpec};
pub use schema::{FieldMode, FieldType, PrimitiveKind, SchemaField};
pub use warehouse::{
    BigQueryRestClient, BigQueryTable, InMemoryWarehouse, QueryJob, QueryParameter,
    WarehouseClient,
};
