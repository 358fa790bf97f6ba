//! Batch metadata stamping.
//!
//! Every record written in one `write()` call carries the same
//! `_etl_timestamp` value: the batch marker, not a per-record clock.

use crate::resource::Record;
use crate::schema::{PrimitiveKind, SchemaField};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Name of the ETL timestamp metadata field.
pub const ETL_TIMESTAMP_FIELD: &str = "_etl_timestamp";

/// Metadata fields appended to every compiled schema.
pub fn meta_fields() -> Vec<SchemaField> {
    vec![SchemaField::new(ETL_TIMESTAMP_FIELD, PrimitiveKind::Timestamp)
        .with_description("Technical field, timestamp of the ETL job.")]
}

/// User schema followed by the metadata fields.
pub fn with_meta_fields(schema: &[SchemaField]) -> Vec<SchemaField> {
    let mut fields = schema.to_vec();
    fields.extend(meta_fields());
    fields
}

/// One timestamp shared by a whole write batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtlStamp {
    seconds: f64,
}

impl EtlStamp {
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(time: DateTime<Utc>) -> Self {
        let seconds = time.timestamp() as f64 + f64::from(time.timestamp_subsec_micros()) / 1e6;
        Self { seconds }
    }

    /// Seconds since the Unix epoch, fractional.
    pub fn seconds(&self) -> f64 {
        self.seconds
    }

    /// Merge the stamp into one record, replacing any caller-supplied value.
    pub fn apply(&self, record: &mut Record) {
        record.insert(ETL_TIMESTAMP_FIELD.to_string(), Value::from(self.seconds));
    }

    /// Stamp every record of a batch.
    pub fn stamp<I>(self, records: I) -> impl Iterator<Item = Record>
    where
        I: IntoIterator<Item = Record>,
    {
        records.into_iter().map(move |mut record| {
            self.apply(&mut record);
            record
        })
    }
}

/// Stamp a batch with a freshly captured timestamp.
pub fn stamp_batch<I>(records: I) -> impl Iterator<Item = Record>
where
    I: IntoIterator<Item = Record>,
{
    EtlStamp::now().stamp(records)
}
