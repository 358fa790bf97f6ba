//! Avro object container files.
//!
//! The container schema is compiled once from the resource schema plus the
//! metadata fields. A whole batch is converted before the file is touched,
//! so a record that does not fit the schema fails the write with no partial
//! output.
//!
//! Appending to an existing container adds new blocks after the last one,
//! compressed with the codec recorded in the file header and terminated
//! with the file's own sync marker. The file's embedded schema must match
//! the resource schema; otherwise the append is refused.
//!
//! An overwrite with an empty batch leaves a zero-length file, which reads
//! back as no records and is replaced by a fresh container on the next
//! write.

use super::FileLocation;
use crate::error::{StorageError, StorageResult};
use crate::lock::WriteLock;
use crate::mapping::compile_avro;
use crate::meta::{stamp_batch, with_meta_fields};
use crate::resource::{Record, RecordStream};
use crate::schema::{validate_schema, FieldMode, FieldType, PrimitiveKind, SchemaField};
use apache_avro::types::Value as AvroValue;
use apache_avro::{read_marker, Codec, Reader, Schema, Writer};
use serde_json::{Map, Number, Value};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

const MAGIC: &[u8; 4] = b"Obj\x01";
const SYNC_SIZE: usize = 16;
/// Upper bound for one header metadata entry.
const MAX_META_ENTRY: i64 = 64 * 1024 * 1024;

/// Schema-bound Avro container file.
#[derive(Debug)]
pub struct AvroFile {
    location: FileLocation,
    fields: Vec<SchemaField>,
    schema: Schema,
    codec: Codec,
}

impl AvroFile {
    pub fn new(
        location: FileLocation,
        record_name: &str,
        schema: &[SchemaField],
        codec: Codec,
    ) -> StorageResult<Self> {
        let fields = with_meta_fields(schema);
        validate_schema(&fields)?;
        let compiled = compile_avro(record_name, &fields);
        let schema = Schema::parse(&compiled).map_err(|e| {
            StorageError::config(format!("Invalid Avro schema for '{}': {}", record_name, e))
        })?;
        Ok(Self {
            location,
            fields,
            schema,
            codec,
        })
    }

    pub fn location(&self) -> &FileLocation {
        &self.location
    }

    /// Compiled container schema, metadata fields included.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn write(&self, records: Vec<Record>, append: bool) -> StorageResult<()> {
        let values = stamp_batch(records)
            .map(|record| encode_record(&self.fields, &record, ""))
            .collect::<StorageResult<Vec<_>>>()?;

        self.location.ensure_dir()?;
        let path = self.location.full_path();
        let _lock = WriteLock::acquire(&path, self.location.coordinator());

        if append && file_len(&path)? > 0 {
            self.append_blocks(&path, values)
        } else {
            self.write_container(&path, values)
        }
    }

    /// Lazily decode every record in the container.
    pub fn read(&self) -> StorageResult<RecordStream> {
        let path = self.location.existing_path()?;
        if file_len(&path)? == 0 {
            return Ok(Box::new(std::iter::empty()));
        }
        let file = File::open(&path).map_err(|e| StorageError::io(&path, e))?;
        let reader: Reader<'static, BufReader<File>> = Reader::new(BufReader::new(file))?;
        Ok(Box::new(reader.map(|item| {
            let value = item?;
            match avro_to_json(value)? {
                Value::Object(record) => Ok(record),
                other => Err(StorageError::encoding(format!(
                    "Stored Avro datum is not a record: {}",
                    other
                ))),
            }
        })))
    }

    fn write_container(&self, path: &Path, values: Vec<AvroValue>) -> StorageResult<()> {
        let count = values.len();
        let mut writer = Writer::with_codec(&self.schema, Vec::new(), self.codec);
        for value in values {
            writer.append(value).map_err(avro_encoding)?;
        }
        let bytes = writer.into_inner()?;
        std::fs::write(path, bytes).map_err(|e| StorageError::io(path, e))?;
        debug!("Wrote {} records to new container {}", count, path.display());
        Ok(())
    }

    fn append_blocks(&self, path: &Path, values: Vec<AvroValue>) -> StorageResult<()> {
        if stored_schema(path)?.canonical_form() != self.schema.canonical_form() {
            return Err(StorageError::encoding(format!(
                "Schema stored in {} differs from the resource schema; overwrite instead of appending",
                path.display()
            )));
        }
        if values.is_empty() {
            return Ok(());
        }

        let count = values.len();
        let mut writer = Writer::append_to_with_codec(
            &self.schema,
            Vec::new(),
            stored_codec(path)?,
            sync_marker(path)?,
        );
        for value in values {
            writer.append(value).map_err(avro_encoding)?;
        }
        let bytes = writer.into_inner()?;

        let mut file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| StorageError::io(path, e))?;
        file.write_all(&bytes).map_err(|e| StorageError::io(path, e))?;
        file.flush().map_err(|e| StorageError::io(path, e))?;
        debug!("Appended {} records to {}", count, path.display());
        Ok(())
    }
}

fn file_len(path: &Path) -> StorageResult<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

fn avro_encoding(err: apache_avro::Error) -> StorageError {
    StorageError::Encoding {
        message: err.to_string(),
        source: Some(Box::new(err)),
    }
}

/// Writer schema embedded in an existing container.
fn stored_schema(path: &Path) -> StorageResult<Schema> {
    let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    let reader = Reader::new(BufReader::new(file))?;
    Ok(reader.writer_schema().clone())
}

/// Sync marker of an existing container; every container ends with it.
fn sync_marker(path: &Path) -> StorageResult<[u8; SYNC_SIZE]> {
    let io_err = |e: io::Error| StorageError::io(path, e);
    let mut file = File::open(path).map_err(io_err)?;
    let len = file.metadata().map_err(io_err)?.len();
    let tail = SYNC_SIZE as u64 + 1;
    if len < tail {
        return Err(io_err(invalid_data("container too short for a sync marker")));
    }
    file.seek(SeekFrom::End(-(tail as i64))).map_err(io_err)?;
    let mut buf = vec![0u8; tail as usize];
    file.read_exact(&mut buf).map_err(io_err)?;
    Ok(read_marker(&buf))
}

/// Block codec named in the container header (`avro.codec`).
fn stored_codec(path: &Path) -> StorageResult<Codec> {
    let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let corrupt = |e: io::Error| StorageError::io(path, e);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(corrupt)?;
    if &magic != MAGIC {
        return Err(corrupt(invalid_data("not an Avro object container file")));
    }

    let mut codec: Option<Vec<u8>> = None;
    loop {
        let mut count = read_long(&mut reader).map_err(corrupt)?;
        if count == 0 {
            break;
        }
        if count < 0 {
            // Negative count is followed by the block byte size
            count = -count;
            read_long(&mut reader).map_err(corrupt)?;
        }
        for _ in 0..count {
            let key = read_bytes(&mut reader).map_err(corrupt)?;
            let value = read_bytes(&mut reader).map_err(corrupt)?;
            if key == b"avro.codec" {
                codec = Some(value);
            }
        }
    }

    match codec.as_deref() {
        None | Some(b"null") => Ok(Codec::Null),
        Some(b"deflate") => Ok(Codec::Deflate),
        Some(other) => Err(corrupt(invalid_data(&format!(
            "unsupported codec '{}'",
            String::from_utf8_lossy(other)
        )))),
    }
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Zig-zag varint, as used for every Avro `long`.
fn read_long<R: Read>(reader: &mut R) -> io::Result<i64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(invalid_data("varint overflow"));
        }
    }
    Ok(((value >> 1) as i64) ^ -((value & 1) as i64))
}

fn read_bytes<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = read_long(reader)?;
    if !(0..=MAX_META_ENTRY).contains(&len) {
        return Err(invalid_data("bad metadata length"));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn field_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

fn encode_record(fields: &[SchemaField], record: &Record, parent: &str) -> StorageResult<AvroValue> {
    if let Some(unknown) = record.keys().find(|k| !fields.iter().any(|f| &f.name == *k)) {
        return Err(StorageError::encoding(format!(
            "Field '{}' is not in the schema",
            field_path(parent, unknown)
        )));
    }

    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        let path = field_path(parent, &field.name);
        let value = record
            .get(&field.name)
            .filter(|v| !v.is_null())
            .or(field.default.as_ref())
            .unwrap_or(&Value::Null);
        out.push((field.name.clone(), encode_field(field, value, &path)?));
    }
    Ok(AvroValue::Record(out))
}

fn encode_field(field: &SchemaField, value: &Value, path: &str) -> StorageResult<AvroValue> {
    match field.mode {
        FieldMode::Nullable => {
            if value.is_null() {
                Ok(AvroValue::Union(1, Box::new(AvroValue::Null)))
            } else {
                Ok(AvroValue::Union(0, Box::new(encode_value(field, value, path)?)))
            }
        }
        FieldMode::Required => {
            if value.is_null() {
                return Err(StorageError::encoding(format!(
                    "Required field '{}' is missing",
                    path
                )));
            }
            encode_value(field, value, path)
        }
        // Missing repeated fields are stored as empty arrays
        FieldMode::Repeated => match value {
            Value::Null => Ok(AvroValue::Array(Vec::new())),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| encode_value(field, item, &format!("{}[{}]", path, i)))
                .collect::<StorageResult<Vec<_>>>()
                .map(AvroValue::Array),
            other => Err(mismatch(path, "array", other)),
        },
    }
}

fn encode_value(field: &SchemaField, value: &Value, path: &str) -> StorageResult<AvroValue> {
    let kind = match &field.field_type {
        FieldType::Record(children) => {
            return match value {
                Value::Object(record) => encode_record(children, record, path),
                other => Err(mismatch(path, "record", other)),
            };
        }
        FieldType::Primitive(kind) => kind,
    };

    match (kind, value) {
        (PrimitiveKind::Integer, Value::Number(n)) => n
            .as_i64()
            .map(AvroValue::Long)
            .ok_or_else(|| mismatch(path, "integer", value)),
        (PrimitiveKind::Float | PrimitiveKind::Timestamp, Value::Number(n)) => n
            .as_f64()
            .map(AvroValue::Double)
            .ok_or_else(|| mismatch(path, "number", value)),
        (PrimitiveKind::Boolean, Value::Bool(b)) => Ok(AvroValue::Boolean(*b)),
        (
            PrimitiveKind::String
            | PrimitiveKind::DateTime
            | PrimitiveKind::Date
            | PrimitiveKind::Other(_),
            Value::String(s),
        ) => Ok(AvroValue::String(s.clone())),
        (kind, other) => Err(mismatch(path, kind.as_str(), other)),
    }
}

fn mismatch(path: &str, expected: &str, got: &Value) -> StorageError {
    let got = match got {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    StorageError::encoding(format!(
        "Field '{}' expects {}, got {}",
        path, expected, got
    ))
}

fn avro_to_json(value: AvroValue) -> StorageResult<Value> {
    Ok(match value {
        AvroValue::Null => Value::Null,
        AvroValue::Boolean(b) => Value::Bool(b),
        AvroValue::Int(i) => Value::from(i),
        AvroValue::Long(i) => Value::from(i),
        AvroValue::Float(f) => float_to_json(f64::from(f)),
        AvroValue::Double(f) => float_to_json(f),
        AvroValue::String(s) | AvroValue::Enum(_, s) => Value::String(s),
        AvroValue::Bytes(b) | AvroValue::Fixed(_, b) => Value::from(b),
        AvroValue::Union(_, inner) => avro_to_json(*inner)?,
        AvroValue::Array(items) => Value::Array(
            items
                .into_iter()
                .map(avro_to_json)
                .collect::<StorageResult<Vec<_>>>()?,
        ),
        AvroValue::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k, avro_to_json(v)?)))
                .collect::<StorageResult<Map<_, _>>>()?,
        ),
        AvroValue::Record(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| Ok((k, avro_to_json(v)?)))
                .collect::<StorageResult<Map<_, _>>>()?,
        ),
        other => {
            return Err(StorageError::encoding(format!(
                "Unsupported Avro value in stored data: {:?}",
                other
            )))
        }
    })
}

fn float_to_json(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ETL_TIMESTAMP_FIELD;
    use serde_json::json;
    use tempfile::TempDir;

    fn schema() -> Vec<SchemaField> {
        vec![
            SchemaField::new("station", PrimitiveKind::String).required(),
            SchemaField::new("value", PrimitiveKind::Float),
            SchemaField::new("count", PrimitiveKind::Integer),
            SchemaField::record(
                "location",
                vec![
                    SchemaField::new("lat", PrimitiveKind::Float),
                    SchemaField::new("lon", PrimitiveKind::Float),
                ],
            ),
            SchemaField::new("tags", PrimitiveKind::String).repeated(),
        ]
    }

    fn avro_file(temp: &TempDir, codec: Codec) -> AvroFile {
        let location = FileLocation::new(temp.path().join("eea"), "measurements", "avro", None);
        AvroFile::new(location, "measurements", &schema(), codec).unwrap()
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn sample(station: &str) -> Record {
        record(json!({
            "station": station,
            "value": 12.5,
            "count": 3,
            "location": {"lat": 52.1, "lon": 4.3},
            "tags": ["no2", "hourly"],
        }))
    }

    fn read_all(file: &AvroFile) -> Vec<Record> {
        file.read().unwrap().map(Result::unwrap).collect()
    }

    fn stations(file: &AvroFile) -> Vec<String> {
        read_all(file)
            .iter()
            .map(|r| r["station"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_round_trip_nested() {
        let temp = TempDir::new().unwrap();
        let file = avro_file(&temp, Codec::Deflate);
        file.write(vec![sample("NL001")], false).unwrap();

        let records = read_all(&file);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r["station"], json!("NL001"));
        assert_eq!(r["value"], json!(12.5));
        assert_eq!(r["count"], json!(3));
        assert_eq!(r["location"]["lat"], json!(52.1));
        assert_eq!(r["tags"], json!(["no2", "hourly"]));
        assert!(r[ETL_TIMESTAMP_FIELD].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_missing_nullable_fields_read_back_as_null() {
        let temp = TempDir::new().unwrap();
        let file = avro_file(&temp, Codec::Null);
        file.write(vec![record(json!({"station": "X"}))], false).unwrap();

        let r = &read_all(&file)[0];
        assert_eq!(r["value"], Value::Null);
        assert_eq!(r["location"], Value::Null);
        assert_eq!(r["tags"], json!([]));
    }

    #[test]
    fn test_header_records_codec() {
        let temp = TempDir::new().unwrap();
        for codec in [Codec::Deflate, Codec::Null] {
            let file = avro_file(&temp, codec);
            file.write(vec![sample("A")], false).unwrap();
            let path = file.location().full_path();
            assert_eq!(stored_codec(&path).unwrap(), codec);
            assert_eq!(
                stored_schema(&path).unwrap().canonical_form(),
                file.schema().canonical_form()
            );
        }
    }

    #[test]
    fn test_append_adds_blocks() {
        let temp = TempDir::new().unwrap();
        let file = avro_file(&temp, Codec::Deflate);
        file.write(vec![sample("A")], false).unwrap();
        file.write(vec![sample("B"), sample("C")], true).unwrap();
        file.write(Vec::new(), true).unwrap();

        // Large enough to span several blocks
        let many: Vec<Record> = (0..2000).map(|i| sample(&format!("S{}", i))).collect();
        file.write(many, true).unwrap();

        let all = stations(&file);
        assert_eq!(all.len(), 2003);
        assert_eq!(&all[..3], ["A", "B", "C"]);
        assert_eq!(all[2002], "S1999");
    }

    #[test]
    fn test_append_onto_null_codec_file_keeps_its_codec() {
        let temp = TempDir::new().unwrap();
        avro_file(&temp, Codec::Null)
            .write(vec![sample("A")], false)
            .unwrap();

        let deflate = avro_file(&temp, Codec::Deflate);
        deflate.write(vec![sample("B")], true).unwrap();
        assert_eq!(stations(&deflate), ["A", "B"]);
    }

    #[test]
    fn test_append_to_missing_or_empty_file_creates_container() {
        let temp = TempDir::new().unwrap();
        let file = avro_file(&temp, Codec::Deflate);
        file.write(vec![sample("A")], true).unwrap();
        assert_eq!(stations(&file), ["A"]);

        std::fs::write(file.location().full_path(), b"").unwrap();
        file.write(vec![sample("B")], true).unwrap();
        assert_eq!(stations(&file), ["B"]);
    }

    #[test]
    fn test_overwrite_replaces_and_empty_overwrite_is_valid() {
        let temp = TempDir::new().unwrap();
        let file = avro_file(&temp, Codec::Deflate);
        file.write(vec![sample("A"), sample("B")], false).unwrap();
        file.write(vec![sample("C")], false).unwrap();
        assert_eq!(stations(&file), ["C"]);

        file.write(Vec::new(), false).unwrap();
        assert!(stations(&file).is_empty());
    }

    #[test]
    fn test_append_with_different_schema_refused() {
        let temp = TempDir::new().unwrap();
        avro_file(&temp, Codec::Deflate)
            .write(vec![sample("A")], false)
            .unwrap();
        let path = temp.path().join("eea/measurements.avro");
        let before = std::fs::read(&path).unwrap();

        let location = FileLocation::new(temp.path().join("eea"), "measurements", "avro", None);
        let other = AvroFile::new(
            location,
            "measurements",
            &[SchemaField::new("station", PrimitiveKind::String)],
            Codec::Deflate,
        )
        .unwrap();
        let err = other
            .write(vec![record(json!({"station": "B"}))], true)
            .unwrap_err();
        assert!(err.is_encoding());
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_encoding_errors_leave_no_file() {
        let temp = TempDir::new().unwrap();
        let file = avro_file(&temp, Codec::Deflate);
        let bad = [
            (json!({"station": "A", "extra": 1}), "extra"),
            (json!({"value": 1.0}), "station"),
            (json!({"station": null}), "station"),
            (json!({"station": "A", "count": 1.5}), "count"),
            (json!({"station": "A", "count": "3"}), "count"),
            (json!({"station": "A", "location": {"lat": "x"}}), "location.lat"),
            (json!({"station": "A", "location": {"alt": 1}}), "location.alt"),
            (json!({"station": "A", "tags": "no2"}), "tags"),
            (json!({"station": "A", "tags": ["a", 1]}), "tags[1]"),
        ];
        for (value, field) in bad {
            let err = file
                .write(vec![sample("ok"), record(value.clone())], false)
                .unwrap_err();
            assert!(err.is_encoding(), "{} -> {}", value, err);
            assert!(err.to_string().contains(field), "{} -> {}", value, err);
        }
        assert!(!file.location().full_path().exists());
    }

    #[test]
    fn test_integers_accepted_for_float_fields() {
        let temp = TempDir::new().unwrap();
        let file = avro_file(&temp, Codec::Deflate);
        file.write(vec![record(json!({"station": "A", "value": 7}))], false)
            .unwrap();
        assert_eq!(read_all(&file)[0]["value"].as_f64(), Some(7.0));
    }

    #[test]
    fn test_required_default_fills_missing_value() {
        let temp = TempDir::new().unwrap();
        let location = FileLocation::new(temp.path(), "t", "avro", None);
        let file = AvroFile::new(
            location,
            "t",
            &[SchemaField::new("unit", PrimitiveKind::String)
                .required()
                .with_default(json!("ppm"))],
            Codec::Null,
        )
        .unwrap();
        file.write(vec![Record::new()], false).unwrap();
        assert_eq!(read_all(&file)[0]["unit"], json!("ppm"));
    }

    #[test]
    fn test_meta_field_collision_is_config_error() {
        let temp = TempDir::new().unwrap();
        let location = FileLocation::new(temp.path(), "t", "avro", None);
        let err = AvroFile::new(
            location,
            "t",
            &[SchemaField::new(ETL_TIMESTAMP_FIELD, PrimitiveKind::Timestamp)],
            Codec::Null,
        )
        .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_not_a_container_is_storage_error() {
        let temp = TempDir::new().unwrap();
        let file = avro_file(&temp, Codec::Deflate);
        std::fs::create_dir_all(temp.path().join("eea")).unwrap();
        std::fs::write(file.location().full_path(), b"{\"a\": 1}\n").unwrap();

        let err = file.write(vec![sample("A")], true).unwrap_err();
        assert!(err.is_storage());
        assert!(file.read().is_err());
    }

    #[test]
    fn test_varint_decoding() {
        let cases: [(i64, &[u8]); 5] = [
            (0, &[0x00]),
            (-1, &[0x01]),
            (1, &[0x02]),
            (64, &[0x80, 0x01]),
            (-65, &[0x81, 0x01]),
        ];
        for (n, mut bytes) in cases {
            assert_eq!(read_long(&mut bytes).unwrap(), n);
        }
        assert!(read_long(&mut &[0x80u8][..]).is_err());
    }

    #[test]
    fn test_empty_overwrite_reads_empty_then_accepts_appends() {
        let temp = TempDir::new().unwrap();
        let file = avro_file(&temp, Codec::Deflate);
        file.write(vec![sample("A")], false).unwrap();
        file.write(Vec::new(), false).unwrap();
        assert_eq!(file.read().unwrap().count(), 0);

        file.write(vec![sample("B")], true).unwrap();
        file.write(vec![sample("C")], true).unwrap();
        assert_eq!(stations(&file), ["B", "C"]);
    }

    #[test]
    fn test_appended_blocks_reuse_file_marker() {
        let temp = TempDir::new().unwrap();
        let file = avro_file(&temp, Codec::Null);
        file.write(vec![sample("A")], false).unwrap();
        let path = file.location().full_path();
        let marker = sync_marker(&path).unwrap();

        file.write(vec![sample("B")], true).unwrap();
        assert_eq!(sync_marker(&path).unwrap(), marker);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[bytes.len() - SYNC_SIZE..], &marker[..]);
    }
}
