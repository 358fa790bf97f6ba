//! JSON lines files: one JSON object per line.

use super::FileLocation;
use crate::error::{StorageError, StorageResult};
use crate::lock::WriteLock;
use crate::meta::stamp_batch;
use crate::resource::{Record, RecordStream};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::debug;

/// Schema-less line-delimited JSON file.
#[derive(Debug, Clone)]
pub struct JsonLinesFile {
    location: FileLocation,
}

impl JsonLinesFile {
    pub fn new(location: FileLocation) -> Self {
        Self { location }
    }

    pub fn location(&self) -> &FileLocation {
        &self.location
    }

    /// Write a stamped batch. Each line is complete before the next starts.
    pub fn write(&self, records: Vec<Record>, append: bool) -> StorageResult<()> {
        self.location.ensure_dir()?;
        let path = self.location.full_path();

        let _lock = WriteLock::acquire(&path, self.location.coordinator());
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        let mut writer = BufWriter::new(file);
        let mut count = 0usize;
        for record in stamp_batch(records) {
            serde_json::to_writer(&mut writer, &record)?;
            writer.write_all(b"\n").map_err(|e| StorageError::io(&path, e))?;
            count += 1;
        }
        writer.flush().map_err(|e| StorageError::io(&path, e))?;
        debug!("Wrote {} records to {}", count, path.display());
        Ok(())
    }

    /// Lazily decode the file line by line; blank lines are skipped.
    pub fn read(&self) -> StorageResult<RecordStream> {
        let path = self.location.existing_path()?;
        let file = File::open(&path).map_err(|e| StorageError::io(&path, e))?;
        Ok(Box::new(JsonLines {
            path,
            lines: BufReader::new(file).lines(),
            line_no: 0,
        }))
    }
}

struct JsonLines {
    path: PathBuf,
    lines: std::io::Lines<BufReader<File>>,
    line_no: usize,
}

impl Iterator for JsonLines {
    type Item = StorageResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(StorageError::io(&self.path, e))),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(parse_line(&line, self.line_no).map_err(|e| StorageError::io(&self.path, e)));
        }
    }
}

fn parse_line(line: &str, line_no: usize) -> io::Result<Record> {
    let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(other) => Err(invalid(format!(
            "Line {} is not a JSON object: {}",
            line_no, other
        ))),
        Err(e) => Err(invalid(format!("Line {} is not valid JSON: {}", line_no, e))),
    }
}
