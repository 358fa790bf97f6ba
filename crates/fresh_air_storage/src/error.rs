//! Error types for the storage layer.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Storage operation result type.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration; fatal at construction, never retried.
    Config,
    /// Record shape incompatible with the compiled schema.
    Encoding,
    /// Filesystem, network or remote job failure.
    Storage,
}

/// Storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Invalid backend selection, partitioning, path or schema
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record does not fit the compiled schema
    #[error("Encoding error: {message}")]
    Encoding {
        message: String,
        #[source]
        source: Option<Box<apache_avro::Error>>,
    },

    /// IO error on a local file
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Resource has never been written
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote job or API failure, message kept verbatim
    #[error("Warehouse error: {0}")]
    Warehouse(String),

    /// Transport failure talking to the warehouse
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed JSON on disk or on the wire
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Corrupt or unreadable Avro container
    #[error("Avro error: {0}")]
    Avro(#[source] Box<apache_avro::Error>),
}

impl StorageError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an encoding error without an underlying codec error.
    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a warehouse error.
    pub fn warehouse(msg: impl Into<String>) -> Self {
        Self::Warehouse(msg.into())
    }

    pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Config(_) => ErrorKind::Config,
            StorageError::Encoding { .. } => ErrorKind::Encoding,
            StorageError::Io { .. }
            | StorageError::NotFound(_)
            | StorageError::Warehouse(_)
            | StorageError::Http(_)
            | StorageError::Json(_)
            | StorageError::Avro(_) => ErrorKind::Storage,
        }
    }

    pub fn is_config(&self) -> bool {
        self.kind() == ErrorKind::Config
    }

    pub fn is_encoding(&self) -> bool {
        self.kind() == ErrorKind::Encoding
    }

    pub fn is_storage(&self) -> bool {
        self.kind() == ErrorKind::Storage
    }
}

impl From<apache_avro::Error> for StorageError {
    fn from(err: apache_avro::Error) -> Self {
        StorageError::Avro(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(StorageError::config("x").kind(), ErrorKind::Config);
        assert_eq!(StorageError::encoding("x").kind(), ErrorKind::Encoding);
        assert_eq!(StorageError::not_found("x").kind(), ErrorKind::Storage);
        assert_eq!(StorageError::warehouse("x").kind(), ErrorKind::Storage);

        let io = StorageError::io("/tmp/x", io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(io.is_storage());
        assert!(io.to_string().contains("/tmp/x"));
    }

    #[test]
    fn test_warehouse_message_verbatim() {
        let err = StorageError::warehouse("Provided Schema does not match Table");
        assert_eq!(
            err.to_string(),
            "Warehouse error: Provided Schema does not match Table"
        );
    }
}
