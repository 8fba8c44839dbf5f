//! Error types for the rollup engine

use std::fmt::Display;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for prepare and run phases
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Storage write error at {}: {reason}", path.display())]
    StorageWrite { path: PathBuf, reason: String },

    #[error("Index build error for dimension '{dimension}': {reason}")]
    IndexBuild { dimension: String, reason: String },

    #[error("Query error: {0}")]
    Query(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store not prepared: {0}")]
    NotPrepared(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Unsupported type for operation: {0}")]
    UnsupportedType(String),
}

impl EngineError {
    pub fn storage_write(path: &Path, reason: impl Display) -> Self {
        EngineError::StorageWrite {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn query(reason: impl Into<String>) -> Self {
        EngineError::Query(reason.into())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Why a raw record was rejected during ingest. Recoverable: the record is
/// dropped and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedRecordError {
    #[error("missing required field '{0}'")]
    Missing(&'static str),

    #[error("invalid value {value:?} for field '{field}'")]
    Invalid { field: &'static str, value: String },

    #[error("unparseable record: {0}")]
    Unparseable(String),
}
