use labrec_core::{Category, ColumnDiff, RecordError, RecordGroup};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("record error: {0}")]
    Record(#[from] RecordError),
    #[error(
        "schema conflict writing group {group} {category} columns to {}: {diff}",
        .target.display()
    )]
    SchemaConflict {
        target: PathBuf,
        group: RecordGroup,
        category: Category,
        diff: ColumnDiff,
    },
    #[error(
        "type conflict writing group {group} column '{column}' to {}: stored as {expected}, got {found}",
        .target.display()
    )]
    TypeConflict {
        target: PathBuf,
        group: RecordGroup,
        column: String,
        expected: String,
        found: String,
    },
    #[error("unsupported target schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("target {} is not usable: {reason}", .target.display())]
    CorruptTarget { target: PathBuf, reason: String },
    #[error("group {group} precedes group {last} already persisted in {}", .target.display())]
    OutOfOrder {
        target: PathBuf,
        group: RecordGroup,
        last: RecordGroup,
    },
    #[error("target {} is locked by another recorder", .target.display())]
    Locked { target: PathBuf },
    #[error("target {} is already open", .target.display())]
    AlreadyOpen { target: PathBuf },
    #[error("target {} has not been opened", .target.display())]
    NotOpen { target: PathBuf },
    #[error("target {} is closed", .target.display())]
    ClosedTarget { target: PathBuf },
    #[error("write of group {group} to {} failed: {source}", .target.display())]
    Write {
        target: PathBuf,
        group: RecordGroup,
        #[source]
        source: Box<RecorderError>,
    },
}

impl RecorderError {
    pub(crate) fn serialization(err: impl ToString) -> Self {
        Self::Serialization(err.to_string())
    }

    pub(crate) fn corrupt(target: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Whether re-invoking the same write may succeed. Schema, type and
    /// lifecycle errors will fail again until the caller changes something.
    pub fn is_retryable(&self) -> bool {
        match self {
            RecorderError::Io(_) | RecorderError::Sqlite(_) => true,
            RecorderError::Csv(err) => matches!(err.kind(), csv::ErrorKind::Io(_)),
            RecorderError::Write { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
