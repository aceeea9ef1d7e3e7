//! Extractor error types
//!
//! Every failure in the pipeline is an [`ExtractError`]. Reports carry the flat
//! [`ErrorKind`] so a run summary can be grouped and filtered without holding
//! on to the error values themselves.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dictionary::UnknownTypeError;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ExtractError>;

/// How an object store rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Network failure, timeout, 5xx
    Transient,
    /// 429 / 503 SlowDown / "server busy"
    Throttled,
    /// Auth, missing container, bad request
    Permanent,
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Table not found: {0}")]
    SchemaNotFound(String),

    #[error("Column '{column}': {source}")]
    UnknownType {
        column: String,
        #[source]
        source: UnknownTypeError,
    },

    #[error("Cannot coerce row {row}, column '{column}': {reason}")]
    Coercion {
        row: u64,
        column: String,
        reason: String,
    },

    #[error("Upload of {key} failed after {attempts} attempt(s): {reason}")]
    UploadFailed {
        key: String,
        attempts: u32,
        reason: String,
    },

    #[error("Backend error ({kind:?}): {message}")]
    Backend {
        kind: BackendErrorKind,
        message: String,
    },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] pgl_common::CommonError),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Flat classification of [`ExtractError`] used in run reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    SchemaNotFound,
    UnknownType,
    Coercion,
    UploadFailed,
    Backend,
    Query,
    Config,
    Serialization,
    Io,
    Cancelled,
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::Connection(_) => ErrorKind::Connection,
            ExtractError::SchemaNotFound(_) => ErrorKind::SchemaNotFound,
            ExtractError::UnknownType { .. } => ErrorKind::UnknownType,
            ExtractError::Coercion { .. } => ErrorKind::Coercion,
            ExtractError::UploadFailed { .. } => ErrorKind::UploadFailed,
            ExtractError::Backend { .. } => ErrorKind::Backend,
            ExtractError::Query(_) => ErrorKind::Query,
            ExtractError::Config(_) => ErrorKind::Config,
            ExtractError::Serialization(_) => ErrorKind::Serialization,
            ExtractError::Io(_) | ExtractError::Common(_) => ErrorKind::Io,
            ExtractError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ExtractError::Connection(_) => true,
            ExtractError::Backend { kind, .. } => {
                matches!(kind, BackendErrorKind::Transient | BackendErrorKind::Throttled)
            },
            _ => false,
        }
    }

    pub fn backend(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        ExtractError::Backend {
            kind,
            message: message.into(),
        }
    }
}

impl From<parquet::errors::ParquetError> for ExtractError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        ExtractError::Serialization(format!("parquet: {}", err))
    }
}

impl From<arrow::error::ArrowError> for ExtractError {
    fn from(err: arrow::error::ArrowError) -> Self {
        ExtractError::Serialization(format!("arrow: {}", err))
    }
}
