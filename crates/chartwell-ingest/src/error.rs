//! Error taxonomy for the ingestion pipeline

use chartwell_common::CommonError;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

fn row_hint(row: &Option<usize>) -> String {
    match row {
        Some(index) => format!(" at row {}", index),
        None => String::new(),
    }
}

/// Errors surfaced by the file store, the storage gateway, jobs and outbound requests
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("File store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported connector kind: {0}")]
    UnsupportedConnector(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Schema operation on table {table} failed: {message}")]
    SchemaOperationFailed {
        table: String,
        message: String,
        /// Set when the backend rejected a CREATE because the table exists
        already_exists: bool,
    },

    #[error("Write to table {table} failed{}: {message}", row_hint(.row))]
    WriteFailed {
        table: String,
        /// Offending row, when the backend or the value coercion could tell
        row: Option<usize>,
        message: String,
    },

    #[error("Connection to storage backend lost: {0}")]
    ConnectionLost(String),

    #[error("Request {request_id} to {endpoint} failed after {attempts} attempts: {cause}")]
    RequestFailed {
        request_id: String,
        endpoint: String,
        attempts: u32,
        cause: String,
    },

    #[error("Parse error at record {record}: {message}")]
    Parse { record: u64, message: String },

    #[error("Job cancelled")]
    Cancelled,

    #[error("Job already running for source {source_id} and file {file}")]
    JobAlreadyRunning { source_id: String, file: String },

    #[error("Source {0} is not active")]
    InactiveSource(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl IngestError {
    /// Stable machine-readable name used in logs and job snapshots
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::StorageUnavailable(_) => "storage_unavailable",
            IngestError::NotFound(_) => "not_found",
            IngestError::UnsupportedConnector(_) => "unsupported_connector",
            IngestError::SchemaMismatch(_) => "schema_mismatch",
            IngestError::SchemaOperationFailed { .. } => "schema_operation_failed",
            IngestError::WriteFailed { .. } => "write_failed",
            IngestError::ConnectionLost(_) => "connection_lost",
            IngestError::RequestFailed { .. } => "request_failed",
            IngestError::Parse { .. } => "parse",
            IngestError::Cancelled => "cancelled",
            IngestError::JobAlreadyRunning { .. } => "job_already_running",
            IngestError::InactiveSource(_) => "inactive_source",
            IngestError::Config(_) => "config",
            IngestError::Validation(_) => "validation",
            IngestError::Serialization(_) => "serialization",
            IngestError::Common(_) => "common",
        }
    }

    /// True for a CREATE TABLE rejected because the table is already there
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            IngestError::SchemaOperationFailed {
                already_exists: true,
                ..
            }
        )
    }

    pub fn write_failed(table: impl Into<String>, row: Option<usize>, message: impl Into<String>) -> Self {
        IngestError::WriteFailed {
            table: table.into(),
            row,
            message: message.into(),
        }
    }

    pub fn schema_failed(table: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::SchemaOperationFailed {
            table: table.into(),
            message: message.into(),
            already_exists: false,
        }
    }
}
