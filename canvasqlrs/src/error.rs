use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CanvasqlError>;

#[derive(Debug, Error)]
pub enum CanvasqlError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("table '{0}' not found")]
    UnknownTable(String),
    #[error("column '{column}' not found on {table}")]
    UnknownColumn { table: String, column: String },
    #[error("no join path found between {left} and {right}")]
    JoinNotFound { left: String, right: String },
    #[error("schema unavailable: {0}")]
    SchemaUnavailable(String),
    #[error("unknown datasource {0}")]
    UnknownDatasource(String),
    #[error("unsupported driver {0}")]
    UnsupportedDriver(String),
    #[error("connection name '{0}' is already in use; run a full refresh to reload it")]
    ConnectionNameConflict(String),
    #[error("invalid connection name '{0}': only letters, digits, '-' and '_' are allowed")]
    InvalidConnectionName(String),
    #[error("an ETL run for connection '{0}' is already in progress")]
    EtlInProgress(String),
    #[error("bulk copy of table {table} failed: {message}")]
    BulkCopyFailure { table: String, message: String },
    #[error("execution error: {0}")]
    Execution(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CanvasqlError {
    /// HTTP status class for the error at the API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            CanvasqlError::Validation(_)
            | CanvasqlError::JoinNotFound { .. }
            | CanvasqlError::InvalidConnectionName(_)
            | CanvasqlError::UnsupportedDriver(_)
            | CanvasqlError::Json(_) => 400,
            CanvasqlError::UnknownTable(_)
            | CanvasqlError::UnknownColumn { .. }
            | CanvasqlError::UnknownDatasource(_) => 404,
            CanvasqlError::ConnectionNameConflict(_) | CanvasqlError::EtlInProgress(_) => 409,
            _ => 500,
        }
    }

    /// Caller input errors are reported verbatim; everything else is infrastructure.
    pub fn is_input_error(&self) -> bool {
        self.status_code() < 500
    }
}

/// `{success: false, message, error}` body returned to API callers.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub message: String,
    pub error: String,
}

impl ErrorEnvelope {
    pub fn from_error(err: &CanvasqlError) -> Self {
        let message = if err.is_input_error() {
            err.to_string()
        } else {
            match err {
                CanvasqlError::SchemaUnavailable(_) => "failed to load database schema".to_string(),
                CanvasqlError::BulkCopyFailure { .. } => "data transfer failed".to_string(),
                _ => "failed to process the request".to_string(),
            }
        };
        Self {
            success: false,
            message,
            error: err.to_string(),
        }
    }
}
