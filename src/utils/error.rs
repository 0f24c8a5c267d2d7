use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Configuration validation failed for {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Authentication failed ({scope}): {message}")]
    AuthError { scope: String, message: String },

    #[error("Remote store {operation} failed: code={code}, msg={message}")]
    RemoteApiError {
        operation: String,
        code: i64,
        message: String,
    },

    #[error("Remote store rejected unknown field names: {fields:?} ({message})")]
    FieldNameNotFound { fields: Vec<String>, message: String },

    #[error("Remote store rejected a chunk of {size} records: {message}")]
    BatchLimitExceeded { size: usize, message: String },

    #[error("Pagination error: {message}")]
    PaginationError { message: String },

    #[error("Analysis backend '{provider}' failed: {message}")]
    BackendError {
        provider: String,
        message: String,
        raw_response: Option<String>,
    },

    #[error("Could not parse analysis output: {message}")]
    ParseError { message: String },

    #[error("Worker for batch {batch} aborted: {message}")]
    WorkerError { batch: usize, message: String },
}

pub type Result<T> = std::result::Result<T, EtlError>;

/// 錯誤分類，用於執行摘要與重跑判斷
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Auth,
    RemoteApi,
    Analysis,
    Parse,
    LocalIo,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "config",
            ErrorCategory::Auth => "auth",
            ErrorCategory::RemoteApi => "remote_api",
            ErrorCategory::Analysis => "analysis",
            ErrorCategory::Parse => "parse",
            ErrorCategory::LocalIo => "local_io",
            ErrorCategory::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EtlError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EtlError::ConfigError { .. }
            | EtlError::MissingConfigError { .. }
            | EtlError::InvalidConfigValueError { .. }
            | EtlError::ConfigValidationError { .. } => ErrorCategory::Config,
            EtlError::AuthError { .. } => ErrorCategory::Auth,
            EtlError::RemoteApiError { .. }
            | EtlError::FieldNameNotFound { .. }
            | EtlError::BatchLimitExceeded { .. }
            | EtlError::PaginationError { .. }
            | EtlError::HttpError(_) => ErrorCategory::RemoteApi,
            EtlError::BackendError { .. } => ErrorCategory::Analysis,
            EtlError::ParseError { .. } | EtlError::SerializationError(_) => ErrorCategory::Parse,
            EtlError::IoError(_) => ErrorCategory::LocalIo,
            EtlError::WorkerError { .. } => ErrorCategory::Internal,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::LocalIo => ErrorSeverity::Low,
            ErrorCategory::Analysis | ErrorCategory::Parse => ErrorSeverity::Medium,
            ErrorCategory::RemoteApi | ErrorCategory::Auth => ErrorSeverity::High,
            ErrorCategory::Config | ErrorCategory::Internal => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            EtlError::MissingConfigError { field } => {
                format!("Set '{}' in the config file or via an environment variable", field)
            }
            EtlError::InvalidConfigValueError { field, .. }
            | EtlError::ConfigValidationError { field, .. } => {
                format!("Check the value of '{}' in the config file", field)
            }
            EtlError::ConfigError { .. } => "Review the configuration file".to_string(),
            EtlError::AuthError { .. } => {
                "Check the Feishu app_id/app_secret or the static token for this scope".to_string()
            }
            EtlError::FieldNameNotFound { fields, .. } => format!(
                "Add the missing columns to the target table or map them via sink.field_mapping: {:?}",
                fields
            ),
            EtlError::BatchLimitExceeded { .. } => {
                "Lower execution.remote_batch_limit".to_string()
            }
            EtlError::RemoteApiError { .. } | EtlError::HttpError(_) => {
                "Verify store/table/view ids and network access, then re-run the failed batches"
                    .to_string()
            }
            EtlError::PaginationError { .. } => {
                "The remote store returned an inconsistent cursor; retry the run".to_string()
            }
            EtlError::BackendError { .. } => {
                "Check the analysis provider credentials and quota, then re-run the failed batches"
                    .to_string()
            }
            EtlError::ParseError { .. } | EtlError::SerializationError(_) => {
                "Inspect the raw model output and tighten the instruction template".to_string()
            }
            EtlError::IoError(_) => "Check permissions of the local output paths".to_string(),
            EtlError::WorkerError { .. } => "Re-run the failed batch".to_string(),
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Config => format!("Configuration problem: {}", self),
            ErrorCategory::Auth => format!("Could not authenticate with the table store: {}", self),
            ErrorCategory::RemoteApi => format!("The table store reported a failure: {}", self),
            ErrorCategory::Analysis => format!("The analysis model call failed: {}", self),
            ErrorCategory::Parse => format!("The model output was not usable: {}", self),
            ErrorCategory::LocalIo => format!("Local file problem: {}", self),
            ErrorCategory::Internal => format!("Unexpected internal failure: {}", self),
        }
    }

    /// 原始回應文字（若有）
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            EtlError::BackendError { raw_response, .. } => raw_response.as_deref(),
            _ => None,
        }
    }
}
