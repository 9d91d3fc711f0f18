//! Error taxonomy shared by adapters, the transfer engine and the catalog

use thiserror::Error;

/// Malformed or ambiguous bucket configuration. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unrecognized storage provider for bucket configuration")]
    UnrecognizedProvider,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("invalid engine configuration: {0}")]
    InvalidSetting(String),

    #[error("unknown bucket: {0}")]
    UnknownBucket(i64),

    #[error("bucket {0} is referenced by active transfers")]
    BucketInUse(i64),
}

/// Failure of a single storage operation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("signing failed: {0}")]
    Signing(String),

    /// Retryable failure. `code` is set when the provider answered with a
    /// throttling or 5xx error rather than the connection failing.
    #[error("network error: {message}")]
    Transient { message: String, code: Option<String> },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{message}")]
    Provider {
        code: String,
        message: String,
        status: Option<u16>,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn provider(code: impl Into<String>, message: impl Into<String>, status: Option<u16>) -> Self {
        StorageError::Provider {
            code: code.into(),
            message: message.into(),
            status,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        StorageError::Transient {
            message: message.into(),
            code: None,
        }
    }

    /// Retryable error reported by the provider itself, e.g. `SlowDown`.
    pub fn transient_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Transient {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// Only transient network failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient { .. })
    }

    /// Code surfaced in a terminal `Error` status.
    pub fn code(&self) -> String {
        match self {
            StorageError::Config(_) => "CONFIG_ERROR".to_string(),
            StorageError::Signing(_) => "SIGNING_ERROR".to_string(),
            StorageError::Transient { code: Some(code), .. } => code.clone(),
            StorageError::Transient { code: None, .. } => "NETWORK_ERROR".to_string(),
            StorageError::Validation(_) => "VALIDATION_ERROR".to_string(),
            StorageError::Provider { code, .. } => code.clone(),
            StorageError::Cancelled => "CANCELLED".to_string(),
            StorageError::Io(_) => "IO_ERROR".to_string(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
