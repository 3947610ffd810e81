use thiserror::Error;

use crate::schema::Platform;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Element not found: {target} ({detail})")]
    ActionNotFound { target: String, detail: String },

    #[error("Action timed out after {waited_ms}ms: {action} on {target}")]
    ActionTimedOut {
        action: String,
        target: String,
        waited_ms: u64,
    },

    #[error("Element not visible: {0}")]
    VerificationFailed(String),

    #[error("Oracle unreachable: {0}")]
    OracleUnreachable(String),

    #[error("Oracle response unparsable: {0}")]
    OracleResponseUnparsable(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Transient transport error: {0}")]
    TransientTransport(String),

    #[error("Request rejected (HTTP {status}): {message}")]
    PermanentRequest { status: u16, message: String },

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("{0} executor is not started")]
    NotStarted(Platform),

    #[error("No executor registered for platform {0}")]
    ExecutorUnavailable(Platform),

    #[error("Unsupported action '{action}' for platform {platform}")]
    UnsupportedAction { platform: Platform, action: String },

    #[error("Invalid step parameters: {0}")]
    InvalidParams(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ActionNotFound {
            target: target.into(),
            detail: detail.into(),
        }
    }

    /// Point a missing-element or timeout error at the selector the caller used.
    pub fn retarget(self, selector: &str) -> Self {
        match self {
            Self::ActionNotFound { detail, .. } => Self::ActionNotFound {
                target: selector.to_string(),
                detail,
            },
            Self::ActionTimedOut { action, waited_ms, .. } => Self::ActionTimedOut {
                action,
                target: selector.to_string(),
                waited_ms,
            },
            other => other,
        }
    }

    /// Transport failures worth another attempt at the capability level.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientTransport(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Self::TransientTransport(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() => Self::TransientTransport(err.to_string()),
            Some(status) => Self::PermanentRequest {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::Driver(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}
