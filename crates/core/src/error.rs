/// Error taxonomy shared by the evidence store, registries, dispatcher and ledger.
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Flat, serializable error classification recorded in history entries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    InvalidState,
    Argument,
    Capability,
    Integration,
    /// Integration subkind: the call exceeded its deadline
    Timeout,
    /// Integration subkind: the caller withdrew the request
    Cancelled,
    Handler,
    Integrity,
    LedgerWrite,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::Argument => "argument",
            ErrorCode::Capability => "capability",
            ErrorCode::Integration => "integration",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Handler => "handler",
            ErrorCode::Integrity => "integrity",
            ErrorCode::LedgerWrite => "ledger_write",
        }
    }

    /// True for the integration family (`Integration`, `Timeout`, `Cancelled`)
    pub fn is_integration(&self) -> bool {
        matches!(
            self,
            ErrorCode::Integration | ErrorCode::Timeout | ErrorCode::Cancelled
        )
    }

    /// Only a lost audit record is fatal to a session
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCode::LedgerWrite)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MimirError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    Conflict { kind: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid arguments: {0}")]
    Argument(String),

    #[error("Capability not satisfied: {0}")]
    Capability(String),

    #[error("Integration {integration} failed: {message}")]
    Integration { integration: String, message: String },

    #[error("Integration {integration} timed out after {after_ms}ms")]
    Timeout { integration: String, after_ms: u64 },

    #[error("Cancelled during {stage}")]
    Cancelled { stage: String },

    #[error("Handler failed: {message}")]
    Handler {
        message: String,
        cause: Option<ErrorCode>,
    },

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Ledger write failed: {0}")]
    LedgerWrite(String),
}

impl MimirError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            id: id.into(),
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            cause: None,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Conflict { .. } => ErrorCode::Conflict,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::Argument(_) => ErrorCode::Argument,
            Self::Capability(_) => ErrorCode::Capability,
            Self::Integration { .. } => ErrorCode::Integration,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Handler { .. } => ErrorCode::Handler,
            Self::Integrity(_) => ErrorCode::Integrity,
            Self::LedgerWrite(_) => ErrorCode::LedgerWrite,
        }
    }

    /// Wrap a failure raised inside command logic, keeping its original code as the cause.
    /// Cancellation is passed through untouched.
    pub fn into_handler_failure(self) -> Self {
        match self {
            Self::Cancelled { .. } | Self::Handler { .. } => self,
            other => Self::Handler {
                cause: Some(other.code()),
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T, E = MimirError> = std::result::Result<T, E>;

/// Serializable error view carried in results and history entries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<ErrorCode>,
    pub message: String,
}

impl From<&MimirError> for ErrorReport {
    fn from(err: &MimirError) -> Self {
        let cause = match err {
            MimirError::Handler { cause, .. } => *cause,
            _ => None,
        };
        Self {
            code: err.code(),
            cause,
            message: err.to_string(),
        }
    }
}
