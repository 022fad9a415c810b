//! Error taxonomy for operations.
//!
//! Every failure an operation can hit is funnelled into [`OperationError`]
//! before it reaches a caller's stream. Transport layers only need
//! [`OperationError::kind`] to pick a status code.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancellation::RegistryError;
use crate::config::ValidationError;
use crate::engine::EngineError;

/// Coarse classification of an operation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Connection,
    Execution,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Connection => "connection",
            ErrorKind::Execution => "execution",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the operation an engine error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Executing,
}

/// Terminal failure of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Connection(String),

    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OperationError {
    pub fn cancelled() -> Self {
        OperationError::Cancelled(EngineError::Cancelled.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OperationError::Validation(_) => ErrorKind::Validation,
            OperationError::Connection(_) => ErrorKind::Connection,
            OperationError::Execution(_) => ErrorKind::Execution,
            OperationError::Cancelled(_) => ErrorKind::Cancelled,
            OperationError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Classify an engine failure.
    ///
    /// Anything that fails while connecting is a connection error, since no
    /// operation is executing yet. Once the operation's token has been
    /// signaled, any execution failure counts as cancellation: the engine
    /// typically reports an interrupted build as an ordinary error.
    pub fn from_engine(err: EngineError, phase: Phase, cancel_signaled: bool) -> Self {
        match (err, phase) {
            (EngineError::Connect(message), Phase::Connecting) => OperationError::Connection(message),
            (other, Phase::Connecting) => OperationError::Connection(other.to_string()),
            (EngineError::Cancelled, Phase::Executing) => OperationError::cancelled(),
            (_, Phase::Executing) if cancel_signaled => OperationError::cancelled(),
            (other, Phase::Executing) => OperationError::Execution(other.to_string()),
        }
    }

    /// Classify a worker that never returned.
    pub fn from_join(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            OperationError::Internal("engine worker panicked".to_string())
        } else {
            OperationError::Internal("engine worker was aborted".to_string())
        }
    }

    /// Serializable view of the failure.
    pub fn structured(&self) -> StructuredError {
        StructuredError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<RegistryError> for OperationError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateRequestId(id) => {
                OperationError::Validation(ValidationError::DuplicateRequestId(id.0))
            }
        }
    }
}

/// `{kind, message}` pair logged when an operation ends in error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    pub kind: ErrorKind,
    pub message: String,
}
