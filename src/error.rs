//! Pipeline error taxonomy and its wire representation

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error kinds exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    BadRequest,
    InputTooLong,
    UnknownModel,
    AllModelsFailed,
    ComputeError,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::InputTooLong => "InputTooLong",
            ErrorKind::UnknownModel => "UnknownModel",
            ErrorKind::AllModelsFailed => "AllModelsFailed",
            ErrorKind::ComputeError => "ComputeError",
            ErrorKind::Timeout => "Timeout",
        }
    }

    /// Whether resubmitting the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ComputeError | ErrorKind::Timeout | ErrorKind::AllModelsFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while serving a request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Request failed structural or size validation
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Tokenized input exceeds the model limit
    #[error("input too long for model {model_id}: {tokens} tokens exceeds limit of {max}")]
    InputTooLong {
        model_id: String,
        tokens: usize,
        max: usize,
    },

    /// Model id not present in the registry
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Every targeted model failed
    #[error("all models failed: {0}")]
    AllModelsFailed(String),

    /// Numerical or resource failure while running a model
    #[error("compute error: {0}")]
    Compute(String),

    /// Request did not complete within its deadline
    #[error("request timed out after {0}ms")]
    Timeout(u64),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::BadRequest(_) => ErrorKind::BadRequest,
            PipelineError::InputTooLong { .. } => ErrorKind::InputTooLong,
            PipelineError::UnknownModel(_) => ErrorKind::UnknownModel,
            PipelineError::AllModelsFailed(_) => ErrorKind::AllModelsFailed,
            PipelineError::Compute(_) => ErrorKind::ComputeError,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Convert into the wire shape, attaching the request correlation token
    pub fn into_structured(self, request_id: Option<String>) -> StructuredError {
        StructuredError {
            kind: self.kind(),
            retryable: self.is_retryable(),
            message: self.to_string(),
            request_id,
        }
    }
}

/// Error shape returned to the edge layer
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StructuredError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub retryable: bool,
}

impl StructuredError {
    pub fn bad_request(message: impl Into<String>, request_id: Option<String>) -> Self {
        PipelineError::BadRequest(message.into()).into_structured(request_id)
    }
}
