//! Error types
//!
//! One error enum for the whole binding layer. Payloads are strings so the
//! error stays `Clone`: a failed module load is shared by every caller that
//! was waiting on the same in-flight load.

use thiserror::Error;

use crate::config::ConfigError;
use crate::stage::StageKind;

/// Binding layer errors
#[derive(Debug, Clone, Error)]
pub enum OcrError {
    #[error("Guest memory allocation failed: requested {size} bytes")]
    Allocation { size: u64 },

    #[error("Model bundle required: this guest build does not embed weights")]
    MissingModel,

    #[error("Invalid model bundle: {0}")]
    InvalidModel(String),

    #[error("Malformed {stage} notification for session {token}: {reason}")]
    MalformedNotification {
        token: String,
        stage: StageKind,
        reason: String,
    },

    #[error("Failed to load guest module: {0}")]
    ModuleLoad(String),

    #[error("Engine not initialized: call init before submit")]
    NotInitialized,

    #[error("Guest buffers must hold at least one byte")]
    EmptyBuffer,

    #[error("Memory access out of bounds: offset={offset}, size={size}")]
    MemoryOutOfBounds { offset: u32, size: u64 },

    #[error("Export not found: {0}")]
    ExportNotFound(String),

    #[error("Guest execution error: {0}")]
    Execution(String),

    #[error("Timeout: {stage} stage did not arrive within {timeout_ms}ms")]
    StageTimeout { stage: StageKind, timeout_ms: u64 },

    #[error("Session {0} closed before the awaited stage arrived")]
    SessionClosed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OcrError {
    /// Errors that invalidate the whole engine rather than one submission.
    pub fn is_global(&self) -> bool {
        matches!(self, OcrError::ModuleLoad(_) | OcrError::Config(_))
    }
}

impl From<std::io::Error> for OcrError {
    fn from(err: std::io::Error) -> Self {
        OcrError::Io(err.to_string())
    }
}

impl From<ConfigError> for OcrError {
    fn from(err: ConfigError) -> Self {
        OcrError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for OcrError {
    fn from(err: tokio::task::JoinError) -> Self {
        OcrError::Internal(format!("guest call task failed: {}", err))
    }
}

/// Binding layer result type
pub type OcrResult<T> = Result<T, OcrError>;
