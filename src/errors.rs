// Error taxonomy shared by the transport, session registry and pipeline.
//
// Every variant maps to a stable `kind()` string that goes on the wire so
// clients can branch on it without parsing messages.

use std::time::Duration;
use thiserror::Error;

/// Failures of a single inference invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    /// The worker did not answer before the caller's deadline.
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    /// The worker crashed, could not be spawned, or reported an error.
    #[error("inference worker failed: {0}")]
    ProcessFailure(String),

    /// The worker answered with nothing but whitespace.
    #[error("inference returned empty output")]
    EmptyOutput,
}

impl InferenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Timeout(_) => "Timeout",
            InferenceError::ProcessFailure(_) => "ProcessFailure",
            InferenceError::EmptyOutput => "EmptyOutput",
        }
    }

    /// Soft failures drive escalation without being recorded as backend faults.
    pub fn is_soft(&self) -> bool {
        matches!(self, InferenceError::EmptyOutput)
    }
}

/// Failures of the memory/knowledge backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("knowledge store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("knowledge search unavailable: {0}")]
    SearchUnavailable(String),
}

impl MemoryError {
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryError::StoreUnavailable(_) => "StoreUnavailable",
            MemoryError::SearchUnavailable(_) => "SearchUnavailable",
        }
    }
}

/// Errors surfaced to clients as `error` events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DaemonError {
    /// Malformed frame, oversized line, unknown action, duplicate action id.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Well-formed request whose content is not acceptable (empty input,
    /// blocked command, unparseable parameters).
    #[error("validation error: {0}")]
    Validation(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Every tier was tried (or the request budget ran out) without a usable answer.
    #[error("all tiers exhausted: {0}")]
    Exhausted(String),

    /// Connection or session ceiling reached.
    #[error("server busy: {0}")]
    Backpressure(String),

    /// A command or request deadline passed (outside inference).
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    /// Stable kind string placed in the `kind` field of error events.
    pub fn kind(&self) -> &'static str {
        match self {
            DaemonError::Protocol(_) => "ProtocolError",
            DaemonError::Validation(_) => "ValidationError",
            DaemonError::SessionNotFound(_) => "SessionNotFound",
            DaemonError::Inference(e) => e.kind(),
            DaemonError::Memory(e) => e.kind(),
            DaemonError::Exhausted(_) => "Exhausted",
            DaemonError::Backpressure(_) => "Backpressure",
            DaemonError::Timeout(_) => "Timeout",
            DaemonError::Cancelled => "Cancelled",
            DaemonError::Internal(_) => "Internal",
        }
    }
}

/// Configuration problems detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
