use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Wrong input type or shape; the user can retry.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Selection id that is not registered (stale or forged).
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("backend failed: {0}")]
    BackendFailure(String),

    #[error("operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("input too large: {size} bytes (max {limit})")]
    ResourceExhausted { size: u64, limit: u64 },

    /// A temporary artifact could not be deleted. Logged, never shown to users.
    #[error("resource release failed: {0}")]
    LeakGuard(String),

    #[error("io error: {0}")]
    Io(String),
}

impl PipelineError {
    /// Short label for structured logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::BackendFailure(_) => "backend_failure",
            Self::Timeout(_) => "timeout",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::LeakGuard(_) => "leak_guard",
            Self::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
