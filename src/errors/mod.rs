use crate::agent::meta::events::AnalysisKind;
use thiserror::Error;

/// Typed error hierarchy for metaloop.
///
/// Use at module boundaries (task start/resume, config validation, model requests,
/// snapshot persistence). Internal/leaf functions can continue using `anyhow::Result`;
/// the `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum MetaloopError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Model request error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("{kind} analysis failed: {message}")]
    Analysis { kind: AnalysisKind, message: String },

    #[error("{kind} analysis timed out after {after_secs}s")]
    Timeout { kind: AnalysisKind, after_secs: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MetaloopError {
    /// Whether this error is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::Analysis { .. } | Self::Timeout { .. } | Self::Internal(_) => true,
            Self::Config(_) | Self::InvalidInput(_) | Self::Persistence(_) => false,
        }
    }
}
