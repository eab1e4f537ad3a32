//! Error taxonomy for report generation.
//!
//! Per-attempt failures ([`AttemptError`]) stay inside the retry loop. Only
//! [`GenerateError`] reaches callers. Cancellation is an outcome, not an error.

use crate::config::ConfigError;

/// Failure of a single capture/assemble/encode attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttemptError {
    #[error("render capture failed: {0}")]
    RenderCapture(String),

    #[error("document assembly failed: {0}")]
    Assembly(String),

    #[error("memory budget exceeded: estimated {estimated_mb} MB > {limit_mb} MB")]
    MemoryBudgetExceeded { estimated_mb: u64, limit_mb: u64 },

    #[error("asset load failed: {0}")]
    AssetLoad(String),

    #[error("unsupported environment: {0}")]
    UnsupportedEnvironment(String),
}

impl AttemptError {
    /// Whether the retry controller may spend another attempt on this failure.
    pub fn is_transient(&self) -> bool {
        !matches!(self, AttemptError::UnsupportedEnvironment(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    #[error("a generation is already in progress on this generator")]
    Busy,

    #[error("generation failed after {attempts} attempt(s): {last}")]
    ExhaustedRetries { attempts: u32, last: AttemptError },

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("failed to persist {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
