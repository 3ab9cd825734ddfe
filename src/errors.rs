//! Typed error hierarchy for the testloom pipeline.
//!
//! Two enums cover the generation path:
//! - `BackendError` — failures raised by the generative backend itself
//! - `GenerateError` — failures of one step generation (retry exhaustion,
//!   unusable response content, or a permanent backend failure)
//!
//! Filesystem and state-document failures stay on `anyhow` with context.

use thiserror::Error;

/// HTTP-like status codes that are worth retrying.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Errors raised by a generative backend call.
#[derive(Debug, Error)]
pub enum BackendError {
    /// HTTP-like failure with a status code. Retried when the status is
    /// one of the recognized transient codes.
    #[error("backend returned HTTP {status}: {message}")]
    Http {
        status: u16,
        /// Server-suggested wait before retrying, in seconds.
        retry_after: Option<f64>,
        message: String,
    },

    /// Non-transient failure. Propagates immediately, never retried.
    #[error("backend request failed: {0}")]
    Fatal(String),
}

impl BackendError {
    /// Whether this failure should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http { status, .. } => RETRYABLE_STATUSES.contains(status),
            BackendError::Fatal(_) => false,
        }
    }

    /// Server-suggested retry delay in seconds, if one was provided.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            BackendError::Http { retry_after, .. } => *retry_after,
            BackendError::Fatal(_) => None,
        }
    }
}

/// Errors from generating one step's draft artifact.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// A permanent backend error, propagated without retry.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The retry budget ran out on transient failures.
    #[error("generation failed after {attempts} attempts: {last}")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        last: BackendError,
    },

    /// The backend returned content that is not JSON and contains no
    /// salvageable balanced JSON substring.
    #[error("backend returned non-JSON content. Head:\n{preview}")]
    ContentFormat { preview: String },

    /// A prompt template could not be loaded.
    #[error("failed to load prompt template {name}: {source}")]
    PromptLoad {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl GenerateError {
    /// Build a content-format error with a bounded preview of the text.
    pub fn content_format(text: &str) -> Self {
        let preview: String = text.trim().chars().take(500).collect();
        GenerateError::ContentFormat { preview }
    }
}
