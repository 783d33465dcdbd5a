//! Error kinds for indexing, assembly, and streaming.
//!
//! Library code returns [`Result`] so callers can tell a validation problem
//! from an oversize message or a cancelled stream. The CLI layer wraps these
//! in `anyhow` with command-level context.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: bad ratios, unknown source type, bad paths.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The current user message alone does not fit in the history budget.
    #[error("current message needs {tokens} tokens but the history budget is {budget}")]
    Oversize { tokens: usize, budget: usize },

    /// Some documents in a batch failed; every document was still attempted.
    #[error("{failed} of {total} documents failed to index (first: {first_path}: {first_cause})")]
    BatchPartial {
        failed: usize,
        total: usize,
        first_path: String,
        first_cause: String,
    },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of a streaming backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream cancelled")]
    Cancelled,

    #[error("stream deadline exceeded after {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u64 },

    /// Network or backend hiccup worth another attempt.
    #[error("transient backend error: {message}")]
    Transient { message: String },

    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },
}

impl StreamError {
    /// Cancellation and deadline errors end a session for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamError::Cancelled | StreamError::DeadlineExceeded { .. }
        )
    }
}
