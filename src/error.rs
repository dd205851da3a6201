//! Error types for the digest engine.

use thiserror::Error;

/// Top-level error type for the digest engine.
#[derive(Debug, Error)]
pub enum DigestError {
    /// A dataset could not be fetched or parsed. Retried on the next tick.
    #[error("source error: {0}")]
    Source(String),

    /// Persisted state is unreadable, corrupt or could not be flushed.
    /// Never recovered locally: delivery history must not be guessed.
    #[error("state error: {0}")]
    State(String),

    /// A subscription or setting failed validation.
    #[error("config error: {0}")]
    Config(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, DigestError>;

/// Outcome of a failed hand-off to the transport sink.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The transport refused or failed the message; retry later.
    #[error("transport rejected message: {0}")]
    Rejected(String),

    /// The transport did not answer in time; retry later.
    #[error("transport timed out after {0}s")]
    Timeout(u64),

    /// The recipient can never be reached again (blocked, deleted chat).
    #[error("recipient no longer valid: {0}")]
    RecipientGone(String),
}
