//! Error taxonomy shared by every Credence component.
//!
//! Callers branch on the variant rather than on message text: ingestion
//! drivers retry [`Error::Transient`] with backoff, CLI front-ends report
//! [`Error::NotFound`] to the user, and [`Error::Configuration`] aborts
//! startup.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Tokenizer, model or dimension mismatch detected at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Timeout, rate limit or 5xx from the feed or embedding gateway.
    #[error("Transient collaborator error: {0}")]
    Transient(String),
    /// Non-retryable failure reported by an external collaborator.
    #[error("Collaborator error: {0}")]
    Collaborator(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// A stored or supplied value broke a data-model invariant.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether the caller may retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
