//! Error types for the turn pipeline

use thiserror::Error;

use crate::provider::ProviderId;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a single remote provider call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("deadline exceeded after {0}ms")]
    Timeout(u64),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("stream closed unexpectedly")]
    StreamClosed,
}

/// One failed synthesis attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAttempt {
    pub provider: ProviderId,
    pub error: ProviderError,
}

impl std::fmt::Display for ProviderAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.provider, self.error)
    }
}

/// Main error type for the turn pipeline
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Frame delivery to or from the media transport failed. Fatal to the session.
    #[error("transport error: {0}")]
    Transport(String),

    /// Recognition provider failed after its retry
    #[error("transcription failed: {cause}")]
    Transcription { cause: ProviderError },

    /// Language model failed before yielding any output
    #[error("dialogue generation failed: {cause}")]
    Dialogue { cause: ProviderError },

    /// Every synthesis provider failed before any audio was emitted
    #[error("synthesis failed on all providers: [{}]", format_attempts(.attempts))]
    Synthesis { attempts: Vec<ProviderAttempt> },

    /// Caller-contract violation
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState(message.into())
    }

    /// Whether the error ends the whole session rather than one turn
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::InvalidState(_))
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::Transcription { .. } => "transcription",
            Error::Dialogue { .. } => "dialogue",
            Error::Synthesis { .. } => "synthesis",
            Error::InvalidState(_) => "invalid_state",
        }
    }
}

fn format_attempts(attempts: &[ProviderAttempt]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
