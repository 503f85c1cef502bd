//! Engine error taxonomy.

use thiserror::Error;

use crate::providers::ProviderError;

/// Errors surfaced to callers of the session engine.
///
/// Configuration and transport failures are caller-visible and are never
/// recorded in a session's conversation. Tool execution failures have no
/// variant here: they are downgraded to conversational tool-result content
/// so the model can react to them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No configured provider matches the requested identifier.
    #[error("Provider \"{0}\" not found")]
    ProviderNotFound(String),

    /// The provider is configured but does not list the requested model.
    #[error("Model \"{model}\" not found for provider \"{provider}\"")]
    ModelNotFound { provider: String, model: String },

    /// A generation is already running for this session.
    #[error("Generation already in progress for project \"{0}\"")]
    GenerationInProgress(String),

    /// Transport-level failure from the provider (network, auth, stream).
    #[error(transparent)]
    Transport(#[from] ProviderError),

    /// The agent loop exceeded its round-trip cap.
    #[error("Generation exceeded the maximum of {0} iterations")]
    MaxIterationsExceeded(usize),

    /// The generation was cancelled before completing.
    #[error("Generation cancelled")]
    Cancelled,

    /// Cancellation was requested while nothing was running.
    #[error("No generation in progress for project \"{0}\"")]
    NoActiveGeneration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_not_found_message_format() {
        let err = EngineError::ProviderNotFound("nope".to_string());
        assert_eq!(err.to_string(), "Provider \"nope\" not found");
    }

    #[test]
    fn transport_errors_pass_their_message_through() {
        let provider_err = ProviderError::timeout("Request timed out: connect");
        let err = EngineError::from(provider_err);
        assert_eq!(err.to_string(), "Request timed out: connect");
    }
}
