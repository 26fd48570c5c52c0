//! Error types for the Kōhai domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Each stage of the
//! pipeline has its own error enum; `EngineError` is what request handlers
//! see. Display strings are user-safe — underlying causes carry enough
//! detail for operator logs but never leak internals a caller should not
//! see.

use thiserror::Error;

/// The top-level error type for all Kōhai operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Engine errors ---
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Pipeline stage errors ---

/// Prompt assembly failures — bad input shape, not model trouble.
/// Surfaced immediately; never retried.
#[derive(Debug, Clone, Error)]
pub enum PromptError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error("system directive must not be empty")]
    EmptyDirective,

    #[error("conversation history is malformed: {0}")]
    MalformedHistory(String),

    #[error("prompt does not fit the token budget ({tokens} tokens, budget {budget})")]
    ContextOverflow { tokens: usize, budget: usize },

    #[error("tokenization failed: {0}")]
    Tokenizer(String),
}

/// Adapter routing failures — configuration/programmer errors.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("unknown adapter: {0}")]
    NotFound(String),

    #[error("adapter weights malformed: {0}")]
    Malformed(String),
}

/// Decode-loop failures.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("generation exceeded its time budget")]
    Timeout,

    #[error("generation was cancelled")]
    Cancelled,

    #[error("model forward pass failed: {0}")]
    Forward(String),

    #[error("token sampling failed: {0}")]
    Sampling(String),

    #[error("detokenization failed: {0}")]
    Detokenize(String),
}

/// Service-level errors returned to request handlers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Model not loaded yet, or the one-time load failed. Retryable from
    /// the caller's perspective (after a restart in the failed case).
    #[error("model is not ready — try again shortly")]
    Unavailable,

    #[error("invalid request: {0}")]
    Prompt(#[from] PromptError),

    #[error("adapter routing failed: {0}")]
    Adapter(#[from] AdapterError),

    /// Anything that went wrong inside decode. The display string is
    /// deliberately generic; the source carries the cause for logs.
    #[error("generation failed")]
    Generation(#[source] DecodeError),

    #[error("model load failed: {0}")]
    Load(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_message_is_retry_shaped() {
        let err = EngineError::Unavailable;
        assert!(err.to_string().contains("try again"));
    }

    #[test]
    fn prompt_error_propagates_into_engine_error() {
        let err: EngineError = PromptError::EmptyMessage.into();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn generation_display_does_not_leak_cause() {
        let err = EngineError::Generation(DecodeError::Forward(
            "shape mismatch in layer 17".into(),
        ));
        assert_eq!(err.to_string(), "generation failed");
        // the cause stays reachable for operator logs
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("shape mismatch"));
    }

    #[test]
    fn adapter_not_found_names_the_adapter() {
        let err = AdapterError::NotFound("finetune_custom".into());
        assert!(err.to_string().contains("finetune_custom"));
    }

    #[test]
    fn engine_error_wraps_into_top_level_error() {
        let err: Error = EngineError::Unavailable.into();
        assert!(matches!(err, Error::Engine(_)));
        assert!(err.to_string().contains("Engine error"));
    }
}
