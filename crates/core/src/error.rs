//! Error types for the unillm core.
//!
//! Uses `thiserror` for ergonomic error definitions. Stream-level failures
//! (provider errors, aborts) travel inside `ErrorEvent` as an
//! `AssistantMessage`; the variants here cover everything surfaced
//! synchronously or through `result()`.

use thiserror::Error;

use crate::message::AssistantMessage;

/// The top-level error type for all unillm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No API provider is registered for the requested `Model.api`.
    #[error("No API provider registered for api: {0}")]
    UnknownApi(String),

    /// No API key could be resolved for a provider.
    #[error("No API key for provider: {0}")]
    MissingApiKey(String),

    /// The caller passed something the core cannot work with.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A stream terminated with an error event. The boxed message carries
    /// the partial content, usage, and provider-reported error text.
    #[error("Stream failed: {}", .0.error_message.as_deref().unwrap_or("unknown error"))]
    Stream(Box<AssistantMessage>),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything that should not happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
