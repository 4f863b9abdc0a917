//! Shared plumbing for provider adapters: the fault barrier, cancel
//! checks, and the in-progress message shell.

use tokio_util::sync::CancellationToken;

use unillm_core::event::{AssistantMessageEvent, AssistantMessageSink};
use unillm_core::message::{AssistantMessage, StopReason};
use unillm_core::model::Model;

use crate::sse::SseError;

/// Failure inside an adapter body. Everything thrown is converted into an
/// `Error` event by `finish_stream`; nothing escapes the stream untyped.
#[derive(Debug)]
pub(crate) enum AdapterError {
    /// The cancel signal fired.
    Aborted,
    /// Anything else, with the provider's or transport's message.
    Message(String),
}

impl AdapterError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted => write!(f, "aborted"),
            Self::Message(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<SseError> for AdapterError {
    fn from(err: SseError) -> Self {
        match err {
            SseError::Aborted => Self::Aborted,
            SseError::Transport(msg) => Self::Message(format!("Stream interrupted: {msg}")),
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        Self::Message(format!("Network error: {err}"))
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Message(format!("Failed to parse provider payload: {err}"))
    }
}

/// Empty assistant-message shell tagged with the model's coordinates.
pub(crate) fn new_output(model: &Model) -> AssistantMessage {
    AssistantMessage {
        api: model.api.clone(),
        provider: model.provider.clone(),
        model: model.id.clone(),
        ..AssistantMessage::default()
    }
}

/// Fail fast when the cancel signal has fired.
pub(crate) fn check_cancel(cancel: &CancellationToken) -> Result<(), AdapterError> {
    if cancel.is_cancelled() {
        Err(AdapterError::Aborted)
    } else {
        Ok(())
    }
}

/// The adapter fault barrier: convert the body's outcome into the
/// terminal event and close the stream.
///
/// On success the output's `stop_reason` (as mapped from the provider's
/// stop indicator) rides the `Done` event. On failure the message is
/// finalized with `aborted`/`error` and an `Error` event carries it,
/// partial content and all.
pub(crate) fn finish_stream(
    sink: &AssistantMessageSink,
    mut output: AssistantMessage,
    result: Result<(), AdapterError>,
    cancel: &CancellationToken,
) {
    match result {
        Ok(()) => {
            sink.push(AssistantMessageEvent::Done {
                reason: output.stop_reason,
                message: output,
            });
        }
        Err(err) => {
            let aborted = matches!(err, AdapterError::Aborted) || cancel.is_cancelled();
            output.stop_reason = if aborted { StopReason::Aborted } else { StopReason::Error };
            output.error_message = Some(err.to_string());
            if !aborted {
                tracing::warn!(provider = %output.provider, model = %output.model, error = %err, "Stream failed");
            }
            sink.push(AssistantMessageEvent::Error {
                reason: output.stop_reason,
                error: output,
            });
        }
    }
    sink.end();
}

/// Default HTTP client for streaming adapters: bounded connect, unbounded
/// body (streams may outlive any fixed deadline).
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use unillm_core::event::assistant_message_channel;

    fn model() -> Model {
        Model {
            id: "m".into(),
            name: "m".into(),
            api: "a".into(),
            provider: "p".into(),
            base_url: String::new(),
            reasoning: false,
            input: vec![],
            cost: Default::default(),
            context_window: 0,
            max_tokens: 0,
            headers: None,
            compat: None,
        }
    }

    #[tokio::test]
    async fn fault_barrier_converts_errors_to_error_events() {
        let (sink, stream) = assistant_message_channel();
        let cancel = CancellationToken::new();
        finish_stream(
            &sink,
            new_output(&model()),
            Err(AdapterError::msg("connection reset")),
            &cancel,
        );

        let err = stream.result().await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn cancelled_token_maps_to_aborted() {
        let (sink, mut stream) = assistant_message_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        finish_stream(
            &sink,
            new_output(&model()),
            Err(AdapterError::msg("request interrupted")),
            &cancel,
        );

        match stream.next().await.unwrap() {
            AssistantMessageEvent::Error { reason, error } => {
                assert_eq!(reason, StopReason::Aborted);
                assert_eq!(error.stop_reason, StopReason::Aborted);
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }
}
