//! API provider registry and stream dispatch.
//!
//! An `ApiProvider` binds an `api` identifier (e.g. "anthropic-messages")
//! to the functions that open a normalized event stream against that
//! protocol. Providers are registered at process start; `stream` and
//! friends look them up by `Model.api`.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::event::AssistantMessageStream;
use crate::message::{AssistantMessage, Context};
use crate::model::{Model, ThinkingLevel};

/// Observer invoked with the provider-bound request payload just before it
/// is sent. Used by tests to assert per-provider parameter mapping.
pub type PayloadHook = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Options for a full-fidelity stream call.
#[derive(Clone, Default)]
pub struct StreamOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    /// Opaque session id, forwarded where providers support prompt caching
    /// keyed by session.
    pub session_id: Option<String>,
    /// Cooperative cancel signal; checked at every suspension point.
    pub cancel: Option<CancellationToken>,
    pub on_payload: Option<PayloadHook>,
}

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Custom token budgets per thinking level, for budget-based providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThinkingBudgets {
    pub minimal: Option<u32>,
    pub low: Option<u32>,
    pub medium: Option<u32>,
    pub high: Option<u32>,
}

impl ThinkingBudgets {
    pub fn get(&self, level: ThinkingLevel) -> Option<u32> {
        match level {
            ThinkingLevel::Minimal => self.minimal,
            ThinkingLevel::Low => self.low,
            ThinkingLevel::Medium => self.medium,
            ThinkingLevel::High | ThinkingLevel::Xhigh => self.high,
            ThinkingLevel::Off => None,
        }
    }
}

/// Options for the simple API: reasoning level plus the basics.
#[derive(Clone, Default)]
pub struct SimpleStreamOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub session_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub on_payload: Option<PayloadHook>,
    /// Provider-agnostic reasoning dial; `None` and `Some(Off)` both
    /// disable thinking.
    pub reasoning: Option<ThinkingLevel>,
    pub thinking_budgets: Option<ThinkingBudgets>,
}

impl SimpleStreamOptions {
    /// The reasoning level with `Off` folded into `None`.
    pub fn effective_reasoning(&self) -> Option<ThinkingLevel> {
        self.reasoning.filter(|level| !level.is_off())
    }
}

impl std::fmt::Debug for SimpleStreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleStreamOptions")
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("reasoning", &self.reasoning)
            .finish_non_exhaustive()
    }
}

/// Function opening a full-options stream. Invalid input (missing API
/// key, bad configuration) fails synchronously here; everything after
/// construction travels as stream events.
pub type StreamFn =
    Arc<dyn Fn(Model, Context, StreamOptions) -> Result<AssistantMessageStream> + Send + Sync>;

/// Function opening a stream from simple options.
pub type SimpleStreamFn =
    Arc<dyn Fn(Model, Context, SimpleStreamOptions) -> Result<AssistantMessageStream> + Send + Sync>;

/// An API provider implementation: one per backend protocol.
#[derive(Clone)]
pub struct ApiProvider {
    pub api: String,
    pub stream: StreamFn,
    pub stream_simple: SimpleStreamFn,
}

struct RegisteredProvider {
    provider: ApiProvider,
    source_id: Option<String>,
}

static PROVIDER_REGISTRY: LazyLock<RwLock<HashMap<String, RegisteredProvider>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register an API provider. Replaces any prior registration for the same
/// `api`. A `source_id` lets tests remove their ad-hoc providers later.
pub fn register_api_provider(provider: ApiProvider, source_id: Option<&str>) {
    let mut registry = PROVIDER_REGISTRY.write().unwrap();
    registry.insert(
        provider.api.clone(),
        RegisteredProvider {
            provider,
            source_id: source_id.map(str::to_string),
        },
    );
}

/// Look up a registered API provider by api name.
pub fn get_api_provider(api: &str) -> Option<ApiProvider> {
    let registry = PROVIDER_REGISTRY.read().unwrap();
    registry.get(api).map(|entry| entry.provider.clone())
}

/// Remove every provider registered under the given source id.
pub fn unregister_api_providers(source_id: &str) {
    let mut registry = PROVIDER_REGISTRY.write().unwrap();
    registry.retain(|_, entry| entry.source_id.as_deref() != Some(source_id));
}

fn resolve(api: &str) -> Result<ApiProvider> {
    get_api_provider(api).ok_or_else(|| Error::UnknownApi(api.to_string()))
}

/// Stream an LLM response using the provider registered for `model.api`.
pub fn stream(model: &Model, context: &Context, options: StreamOptions) -> Result<AssistantMessageStream> {
    let provider = resolve(&model.api)?;
    (provider.stream)(model.clone(), context.clone(), options)
}

/// Stream using the simple API with reasoning-level support.
pub fn stream_simple(
    model: &Model,
    context: &Context,
    options: SimpleStreamOptions,
) -> Result<AssistantMessageStream> {
    let provider = resolve(&model.api)?;
    (provider.stream_simple)(model.clone(), context.clone(), options)
}

/// Complete an LLM call and return the final message.
pub async fn complete(
    model: &Model,
    context: &Context,
    options: StreamOptions,
) -> Result<AssistantMessage> {
    stream(model, context, options)?.result().await
}

/// Complete using the simple API and return the final message.
pub async fn complete_simple(
    model: &Model,
    context: &Context,
    options: SimpleStreamOptions,
) -> Result<AssistantMessage> {
    stream_simple(model, context, options)?.result().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{assistant_message_channel, AssistantMessageEvent};
    use crate::message::{AssistantContent, Message, StopReason, TextContent, Usage};
    use crate::model::{InputModality, ModelCost};

    fn echo_model(api: &str) -> Model {
        Model {
            id: "echo-1".into(),
            name: "Echo".into(),
            api: api.into(),
            provider: "echo".into(),
            base_url: "http://localhost".into(),
            reasoning: false,
            input: vec![InputModality::Text],
            cost: ModelCost::default(),
            context_window: 8192,
            max_tokens: 1024,
            headers: None,
            compat: None,
        }
    }

    /// Register an in-process provider that echoes the last user message.
    fn register_echo(api: &str, source: &str) {
        let stream_fn: StreamFn = Arc::new(|model, context, _options| {
            Ok(echo_stream(model, context))
        });
        let simple_fn: SimpleStreamFn = Arc::new(|model, context, _options| {
            Ok(echo_stream(model, context))
        });
        register_api_provider(
            ApiProvider {
                api: api.into(),
                stream: stream_fn,
                stream_simple: simple_fn,
            },
            Some(source),
        );
    }

    fn echo_stream(model: Model, context: Context) -> AssistantMessageStream {
        let (sink, stream) = assistant_message_channel();
        let task = tokio::spawn(async move {
            let last_user = context
                .messages
                .iter()
                .rev()
                .find_map(|m| match m {
                    Message::User(u) => Some(u.content.to_text()),
                    _ => None,
                })
                .unwrap_or_default();
            let text = format!("Echo: {last_user}");

            let mut output = AssistantMessage {
                api: model.api.clone(),
                provider: model.provider.clone(),
                model: model.id.clone(),
                ..AssistantMessage::default()
            };
            sink.push(AssistantMessageEvent::Start {
                partial: output.clone(),
            });
            output.content.push(AssistantContent::Text(TextContent::new("")));
            sink.push(AssistantMessageEvent::TextStart {
                content_index: 0,
                partial: output.clone(),
            });
            if let AssistantContent::Text(t) = &mut output.content[0] {
                t.text = text.clone();
            }
            sink.push(AssistantMessageEvent::TextDelta {
                content_index: 0,
                delta: text.clone(),
                partial: output.clone(),
            });
            sink.push(AssistantMessageEvent::TextEnd {
                content_index: 0,
                content: text,
                partial: output.clone(),
            });
            output.usage = Usage {
                input: 3,
                output: 5,
                ..Usage::default()
            };
            output.usage.update_total();
            sink.push(AssistantMessageEvent::Done {
                reason: StopReason::Stop,
                message: output,
            });
            sink.end();
        });
        stream.with_task(task)
    }

    #[tokio::test]
    async fn echo_provider_simple_completion() {
        register_echo("test-echo", "provider-tests");
        let model = echo_model("test-echo");
        let context = Context {
            messages: vec![Message::user("hello world")],
            ..Context::default()
        };

        let result = complete_simple(&model, &context, SimpleStreamOptions::default())
            .await
            .unwrap();

        assert_eq!(result.text(), "Echo: hello world");
        assert!(result.usage.output > 0);
        assert_eq!(result.stop_reason, StopReason::Stop);
    }

    #[tokio::test]
    async fn unknown_api_fails_on_stream_construction() {
        let model = echo_model("not-registered");
        let err = stream(&model, &Context::default(), StreamOptions::default()).unwrap_err();
        assert!(matches!(err, Error::UnknownApi(_)));
    }

    #[tokio::test]
    async fn scoped_unregister_removes_providers() {
        register_echo("test-scoped", "scoped-source");
        assert!(get_api_provider("test-scoped").is_some());

        unregister_api_providers("scoped-source");
        assert!(get_api_provider("test-scoped").is_none());
    }

    #[tokio::test]
    async fn reregistration_replaces_provider() {
        register_echo("test-replace-api", "a");
        register_echo("test-replace-api", "b");
        // Unregistering the first source must not remove the second's entry.
        unregister_api_providers("a");
        assert!(get_api_provider("test-replace-api").is_some());
        unregister_api_providers("b");
        assert!(get_api_provider("test-replace-api").is_none());
    }
}
