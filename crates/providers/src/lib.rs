//! unillm-providers — backend adapters for the unillm streaming core.
//!
//! One adapter per wire protocol, all emitting the normalized
//! assistant-message event stream:
//!
//! - `anthropic` — Anthropic Messages (SSE)
//! - `openai_completions` — Chat Completions and compatible hosts (SSE)
//! - `openai_responses` / `azure_responses` / `codex_responses` —
//!   the Responses API family (SSE)
//! - `google` / `google_vertex` / `google_gemini_cli` — Gemini
//!   backends (SSE)
//! - `bedrock` — Amazon Bedrock Converse Stream (AWS SDK)
//!
//! `register_builtins()` wires every adapter into the provider registry
//! and loads the built-in model catalog.

mod adapter;
pub mod anthropic;
pub mod azure_responses;
pub mod bedrock;
pub mod catalog;
pub mod codex_responses;
pub mod google;
pub mod google_gemini_cli;
pub mod google_shared;
pub mod google_vertex;
pub mod openai_completions;
pub mod openai_responses;
mod openai_shared;
pub mod options;
pub mod sse;
pub mod transform;

use std::sync::Arc;

use unillm_core::provider::{register_api_provider, ApiProvider};

pub use catalog::register_builtin_models;

/// Register every built-in API provider and the model catalog.
///
/// Call once at process start. Registration is idempotent: a later call
/// replaces the prior entries.
pub fn register_builtins() {
    register_builtin_models();

    register_api_provider(
        ApiProvider {
            api: "anthropic-messages".into(),
            stream: Arc::new(|model, context, options| {
                Ok(anthropic::stream_anthropic(model, context, options.into()))
            }),
            stream_simple: Arc::new(anthropic::stream_simple_anthropic),
        },
        None,
    );

    register_api_provider(
        ApiProvider {
            api: "openai-completions".into(),
            stream: Arc::new(|model, context, options| {
                Ok(openai_completions::stream_openai_completions(model, context, options.into()))
            }),
            stream_simple: Arc::new(openai_completions::stream_simple_openai_completions),
        },
        None,
    );

    register_api_provider(
        ApiProvider {
            api: "openai-responses".into(),
            stream: Arc::new(|model, context, options| {
                Ok(openai_responses::stream_openai_responses(model, context, options.into()))
            }),
            stream_simple: Arc::new(openai_responses::stream_simple_openai_responses),
        },
        None,
    );

    register_api_provider(
        ApiProvider {
            api: "azure-openai-responses".into(),
            stream: Arc::new(|model, context, options| {
                Ok(azure_responses::stream_azure_responses(model, context, options.into()))
            }),
            stream_simple: Arc::new(azure_responses::stream_simple_azure_responses),
        },
        None,
    );

    register_api_provider(
        ApiProvider {
            api: "openai-codex-responses".into(),
            stream: Arc::new(|model, context, options| {
                Ok(codex_responses::stream_codex_responses(model, context, options.into()))
            }),
            stream_simple: Arc::new(codex_responses::stream_simple_codex_responses),
        },
        None,
    );

    register_api_provider(
        ApiProvider {
            api: "google-generative-ai".into(),
            stream: Arc::new(|model, context, options| {
                Ok(google::stream_google(model, context, options.into()))
            }),
            stream_simple: Arc::new(google::stream_simple_google),
        },
        None,
    );

    register_api_provider(
        ApiProvider {
            api: "google-vertex".into(),
            stream: Arc::new(|model, context, options| {
                let vertex = google_vertex::GoogleVertexOptions {
                    temperature: options.temperature,
                    max_tokens: options.max_tokens,
                    access_token: options.api_key,
                    headers: options.headers,
                    session_id: options.session_id,
                    cancel: options.cancel,
                    on_payload: options.on_payload,
                    ..google_vertex::GoogleVertexOptions::default()
                };
                Ok(google_vertex::stream_google_vertex(model, context, vertex))
            }),
            stream_simple: Arc::new(google_vertex::stream_simple_google_vertex),
        },
        None,
    );

    register_api_provider(
        ApiProvider {
            api: "google-gemini-cli".into(),
            stream: Arc::new(|model, context, options| {
                let cli = google_gemini_cli::GoogleGeminiCliOptions {
                    temperature: options.temperature,
                    max_tokens: options.max_tokens,
                    api_key: options.api_key,
                    headers: options.headers,
                    session_id: options.session_id,
                    cancel: options.cancel,
                    on_payload: options.on_payload,
                    ..google_gemini_cli::GoogleGeminiCliOptions::default()
                };
                Ok(google_gemini_cli::stream_google_gemini_cli(model, context, cli))
            }),
            stream_simple: Arc::new(google_gemini_cli::stream_simple_google_gemini_cli),
        },
        None,
    );

    register_api_provider(
        ApiProvider {
            api: "bedrock-converse-stream".into(),
            stream: Arc::new(|model, context, options| {
                let bedrock_options = bedrock::BedrockOptions {
                    temperature: options.temperature,
                    max_tokens: options.max_tokens,
                    session_id: options.session_id,
                    cancel: options.cancel,
                    on_payload: options.on_payload,
                    ..bedrock::BedrockOptions::default()
                };
                Ok(bedrock::stream_bedrock(model, context, bedrock_options))
            }),
            stream_simple: Arc::new(bedrock::stream_simple_bedrock),
        },
        None,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use unillm_core::provider::get_api_provider;

    #[test]
    fn all_nine_backends_register() {
        register_builtins();
        for api in [
            "anthropic-messages",
            "openai-completions",
            "openai-responses",
            "azure-openai-responses",
            "openai-codex-responses",
            "google-generative-ai",
            "google-vertex",
            "google-gemini-cli",
            "bedrock-converse-stream",
        ] {
            assert!(get_api_provider(api).is_some(), "missing provider for {api}");
        }
    }
}
