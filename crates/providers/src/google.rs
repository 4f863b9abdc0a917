//! Google Generative AI (Gemini API) adapter.
//!
//! REST streaming via `models/{id}:streamGenerateContent?alt=sse` with
//! `x-goog-api-key` auth. Chunk processing is shared with the Vertex and
//! Gemini CLI adapters.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use unillm_core::event::{
    assistant_message_channel, AssistantMessageEvent, AssistantMessageSink, AssistantMessageStream,
};
use unillm_core::message::{AssistantMessage, Context};
use unillm_core::model::Model;
use unillm_core::provider::{PayloadHook, SimpleStreamOptions, StreamOptions};
use unillm_core::{env::get_env_api_key, Error};

use crate::adapter::{check_cancel, finish_stream, http_client, new_output, AdapterError};
use crate::google_shared::{
    build_generation_config, convert_messages, convert_tools, GoogleStreamProcessor, GoogleThinking,
};
use crate::options::{build_base_options, clamp_reasoning, google_thinking_budget, google_thinking_level, is_gemini_3};
use crate::sse::SseReader;

/// Extended options for the Google GenAI adapter.
#[derive(Clone, Default)]
pub struct GoogleOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub session_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub on_payload: Option<PayloadHook>,
    pub tool_choice: Option<String>,
    pub thinking: GoogleThinking,
}

impl From<StreamOptions> for GoogleOptions {
    fn from(options: StreamOptions) -> Self {
        Self {
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            api_key: options.api_key,
            headers: options.headers,
            session_id: options.session_id,
            cancel: options.cancel,
            on_payload: options.on_payload,
            ..Self::default()
        }
    }
}

fn map_tool_choice(choice: &str) -> &'static str {
    match choice {
        "none" => "NONE",
        "any" => "ANY",
        _ => "AUTO",
    }
}

pub(crate) fn build_request_body(model: &Model, context: &Context, options: &GoogleOptions) -> Value {
    let mut body = json!({
        "contents": convert_messages(model, context),
    });

    if let Some(system) = &context.system_prompt {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }

    let config = build_generation_config(model, options.temperature, options.max_tokens, &options.thinking);
    if config.as_object().is_some_and(|o| !o.is_empty()) {
        body["generationConfig"] = config;
    }

    if !context.tools.is_empty() {
        body["tools"] = convert_tools(&context.tools);
        if let Some(choice) = &options.tool_choice {
            body["toolConfig"] = json!({
                "functionCallingConfig": {"mode": map_tool_choice(choice)},
            });
        }
    }

    body
}

/// Stream a response from the Gemini API.
pub fn stream_google(model: Model, context: Context, options: GoogleOptions) -> AssistantMessageStream {
    let (sink, stream) = assistant_message_channel();
    let cancel = options.cancel.clone().unwrap_or_default();

    let task = tokio::spawn(async move {
        let mut output = new_output(&model);
        let result = run(&model, &context, &options, &mut output, &sink, &cancel).await;
        finish_stream(&sink, output, result, &cancel);
    });

    stream.with_task(task)
}

async fn run(
    model: &Model,
    context: &Context,
    options: &GoogleOptions,
    output: &mut AssistantMessage,
    sink: &AssistantMessageSink,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    let api_key = options
        .api_key
        .clone()
        .or_else(|| get_env_api_key(&model.provider))
        .ok_or_else(|| AdapterError::msg(format!("No API key for provider: {}", model.provider)))?;

    let body = build_request_body(model, context, options);
    if let Some(on_payload) = &options.on_payload {
        on_payload(&body);
    }

    let url = format!(
        "{}/models/{}:streamGenerateContent?alt=sse",
        model.base_url.trim_end_matches('/'),
        model.id
    );
    debug!(provider = %model.provider, model = %model.id, "Sending streaming request");

    let mut request = http_client()
        .post(&url)
        .header("x-goog-api-key", &api_key)
        .header("Content-Type", "application/json");
    for (name, value) in model.headers.iter().flatten() {
        request = request.header(name.as_str(), value.as_str());
    }
    for (name, value) in options.headers.iter().flatten() {
        request = request.header(name.as_str(), value.as_str());
    }

    check_cancel(cancel)?;
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AdapterError::Aborted),
        response = request.json(&body).send() => response?,
    };

    let status = response.status();
    if !status.is_success() {
        let error_body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&error_body)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or(error_body);
        return Err(AdapterError::msg(format!("Gemini API error ({status}): {message}")));
    }

    sink.push(AssistantMessageEvent::Start { partial: output.clone() });

    let mut processor = GoogleStreamProcessor::new();
    let mut reader = SseReader::new(response, cancel.clone());
    while let Some(event) = reader.next().await? {
        let chunk: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => continue,
        };
        processor.process_chunk(&chunk, model, output, sink);
    }
    processor.finish_open_block(output, sink);

    if output.stop_reason.is_terminal_failure() {
        return Err(AdapterError::msg("An unknown error occurred"));
    }
    Ok(())
}

/// Stream using the simple API, mapping the reasoning level to a token
/// budget (2.x) or thinking level (3.x).
pub fn stream_simple_google(
    model: Model,
    context: Context,
    options: SimpleStreamOptions,
) -> Result<AssistantMessageStream, Error> {
    let api_key = options
        .api_key
        .clone()
        .or_else(|| get_env_api_key(&model.provider))
        .ok_or_else(|| Error::MissingApiKey(model.provider.clone()))?;

    let base = build_base_options(&model, &options);
    let thinking = resolve_thinking(&model, &options);

    let google = GoogleOptions {
        api_key: Some(api_key),
        thinking,
        ..GoogleOptions::from(base)
    };
    Ok(stream_google(model, context, google))
}

/// Map the reasoning dial onto Gemini's two request shapes.
pub(crate) fn resolve_thinking(model: &Model, options: &SimpleStreamOptions) -> GoogleThinking {
    let Some(level) = options.effective_reasoning() else {
        return GoogleThinking::default();
    };
    let level = clamp_reasoning(model, level);
    if level.is_off() {
        return GoogleThinking::default();
    }

    if is_gemini_3(model) {
        GoogleThinking {
            enabled: true,
            budget_tokens: None,
            level: Some(google_thinking_level(model, level).to_string()),
        }
    } else {
        GoogleThinking {
            enabled: true,
            budget_tokens: Some(google_thinking_budget(
                model,
                level,
                options.thinking_budgets.as_ref(),
            )),
            level: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unillm_core::message::{Message, StopReason};
    use unillm_core::model::{InputModality, ModelCost, ThinkingLevel};
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model(id: &str, base_url: &str) -> Model {
        Model {
            id: id.into(),
            name: id.into(),
            api: "google-generative-ai".into(),
            provider: "google".into(),
            base_url: base_url.into(),
            reasoning: true,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost::new(1.25, 10.0, 0.31, 0.0),
            context_window: 1_048_576,
            max_tokens: 65_536,
            headers: None,
            compat: None,
        }
    }

    #[tokio::test]
    async fn streams_text_from_sse_chunks() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":6,\"candidatesTokenCount\":2,\"totalTokenCount\":8}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path_regex(r"/models/gemini-2\.5-flash:streamGenerateContent$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let message = stream_google(
            model("gemini-2.5-flash", &server.uri()),
            Context {
                messages: vec![Message::user("hi")],
                ..Context::default()
            },
            GoogleOptions {
                api_key: Some("AIza-test".into()),
                ..GoogleOptions::default()
            },
        )
        .result()
        .await
        .unwrap();

        assert_eq!(message.text(), "Hello");
        assert_eq!(message.stop_reason, StopReason::Stop);
        assert_eq!(message.usage.input, 6);
        assert_eq!(message.usage.output, 2);
    }

    #[test]
    fn reasoning_maps_to_budget_and_level() {
        // 2.x model: token budget.
        let m = model("gemini-2.0-flash", "http://unused");
        let thinking = resolve_thinking(
            &m,
            &SimpleStreamOptions {
                reasoning: Some(ThinkingLevel::High),
                ..SimpleStreamOptions::default()
            },
        );
        assert_eq!(thinking.budget_tokens, Some(16_384));
        assert_eq!(thinking.level, None);

        // 3.x model: named level.
        let m3 = model("gemini-3-flash-preview", "http://unused");
        let thinking = resolve_thinking(
            &m3,
            &SimpleStreamOptions {
                reasoning: Some(ThinkingLevel::Medium),
                ..SimpleStreamOptions::default()
            },
        );
        assert_eq!(thinking.budget_tokens, None);
        assert_eq!(thinking.level.as_deref(), Some("medium"));

        // Off means no thinking config at all.
        let thinking = resolve_thinking(&m, &SimpleStreamOptions::default());
        assert!(!thinking.enabled);
    }

    #[tokio::test]
    async fn provider_error_message_is_extracted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(":streamGenerateContent$"))
            .respond_with(ResponseTemplate::new(429).set_body_string(
                r#"{"error":{"code":429,"message":"Resource has been exhausted"}}"#,
            ))
            .mount(&server)
            .await;

        let err = stream_google(
            model("gemini-2.5-flash", &server.uri()),
            Context {
                messages: vec![Message::user("hi")],
                ..Context::default()
            },
            GoogleOptions {
                api_key: Some("AIza-test".into()),
                ..GoogleOptions::default()
            },
        )
        .result()
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Resource has been exhausted"));
    }

    #[test]
    fn request_body_shape() {
        let m = model("gemini-2.5-pro", "http://unused");
        let context = Context {
            system_prompt: Some("You are terse".into()),
            messages: vec![Message::user("hi")],
            tools: vec![unillm_core::message::Tool {
                name: "search".into(),
                description: "Search".into(),
                parameters: json!({"type": "object"}),
            }],
        };
        let options = GoogleOptions {
            temperature: Some(0.3),
            max_tokens: Some(1024),
            tool_choice: Some("any".into()),
            thinking: GoogleThinking {
                enabled: true,
                budget_tokens: Some(2048),
                level: None,
            },
            ..GoogleOptions::default()
        };
        let body = build_request_body(&m, &context, &options);

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "You are terse");
        assert_eq!(body["generationConfig"]["thinkingConfig"]["thinkingBudget"], 2048);
        assert_eq!(body["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
        assert!(body["tools"][0]["functionDeclarations"].is_array());
    }
}
