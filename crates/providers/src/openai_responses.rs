//! OpenAI Responses API adapter.

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
use crate::openai_shared::{
    convert_responses_messages, convert_responses_tools, copilot_headers,
    process_responses_stream, OPENAI_TOOL_CALL_PROVIDERS,
};
use crate::options::{build_base_options, openai_reasoning_effort};
use crate::sse::SseReader;

/// Extended options for the Responses adapter.
#[derive(Clone, Default)]
pub struct OpenAiResponsesOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub session_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub on_payload: Option<PayloadHook>,
    pub reasoning_effort: Option<String>,
    pub reasoning_summary: Option<String>,
    pub service_tier: Option<String>,
}

impl From<StreamOptions> for OpenAiResponsesOptions {
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

fn build_body(model: &Model, context: &Context, options: &OpenAiResponsesOptions) -> Value {
    let mut input = convert_responses_messages(model, context, OPENAI_TOOL_CALL_PROVIDERS, true);

    let mut body = json!({
        "model": model.id,
        "stream": true,
        "store": false,
    });

    if let Some(session_id) = &options.session_id {
        body["prompt_cache_key"] = json!(session_id);
    }
    if let Some(max_tokens) = options.max_tokens {
        body["max_output_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(service_tier) = &options.service_tier {
        body["service_tier"] = json!(service_tier);
    }
    if !context.tools.is_empty() {
        body["tools"] = json!(convert_responses_tools(&context.tools, false));
    }

    if model.reasoning {
        if options.reasoning_effort.is_some() || options.reasoning_summary.is_some() {
            body["reasoning"] = json!({
                "effort": options.reasoning_effort.as_deref().unwrap_or("medium"),
                "summary": options.reasoning_summary.as_deref().unwrap_or("auto"),
            });
            body["include"] = json!(["reasoning.encrypted_content"]);
        } else if model.name.starts_with("gpt-5") {
            // Suppress default reasoning burn when thinking is off.
            input.push(json!({
                "role": "developer",
                "content": [{"type": "input_text", "text": "# Juice: 0 !important"}],
            }));
        }
    }

    body["input"] = json!(input);
    body
}

/// Stream a response from the OpenAI Responses API.
pub fn stream_openai_responses(
    model: Model,
    context: Context,
    options: OpenAiResponsesOptions,
) -> AssistantMessageStream {
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
    options: &OpenAiResponsesOptions,
    output: &mut AssistantMessage,
    sink: &AssistantMessageSink,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    let api_key = options
        .api_key
        .clone()
        .or_else(|| get_env_api_key(&model.provider))
        .ok_or_else(|| AdapterError::msg("OpenAI API key is required"))?;

    let body = build_body(model, context, options);
    if let Some(on_payload) = &options.on_payload {
        on_payload(&body);
    }

    let url = format!("{}/responses", model.base_url.trim_end_matches('/'));
    debug!(provider = %model.provider, model = %model.id, "Sending streaming request");

    let mut request = http_client()
        .post(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .header("Content-Type", "application/json");
    if model.provider == "github-copilot" {
        for (name, value) in copilot_headers(context) {
            request = request.header(name, value);
        }
    }
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
        return Err(AdapterError::msg(format!(
            "OpenAI API error ({status}): {error_body}"
        )));
    }

    sink.push(AssistantMessageEvent::Start { partial: output.clone() });

    let mut reader = SseReader::new(response, cancel.clone());
    process_responses_stream(
        &mut reader,
        model,
        output,
        sink,
        options.service_tier.as_deref(),
        true,
    )
    .await?;

    if output.stop_reason.is_terminal_failure() {
        return Err(AdapterError::msg("An unknown error occurred"));
    }
    Ok(())
}

/// Stream using the simple API, mapping the reasoning level to effort.
pub fn stream_simple_openai_responses(
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
    let reasoning_effort = options
        .effective_reasoning()
        .and_then(|level| openai_reasoning_effort(&model, level))
        .map(str::to_string);

    let responses = OpenAiResponsesOptions {
        api_key: Some(api_key),
        reasoning_effort,
        ..OpenAiResponsesOptions::from(base)
    };
    Ok(stream_openai_responses(model, context, responses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use unillm_core::message::{AssistantContent, Message, StopReason, ToolCall};
    use unillm_core::model::{InputModality, ModelCost, ThinkingLevel};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model(base_url: &str) -> Model {
        Model {
            id: "gpt-5.2".into(),
            name: "GPT-5.2".into(),
            api: "openai-responses".into(),
            provider: "openai".into(),
            base_url: base_url.into(),
            reasoning: true,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost::new(1.75, 14.0, 0.175, 0.0),
            context_window: 400_000,
            max_tokens: 128_000,
            headers: None,
            compat: None,
        }
    }

    fn sse_body(events: &[&str]) -> String {
        events.iter().map(|data| format!("data: {data}\n\n")).collect()
    }

    async fn mock_responses(body: String) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn streams_message_and_function_call_items() {
        let body = sse_body(&[
            r#"{"type":"response.output_item.added","item":{"type":"message","id":"msg_1"}}"#,
            r#"{"type":"response.output_text.delta","delta":"Checking"}"#,
            r#"{"type":"response.output_item.done","item":{"type":"message","id":"msg_1","content":[{"type":"output_text","text":"Checking"}]}}"#,
            r#"{"type":"response.output_item.added","item":{"type":"function_call","call_id":"call_1","id":"fc_1","name":"get_weather","arguments":""}}"#,
            r#"{"type":"response.function_call_arguments.delta","delta":"{\"city\":\"Tokyo\"}"}"#,
            r#"{"type":"response.output_item.done","item":{"type":"function_call","call_id":"call_1","id":"fc_1","name":"get_weather","arguments":"{\"city\":\"Tokyo\"}"}}"#,
            r#"{"type":"response.completed","response":{"status":"completed","usage":{"input_tokens":20,"output_tokens":8,"total_tokens":28,"input_tokens_details":{"cached_tokens":4}}}}"#,
        ]);
        let server = mock_responses(body).await;

        let message = stream_openai_responses(
            model(&server.uri()),
            Context {
                messages: vec![Message::user("weather?")],
                ..Context::default()
            },
            OpenAiResponsesOptions {
                api_key: Some("sk-test".into()),
                ..OpenAiResponsesOptions::default()
            },
        )
        .result()
        .await
        .unwrap();

        assert_eq!(message.text(), "Checking");
        let calls = message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1|fc_1");
        assert_eq!(calls[0].arguments, json!({"city": "Tokyo"}));
        // Stop overridden to tool_use because a call is present.
        assert_eq!(message.stop_reason, StopReason::ToolUse);
        assert_eq!(message.usage.input, 16);
        assert_eq!(message.usage.cache_read, 4);
    }

    #[tokio::test]
    async fn reasoning_summary_round_trips_signature() {
        let body = sse_body(&[
            r#"{"type":"response.output_item.added","item":{"type":"reasoning","id":"rs_1"}}"#,
            r#"{"type":"response.reasoning_summary_text.delta","delta":"thinking..."}"#,
            r#"{"type":"response.output_item.done","item":{"type":"reasoning","id":"rs_1","summary":[{"type":"summary_text","text":"thinking..."}]}}"#,
            r#"{"type":"response.completed","response":{"status":"completed"}}"#,
        ]);
        let server = mock_responses(body).await;

        let message = stream_openai_responses(
            model(&server.uri()),
            Context {
                messages: vec![Message::user("hi")],
                ..Context::default()
            },
            OpenAiResponsesOptions {
                api_key: Some("sk-test".into()),
                reasoning_effort: Some("high".into()),
                ..OpenAiResponsesOptions::default()
            },
        )
        .result()
        .await
        .unwrap();

        match &message.content[0] {
            AssistantContent::Thinking(t) => {
                assert_eq!(t.thinking, "thinking...");
                let signature: Value =
                    serde_json::from_str(t.thinking_signature.as_ref().unwrap()).unwrap();
                assert_eq!(signature["type"], "reasoning");
                assert_eq!(signature["id"], "rs_1");
            }
            other => panic!("expected thinking, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reasoning_effort_rides_the_request() {
        let recorded: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let recorded_clone = recorded.clone();

        let body = sse_body(&[r#"{"type":"response.completed","response":{"status":"completed"}}"#]);
        let server = mock_responses(body).await;

        stream_simple_openai_responses(
            model(&server.uri()),
            Context {
                messages: vec![Message::user("hi")],
                ..Context::default()
            },
            SimpleStreamOptions {
                api_key: Some("sk-test".into()),
                reasoning: Some(ThinkingLevel::Xhigh),
                on_payload: Some(Arc::new(move |payload| {
                    *recorded_clone.lock().unwrap() = Some(payload.clone());
                })),
                ..SimpleStreamOptions::default()
            },
        )
        .unwrap()
        .result()
        .await
        .unwrap();

        let payload = recorded.lock().unwrap().clone().unwrap();
        // gpt-5.2 supports xhigh, so it is not clamped.
        assert_eq!(payload["reasoning"]["effort"], "xhigh");
        assert_eq!(payload["include"], json!(["reasoning.encrypted_content"]));
        assert_eq!(payload["store"], json!(false));
    }

    #[tokio::test]
    async fn failed_response_becomes_error_event() {
        let body = sse_body(&[r#"{"type":"response.failed"}"#]);
        let server = mock_responses(body).await;

        let err = stream_openai_responses(
            model(&server.uri()),
            Context {
                messages: vec![Message::user("hi")],
                ..Context::default()
            },
            OpenAiResponsesOptions {
                api_key: Some("sk-test".into()),
                ..OpenAiResponsesOptions::default()
            },
        )
        .result()
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Unknown error"));
    }

    #[test]
    fn replayed_tool_call_keeps_both_id_halves() {
        let m = model("https://api.openai.com/v1");
        let context = Context {
            messages: vec![Message::Assistant(AssistantMessage {
                content: vec![AssistantContent::ToolCall(ToolCall::new(
                    "call_7|fc_7",
                    "search",
                    json!({}),
                ))],
                model: m.id.clone(),
                provider: m.provider.clone(),
                api: m.api.clone(),
                stop_reason: StopReason::ToolUse,
                ..AssistantMessage::default()
            })],
            ..Context::default()
        };
        let body = build_body(&m, &context, &OpenAiResponsesOptions::default());
        let input = body["input"].as_array().unwrap();
        assert_eq!(input[0]["call_id"], "call_7");
        assert_eq!(input[0]["id"], "fc_7");
    }
}
