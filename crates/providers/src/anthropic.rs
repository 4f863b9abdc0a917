//! Anthropic Messages API adapter.
//!
//! Uses Anthropic's Messages API directly:
//! - `x-api-key` header authentication (`Authorization: Bearer` for OAuth
//!   tokens), `anthropic-version` header
//! - System prompt as top-level field with prompt-cache breadcrumbs
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE with `content_block_delta` events
//! - Extended thinking with per-level token budgets

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use unillm_core::event::{assistant_message_channel, AssistantMessageEvent, AssistantMessageSink, AssistantMessageStream};
use unillm_core::json::parse_streaming_json;
use unillm_core::message::{
    AssistantContent, AssistantMessage, ContentPart, Context, Message, StopReason, TextContent,
    ThinkingContent, Tool, ToolCall,
};
use unillm_core::model::{Model, ThinkingLevel};
use unillm_core::provider::{PayloadHook, SimpleStreamOptions, StreamOptions};
use unillm_core::{env::get_env_api_key, Error};

use crate::adapter::{check_cancel, finish_stream, http_client, new_output, AdapterError};
use crate::options::{
    adjust_max_tokens_for_thinking, anthropic_thinking_budget, build_base_options, clamp_reasoning,
};
use crate::sse::SseReader;
use crate::transform::{transform_messages, TransformOptions};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adaptive-thinking effort accepted by models that support it.
pub type AnthropicEffort = &'static str;

/// Extended options for the Anthropic adapter.
#[derive(Clone, Default)]
pub struct AnthropicOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub session_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub on_payload: Option<PayloadHook>,
    pub thinking_enabled: bool,
    pub thinking_budget_tokens: Option<u32>,
    /// Adaptive-thinking effort for models that support it.
    pub effort: Option<AnthropicEffort>,
    pub interleaved_thinking: bool,
    pub tool_choice: Option<Value>,
}

impl From<StreamOptions> for AnthropicOptions {
    fn from(options: StreamOptions) -> Self {
        Self {
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            api_key: options.api_key,
            headers: options.headers,
            session_id: options.session_id,
            cancel: options.cancel,
            on_payload: options.on_payload,
            interleaved_thinking: true,
            ..Self::default()
        }
    }
}

fn is_oauth_token(api_key: &str) -> bool {
    api_key.contains("sk-ant-oat")
}

/// Normalize tool call IDs to Anthropic's required pattern.
fn normalize_tool_call_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(64)
        .collect()
}

fn supports_adaptive_thinking(model_id: &str) -> bool {
    model_id.contains("opus-4-6") || model_id.contains("opus-4.6")
}

fn map_effort(level: ThinkingLevel) -> AnthropicEffort {
    match level {
        ThinkingLevel::Minimal | ThinkingLevel::Low => "low",
        ThinkingLevel::Medium => "medium",
        ThinkingLevel::High | ThinkingLevel::Off => "high",
        ThinkingLevel::Xhigh => "max",
    }
}

fn map_stop_reason(reason: &str) -> Result<StopReason, AdapterError> {
    match reason {
        "end_turn" | "pause_turn" | "stop_sequence" => Ok(StopReason::Stop),
        "max_tokens" => Ok(StopReason::Length),
        "tool_use" => Ok(StopReason::ToolUse),
        "refusal" | "sensitive" => Ok(StopReason::Error),
        other => Err(AdapterError::msg(format!("Unhandled stop reason: {other}"))),
    }
}

/// Convert tool-result content to Anthropic's format: plain string when
/// text-only, content blocks when images are present.
fn convert_result_content(content: &[ContentPart]) -> Value {
    let has_images = content.iter().any(|c| matches!(c, ContentPart::Image(_)));
    if !has_images {
        let text = content
            .iter()
            .filter_map(|c| match c {
                ContentPart::Text(t) => Some(t.text.as_str()),
                ContentPart::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        return Value::String(text);
    }

    let mut blocks: Vec<Value> = Vec::new();
    for part in content {
        match part {
            ContentPart::Text(t) => blocks.push(json!({"type": "text", "text": t.text})),
            ContentPart::Image(img) => blocks.push(json!({
                "type": "image",
                "source": {"type": "base64", "media_type": img.mime_type, "data": img.data},
            })),
        }
    }
    if !blocks.iter().any(|b| b["type"] == "text") {
        blocks.insert(0, json!({"type": "text", "text": "(see attached image)"}));
    }
    Value::Array(blocks)
}

/// Convert messages to Anthropic API format.
fn convert_messages(messages: &[Message], model: &Model, cache_control: Option<&Value>) -> Vec<Value> {
    let normalize = |id: &str| normalize_tool_call_id(id);
    let transformed = transform_messages(
        messages,
        &TransformOptions {
            current_model: Some(&model.id),
            normalize_tool_id: Some(&normalize),
            convert_thinking_to_text: false,
        },
    );

    let mut params: Vec<Value> = Vec::new();
    let mut i = 0;
    while i < transformed.len() {
        match &transformed[i] {
            Message::User(user) => {
                let mut blocks: Vec<Value> = Vec::new();
                match &user.content {
                    unillm_core::message::UserContent::Text(text) => {
                        if !text.trim().is_empty() {
                            params.push(json!({"role": "user", "content": text}));
                        }
                        i += 1;
                        continue;
                    }
                    unillm_core::message::UserContent::Blocks(parts) => {
                        for part in parts {
                            match part {
                                ContentPart::Text(t) if !t.text.trim().is_empty() => {
                                    blocks.push(json!({"type": "text", "text": t.text}));
                                }
                                ContentPart::Image(img) if model.supports_images() => {
                                    blocks.push(json!({
                                        "type": "image",
                                        "source": {
                                            "type": "base64",
                                            "media_type": img.mime_type,
                                            "data": img.data,
                                        },
                                    }));
                                }
                                _ => {}
                            }
                        }
                    }
                }
                if !blocks.is_empty() {
                    params.push(json!({"role": "user", "content": blocks}));
                }
            }

            Message::Assistant(assistant) => {
                let mut blocks: Vec<Value> = Vec::new();
                for block in &assistant.content {
                    match block {
                        AssistantContent::Text(t) => {
                            if !t.text.trim().is_empty() {
                                blocks.push(json!({"type": "text", "text": t.text}));
                            }
                        }
                        AssistantContent::Thinking(thinking) => {
                            if thinking.thinking.trim().is_empty() {
                                continue;
                            }
                            match thinking.thinking_signature.as_deref() {
                                Some(sig) if !sig.trim().is_empty() => {
                                    blocks.push(json!({
                                        "type": "thinking",
                                        "thinking": thinking.thinking,
                                        "signature": sig,
                                    }));
                                }
                                // Unsigned thinking is replayed as text.
                                _ => blocks.push(json!({"type": "text", "text": thinking.thinking})),
                            }
                        }
                        AssistantContent::ToolCall(tc) => {
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.name,
                                "input": tc.arguments,
                            }));
                        }
                    }
                }
                if !blocks.is_empty() {
                    params.push(json!({"role": "assistant", "content": blocks}));
                }
            }

            Message::ToolResult(_) => {
                // Collect consecutive tool results into one user message.
                let mut results: Vec<Value> = Vec::new();
                while i < transformed.len() {
                    let Message::ToolResult(tr) = &transformed[i] else { break };
                    results.push(json!({
                        "type": "tool_result",
                        "tool_use_id": tr.tool_call_id,
                        "content": convert_result_content(&tr.content),
                        "is_error": tr.is_error,
                    }));
                    i += 1;
                }
                params.push(json!({"role": "user", "content": results}));
                continue;
            }
        }
        i += 1;
    }

    // Cache breadcrumb on the last user message.
    if let Some(cache_control) = cache_control {
        if let Some(last) = params.last_mut() {
            if last["role"] == "user" {
                match &mut last["content"] {
                    Value::Array(blocks) => {
                        if let Some(block) = blocks.last_mut() {
                            block["cache_control"] = cache_control.clone();
                        }
                    }
                    Value::String(text) => {
                        last["content"] = json!([{
                            "type": "text",
                            "text": text,
                            "cache_control": cache_control,
                        }]);
                    }
                    _ => {}
                }
            }
        }
    }

    params
}

fn convert_tools(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": {
                    "type": "object",
                    "properties": tool.parameters.get("properties").cloned().unwrap_or_else(|| json!({})),
                    "required": tool.parameters.get("required").cloned().unwrap_or_else(|| json!([])),
                },
            })
        })
        .collect()
}

fn build_body(model: &Model, context: &Context, options: &AnthropicOptions, cache_control: Option<&Value>) -> Value {
    let max_tokens = options
        .max_tokens
        .unwrap_or_else(|| if model.max_tokens > 0 { model.max_tokens / 3 } else { 4096 });

    let mut body = json!({
        "model": model.id,
        "messages": convert_messages(&context.messages, model, cache_control),
        "max_tokens": max_tokens,
        "stream": true,
    });

    if let Some(system) = &context.system_prompt {
        let mut block = json!({"type": "text", "text": system});
        if let Some(cache_control) = cache_control {
            block["cache_control"] = cache_control.clone();
        }
        body["system"] = json!([block]);
    }

    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }

    if !context.tools.is_empty() {
        body["tools"] = json!(convert_tools(&context.tools));
    }

    if options.thinking_enabled && model.reasoning {
        if supports_adaptive_thinking(&model.id) {
            body["thinking"] = json!({"type": "adaptive"});
            if let Some(effort) = options.effort {
                body["output_config"] = json!({"effort": effort});
            }
        } else {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": options.thinking_budget_tokens.unwrap_or(1024),
            });
        }
    }

    if let Some(tool_choice) = &options.tool_choice {
        body["tool_choice"] = tool_choice.clone();
    }

    body
}

/// Stream a response from the Anthropic Messages API.
pub fn stream_anthropic(model: Model, context: Context, options: AnthropicOptions) -> AssistantMessageStream {
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
    options: &AnthropicOptions,
    output: &mut AssistantMessage,
    sink: &AssistantMessageSink,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    let api_key = options
        .api_key
        .clone()
        .or_else(|| get_env_api_key(&model.provider))
        .unwrap_or_default();

    let cache_control = json!({"type": "ephemeral"});
    let body = build_body(model, context, options, Some(&cache_control));
    if let Some(on_payload) = &options.on_payload {
        on_payload(&body);
    }

    let mut beta_features = vec!["fine-grained-tool-streaming-2025-05-14"];
    if options.interleaved_thinking {
        beta_features.push("interleaved-thinking-2025-05-14");
    }
    if is_oauth_token(&api_key) {
        beta_features.push("oauth-2025-04-20");
    }

    let url = format!("{}/v1/messages", model.base_url.trim_end_matches('/'));
    debug!(provider = %model.provider, model = %model.id, "Sending streaming request");

    let mut request = http_client()
        .post(&url)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("anthropic-beta", beta_features.join(","))
        .header("Content-Type", "application/json")
        .header("Accept", "text/event-stream");

    if is_oauth_token(&api_key) {
        request = request.header("Authorization", format!("Bearer {api_key}"));
    } else {
        request = request.header("x-api-key", &api_key);
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
            "Anthropic API error ({status}): {error_body}"
        )));
    }

    sink.push(AssistantMessageEvent::Start { partial: output.clone() });

    // Map the API's block index onto our content index.
    let mut block_indices: HashMap<u64, usize> = HashMap::new();
    let mut partial_json: HashMap<usize, String> = HashMap::new();

    let mut reader = SseReader::new(response, cancel.clone());
    while let Some(event) = reader.next().await? {
        let data: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => continue,
        };

        match data["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let usage = &data["message"]["usage"];
                output.usage.input = usage["input_tokens"].as_u64().unwrap_or(0);
                output.usage.output = usage["output_tokens"].as_u64().unwrap_or(0);
                output.usage.cache_read = usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
                output.usage.cache_write = usage["cache_creation_input_tokens"].as_u64().unwrap_or(0);
                output.usage.update_total();
                unillm_core::model::calculate_cost(model, &mut output.usage);
            }

            "content_block_start" => {
                let api_index = data["index"].as_u64().unwrap_or(0);
                let block = &data["content_block"];
                match block["type"].as_str().unwrap_or_default() {
                    "text" => {
                        output.content.push(AssistantContent::Text(TextContent::new("")));
                        let index = output.content.len() - 1;
                        block_indices.insert(api_index, index);
                        sink.push(AssistantMessageEvent::TextStart {
                            content_index: index,
                            partial: output.clone(),
                        });
                    }
                    "thinking" => {
                        output.content.push(AssistantContent::Thinking(ThinkingContent::default()));
                        let index = output.content.len() - 1;
                        block_indices.insert(api_index, index);
                        sink.push(AssistantMessageEvent::ThinkingStart {
                            content_index: index,
                            partial: output.clone(),
                        });
                    }
                    "tool_use" => {
                        let tc = ToolCall::new(
                            block["id"].as_str().unwrap_or_default(),
                            block["name"].as_str().unwrap_or_default(),
                            json!({}),
                        );
                        output.content.push(AssistantContent::ToolCall(tc));
                        let index = output.content.len() - 1;
                        block_indices.insert(api_index, index);
                        partial_json.insert(index, String::new());
                        sink.push(AssistantMessageEvent::ToolCallStart {
                            content_index: index,
                            partial: output.clone(),
                        });
                    }
                    _ => {}
                }
            }

            "content_block_delta" => {
                let api_index = data["index"].as_u64().unwrap_or(0);
                let Some(&index) = block_indices.get(&api_index) else { continue };
                let delta = &data["delta"];

                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or_default().to_string();
                        let mut applied = false;
                        if let Some(AssistantContent::Text(block)) = output.content.get_mut(index) {
                            block.text.push_str(&text);
                            applied = true;
                        }
                        if applied {
                            sink.push(AssistantMessageEvent::TextDelta {
                                content_index: index,
                                delta: text,
                                partial: output.clone(),
                            });
                        }
                    }
                    "thinking_delta" => {
                        let text = delta["thinking"].as_str().unwrap_or_default().to_string();
                        let mut applied = false;
                        if let Some(AssistantContent::Thinking(block)) = output.content.get_mut(index) {
                            block.thinking.push_str(&text);
                            applied = true;
                        }
                        if applied {
                            sink.push(AssistantMessageEvent::ThinkingDelta {
                                content_index: index,
                                delta: text,
                                partial: output.clone(),
                            });
                        }
                    }
                    "input_json_delta" => {
                        let fragment = delta["partial_json"].as_str().unwrap_or_default().to_string();
                        let accumulated = partial_json.entry(index).or_default();
                        accumulated.push_str(&fragment);
                        let snapshot = parse_streaming_json(accumulated);
                        let mut applied = false;
                        if let Some(AssistantContent::ToolCall(block)) = output.content.get_mut(index) {
                            block.arguments = snapshot;
                            applied = true;
                        }
                        if applied {
                            sink.push(AssistantMessageEvent::ToolCallDelta {
                                content_index: index,
                                delta: fragment,
                                partial: output.clone(),
                            });
                        }
                    }
                    "signature_delta" => {
                        let signature = delta["signature"].as_str().unwrap_or_default();
                        if let Some(AssistantContent::Thinking(block)) = output.content.get_mut(index) {
                            block
                                .thinking_signature
                                .get_or_insert_with(String::new)
                                .push_str(signature);
                        }
                    }
                    _ => {}
                }
            }

            "content_block_stop" => {
                let api_index = data["index"].as_u64().unwrap_or(0);
                let Some(&index) = block_indices.get(&api_index) else { continue };

                enum Finished {
                    Text(String),
                    Thinking(String, Option<String>),
                    Tool(ToolCall),
                }
                let finished = match output.content.get_mut(index) {
                    Some(AssistantContent::Text(block)) => Some(Finished::Text(block.text.clone())),
                    Some(AssistantContent::Thinking(block)) => Some(Finished::Thinking(
                        block.thinking.clone(),
                        block.thinking_signature.clone(),
                    )),
                    Some(AssistantContent::ToolCall(block)) => {
                        if let Some(raw) = partial_json.remove(&index) {
                            block.arguments = match serde_json::from_str(&raw) {
                                Ok(value) => value,
                                Err(_) => parse_streaming_json(&raw),
                            };
                        }
                        Some(Finished::Tool(block.clone()))
                    }
                    None => None,
                };

                match finished {
                    Some(Finished::Text(content)) => sink.push(AssistantMessageEvent::TextEnd {
                        content_index: index,
                        content,
                        partial: output.clone(),
                    }),
                    Some(Finished::Thinking(content, signature)) => {
                        sink.push(AssistantMessageEvent::ThinkingEnd {
                            content_index: index,
                            content,
                            signature,
                            partial: output.clone(),
                        })
                    }
                    Some(Finished::Tool(tool_call)) => sink.push(AssistantMessageEvent::ToolCallEnd {
                        content_index: index,
                        tool_call,
                        partial: output.clone(),
                    }),
                    None => {}
                }
            }

            "message_delta" => {
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    output.stop_reason = map_stop_reason(reason)?;
                }
                let usage = &data["usage"];
                if let Some(input) = usage["input_tokens"].as_u64() {
                    output.usage.input = input;
                }
                if let Some(out) = usage["output_tokens"].as_u64() {
                    output.usage.output = out;
                }
                if let Some(read) = usage["cache_read_input_tokens"].as_u64() {
                    output.usage.cache_read = read;
                }
                if let Some(write) = usage["cache_creation_input_tokens"].as_u64() {
                    output.usage.cache_write = write;
                }
                output.usage.update_total();
                unillm_core::model::calculate_cost(model, &mut output.usage);
            }

            "message_stop" => break,

            "error" => {
                let message = data["error"]["message"]
                    .as_str()
                    .unwrap_or("Unknown provider error");
                return Err(AdapterError::msg(format!("Anthropic stream error: {message}")));
            }

            // ping and anything novel: drop silently.
            _ => {}
        }
    }

    Ok(())
}

/// Stream using the simple API, mapping the reasoning level to thinking
/// budgets (or adaptive effort where supported).
pub fn stream_simple_anthropic(
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
    let mut anthropic = AnthropicOptions {
        api_key: Some(api_key),
        interleaved_thinking: true,
        ..AnthropicOptions::from(base)
    };

    let level = options
        .effective_reasoning()
        .map(|level| clamp_reasoning(&model, level))
        .filter(|level| !level.is_off());

    if let Some(level) = level {
        anthropic.thinking_enabled = true;
        if supports_adaptive_thinking(&model.id) {
            anthropic.effort = Some(map_effort(level));
        } else {
            let budget = options
                .thinking_budgets
                .as_ref()
                .and_then(|b| b.get(level))
                .unwrap_or_else(|| anthropic_thinking_budget(level));
            let (max_tokens, budget) =
                adjust_max_tokens_for_thinking(anthropic.max_tokens.unwrap_or(0), budget);
            anthropic.max_tokens = Some(max_tokens);
            anthropic.thinking_budget_tokens = Some(budget);
        }
    }

    Ok(stream_anthropic(model, context, anthropic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use unillm_core::model::{InputModality, ModelCost};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model(base_url: &str) -> Model {
        Model {
            id: "claude-sonnet-4-5".into(),
            name: "Claude Sonnet 4.5".into(),
            api: "anthropic-messages".into(),
            provider: "anthropic".into(),
            base_url: base_url.into(),
            reasoning: true,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost::new(3.0, 15.0, 0.3, 3.75),
            context_window: 200_000,
            max_tokens: 64_000,
            headers: None,
            compat: None,
        }
    }

    fn sse_body(events: &[(&str, &str)]) -> String {
        events
            .iter()
            .map(|(event, data)| format!("event: {event}\ndata: {data}\n\n"))
            .collect()
    }

    fn text_stream_body() -> String {
        sse_body(&[
            (
                "message_start",
                r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":0,"cache_read_input_tokens":3,"cache_creation_input_tokens":0}}}"#,
            ),
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}"#,
            ),
            (
                "content_block_stop",
                r#"{"type":"content_block_stop","index":0}"#,
            ),
            (
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
            ),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ])
    }

    async fn mock_messages_endpoint(body: String) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
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
    async fn streams_text_with_usage_and_cost() {
        let server = mock_messages_endpoint(text_stream_body()).await;
        let context = Context {
            messages: vec![Message::user("hi")],
            ..Context::default()
        };
        let options = AnthropicOptions {
            api_key: Some("sk-ant-test".into()),
            ..AnthropicOptions::default()
        };

        let mut stream = stream_anthropic(model(&server.uri()), context, options);
        let mut deltas = String::new();
        let mut saw_start = false;
        let mut saw_text_end = false;
        while let Some(event) = stream.next().await {
            match event {
                AssistantMessageEvent::Start { .. } => saw_start = true,
                AssistantMessageEvent::TextDelta { delta, .. } => deltas.push_str(&delta),
                AssistantMessageEvent::TextEnd { content, .. } => {
                    saw_text_end = true;
                    assert_eq!(content, "Hello there");
                }
                AssistantMessageEvent::Done { reason, message } => {
                    assert_eq!(reason, StopReason::Stop);
                    assert_eq!(message.usage.input, 12);
                    assert_eq!(message.usage.output, 7);
                    assert_eq!(message.usage.cache_read, 3);
                    // 12 * 3.0/1M + 7 * 15.0/1M + 3 * 0.3/1M
                    let expected = (12.0 * 3.0 + 7.0 * 15.0 + 3.0 * 0.3) / 1_000_000.0;
                    assert!((message.usage.cost.total - expected).abs() < 1e-12);
                }
                _ => {}
            }
        }
        assert!(saw_start);
        assert!(saw_text_end);
        assert_eq!(deltas, "Hello there");
    }

    #[tokio::test]
    async fn streams_tool_call_with_incremental_args() {
        let body = sse_body(&[
            (
                "message_start",
                r#"{"type":"message_start","message":{"usage":{"input_tokens":5,"output_tokens":0}}}"#,
            ),
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"get_weather"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"city\": "}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"Tokyo\"}"}}"#,
            ),
            (
                "content_block_stop",
                r#"{"type":"content_block_stop","index":0}"#,
            ),
            (
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
            ),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ]);
        let server = mock_messages_endpoint(body).await;

        let context = Context {
            messages: vec![Message::user("weather in tokyo?")],
            tools: vec![Tool {
                name: "get_weather".into(),
                description: "Get weather".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"city": {"type": "string"}},
                    "required": ["city"],
                }),
            }],
            ..Context::default()
        };
        let options = AnthropicOptions {
            api_key: Some("sk-ant-test".into()),
            ..AnthropicOptions::default()
        };

        let mut stream = stream_anthropic(model(&server.uri()), context, options);
        let mut concatenated = String::new();
        let mut final_call: Option<ToolCall> = None;
        let mut done_reason = None;
        while let Some(event) = stream.next().await {
            match event {
                AssistantMessageEvent::ToolCallDelta { delta, .. } => concatenated.push_str(&delta),
                AssistantMessageEvent::ToolCallEnd { tool_call, .. } => final_call = Some(tool_call),
                AssistantMessageEvent::Done { reason, .. } => done_reason = Some(reason),
                _ => {}
            }
        }

        let call = final_call.expect("tool call end");
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, serde_json::json!({"city": "Tokyo"}));
        // Concatenated deltas strict-parse to the final arguments.
        let parsed: Value = serde_json::from_str(&concatenated).unwrap();
        assert_eq!(parsed, call.arguments);
        assert_eq!(done_reason, Some(StopReason::ToolUse));
    }

    #[tokio::test]
    async fn provider_error_becomes_error_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_string(r#"{"type":"error","error":{"type":"overloaded_error"}}"#))
            .mount(&server)
            .await;

        let options = AnthropicOptions {
            api_key: Some("sk-ant-test".into()),
            ..AnthropicOptions::default()
        };
        let stream = stream_anthropic(
            model(&server.uri()),
            Context {
                messages: vec![Message::user("hi")],
                ..Context::default()
            },
            options,
        );
        let err = stream.result().await.unwrap_err();
        assert!(err.to_string().contains("529"));
    }

    #[tokio::test]
    async fn reasoning_level_maps_to_thinking_budget() {
        let recorded: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let recorded_clone = recorded.clone();

        let server = mock_messages_endpoint(text_stream_body()).await;
        let options = SimpleStreamOptions {
            api_key: Some("sk-ant-test".into()),
            reasoning: Some(ThinkingLevel::High),
            max_tokens: Some(8000),
            on_payload: Some(Arc::new(move |payload| {
                *recorded_clone.lock().unwrap() = Some(payload.clone());
            })),
            ..SimpleStreamOptions::default()
        };

        let stream = stream_simple_anthropic(
            model(&server.uri()),
            Context {
                messages: vec![Message::user("think hard")],
                ..Context::default()
            },
            options,
        )
        .unwrap();
        stream.result().await.unwrap();

        let payload = recorded.lock().unwrap().clone().unwrap();
        assert_eq!(payload["thinking"]["type"], "enabled");
        assert_eq!(payload["thinking"]["budget_tokens"], 8192);
        // Budget rides on top of max_tokens.
        assert_eq!(payload["max_tokens"], 8000 + 8192);
    }

    #[tokio::test]
    async fn non_reasoning_model_omits_thinking() {
        let recorded: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let recorded_clone = recorded.clone();

        let server = mock_messages_endpoint(text_stream_body()).await;
        let mut m = model(&server.uri());
        m.reasoning = false;

        let options = SimpleStreamOptions {
            api_key: Some("sk-ant-test".into()),
            reasoning: Some(ThinkingLevel::High),
            on_payload: Some(Arc::new(move |payload| {
                *recorded_clone.lock().unwrap() = Some(payload.clone());
            })),
            ..SimpleStreamOptions::default()
        };

        let stream = stream_simple_anthropic(
            m,
            Context {
                messages: vec![Message::user("hi")],
                ..Context::default()
            },
            options,
        )
        .unwrap();
        stream.result().await.unwrap();

        let payload = recorded.lock().unwrap().clone().unwrap();
        assert!(payload.get("thinking").is_none());
    }

    #[tokio::test]
    async fn missing_api_key_fails_synchronously() {
        // No env key for a made-up provider, no key in options.
        let mut m = model("http://localhost:9");
        m.provider = "nonexistent-provider".into();
        let err = stream_simple_anthropic(m, Context::default(), SimpleStreamOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("No API key"));
    }

    #[tokio::test]
    async fn request_body_includes_tools_and_system() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(serde_json::json!({
                "model": "claude-sonnet-4-5",
                "system": [{"type": "text", "text": "Be helpful"}],
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(text_stream_body()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let context = Context {
            system_prompt: Some("Be helpful".into()),
            messages: vec![Message::user("hi")],
            ..Context::default()
        };
        let options = AnthropicOptions {
            api_key: Some("sk-ant-test".into()),
            ..AnthropicOptions::default()
        };
        stream_anthropic(model(&server.uri()), context, options)
            .result()
            .await
            .unwrap();
    }

    #[test]
    fn tool_call_id_normalization() {
        assert_eq!(normalize_tool_call_id("abc|def:123"), "abc_def_123");
        assert_eq!(normalize_tool_call_id("ok_id-1"), "ok_id-1");
        assert_eq!(normalize_tool_call_id(&"x".repeat(100)).len(), 64);
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason("end_turn").unwrap(), StopReason::Stop);
        assert_eq!(map_stop_reason("max_tokens").unwrap(), StopReason::Length);
        assert_eq!(map_stop_reason("tool_use").unwrap(), StopReason::ToolUse);
        assert_eq!(map_stop_reason("refusal").unwrap(), StopReason::Error);
        assert!(map_stop_reason("novel_reason").is_err());
    }

    #[test]
    fn oauth_tokens_detected() {
        assert!(is_oauth_token("sk-ant-oat01-xyz"));
        assert!(!is_oauth_token("sk-ant-api03-xyz"));
    }
}
