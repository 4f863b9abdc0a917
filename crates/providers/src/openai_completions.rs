//! OpenAI Chat Completions API adapter.
//!
//! Works with OpenAI and the long tail of compatible hosts (OpenRouter,
//! Groq, Mistral, Cerebras, xAI, GitHub Copilot, z.ai, …). Host quirks are
//! detected from the provider id and base URL and can be overridden per
//! model via `Model.compat`.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use unillm_core::event::{
    assistant_message_channel, AssistantMessageEvent, AssistantMessageSink, AssistantMessageStream,
};
use unillm_core::json::parse_streaming_json;
use unillm_core::message::{
    AssistantContent, AssistantMessage, ContentPart, Context, ImageContent, Message, StopReason,
    TextContent, ThinkingContent, Tool, ToolCall, UserContent,
};
use unillm_core::model::{
    calculate_cost, MaxTokensField, Model, ThinkingFormat,
};
use unillm_core::provider::{PayloadHook, SimpleStreamOptions, StreamOptions};
use unillm_core::{env::get_env_api_key, Error};

use crate::adapter::{check_cancel, finish_stream, http_client, new_output, AdapterError};
use crate::openai_shared::copilot_headers;
use crate::options::{build_base_options, openai_reasoning_effort};
use crate::sse::SseReader;
use crate::transform::{has_tool_history, transform_messages, TransformOptions};

/// Extended options for the Chat Completions adapter.
#[derive(Clone, Default)]
pub struct OpenAiCompletionsOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub session_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub on_payload: Option<PayloadHook>,
    pub tool_choice: Option<Value>,
    pub reasoning_effort: Option<String>,
}

impl From<StreamOptions> for OpenAiCompletionsOptions {
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

/// Resolved compatibility settings for one model.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Compat {
    supports_store: bool,
    supports_developer_role: bool,
    supports_reasoning_effort: bool,
    supports_usage_in_streaming: bool,
    max_tokens_field: MaxTokensField,
    requires_tool_result_name: bool,
    requires_assistant_after_tool_result: bool,
    requires_thinking_as_text: bool,
    requires_mistral_tool_ids: bool,
    thinking_format: ThinkingFormat,
    supports_strict_mode: bool,
}

/// Detect compatibility settings from provider and base URL.
fn detect_compat(model: &Model) -> Compat {
    let provider = model.provider.as_str();
    let base_url = model.base_url.as_str();

    let is_zai = provider == "zai" || base_url.contains("api.z.ai");
    let is_grok = provider == "xai" || base_url.contains("api.x.ai");
    let is_mistral = provider == "mistral" || base_url.contains("mistral.ai");
    let is_non_standard = matches!(provider, "cerebras" | "xai" | "mistral" | "opencode")
        || ["cerebras.ai", "api.x.ai", "mistral.ai", "chutes.ai", "deepseek.com", "opencode.ai"]
            .iter()
            .any(|s| base_url.contains(s))
        || is_zai;
    let use_max_tokens = is_mistral || base_url.contains("chutes.ai");

    Compat {
        supports_store: !is_non_standard,
        supports_developer_role: !is_non_standard,
        supports_reasoning_effort: !is_grok && !is_zai,
        supports_usage_in_streaming: true,
        max_tokens_field: if use_max_tokens {
            MaxTokensField::MaxTokens
        } else {
            MaxTokensField::MaxCompletionTokens
        },
        requires_tool_result_name: is_mistral,
        requires_assistant_after_tool_result: false,
        requires_thinking_as_text: is_mistral,
        requires_mistral_tool_ids: is_mistral,
        thinking_format: if is_zai { ThinkingFormat::Zai } else { ThinkingFormat::Openai },
        supports_strict_mode: true,
    }
}

/// Detection merged with per-model overrides.
pub(crate) fn resolve_compat(model: &Model) -> Compat {
    let detected = detect_compat(model);
    let Some(c) = &model.compat else { return detected };
    Compat {
        supports_store: c.supports_store.unwrap_or(detected.supports_store),
        supports_developer_role: c.supports_developer_role.unwrap_or(detected.supports_developer_role),
        supports_reasoning_effort: c
            .supports_reasoning_effort
            .unwrap_or(detected.supports_reasoning_effort),
        supports_usage_in_streaming: c
            .supports_usage_in_streaming
            .unwrap_or(detected.supports_usage_in_streaming),
        max_tokens_field: c.max_tokens_field.unwrap_or(detected.max_tokens_field),
        requires_tool_result_name: c
            .requires_tool_result_name
            .unwrap_or(detected.requires_tool_result_name),
        requires_assistant_after_tool_result: c
            .requires_assistant_after_tool_result
            .unwrap_or(detected.requires_assistant_after_tool_result),
        requires_thinking_as_text: c
            .requires_thinking_as_text
            .unwrap_or(detected.requires_thinking_as_text),
        requires_mistral_tool_ids: c
            .requires_mistral_tool_ids
            .unwrap_or(detected.requires_mistral_tool_ids),
        thinking_format: c.thinking_format.unwrap_or(detected.thinking_format),
        supports_strict_mode: c.supports_strict_mode.unwrap_or(detected.supports_strict_mode),
    }
}

/// Normalize a tool call ID for Mistral: exactly 9 alphanumeric chars.
fn normalize_mistral_tool_id(id: &str) -> String {
    let mut normalized: String = id.chars().filter(char::is_ascii_alphanumeric).collect();
    if normalized.len() < 9 {
        let padding = "ABCDEFGHI";
        let needed = 9 - normalized.len();
        normalized.push_str(&padding[..needed]);
    }
    normalized.truncate(9);
    normalized
}

fn normalize_tool_id(model: &Model, compat: &Compat, id: &str) -> String {
    if compat.requires_mistral_tool_ids {
        return normalize_mistral_tool_id(id);
    }
    if let Some((call_id, _item_id)) = id.split_once('|') {
        let sanitized: String = call_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        return sanitized.chars().take(40).collect();
    }
    if model.provider == "openai" {
        return id.chars().take(40).collect();
    }
    if model.provider == "github-copilot" && model.id.to_lowercase().contains("claude") {
        return id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .take(64)
            .collect();
    }
    id.to_string()
}

fn image_url_part(img: &ImageContent) -> Value {
    json!({
        "type": "image_url",
        "image_url": {"url": format!("data:{};base64,{}", img.mime_type, img.data)},
    })
}

/// Convert messages to Chat Completions format.
fn convert_messages(model: &Model, context: &Context, compat: &Compat) -> Vec<Value> {
    let normalize = |id: &str| normalize_tool_id(model, compat, id);
    let transformed = transform_messages(
        &context.messages,
        &TransformOptions {
            current_model: Some(&model.id),
            normalize_tool_id: Some(&normalize),
            convert_thinking_to_text: false,
        },
    );

    let mut params: Vec<Value> = Vec::new();

    if let Some(system) = &context.system_prompt {
        let role = if model.reasoning && compat.supports_developer_role {
            "developer"
        } else {
            "system"
        };
        params.push(json!({"role": role, "content": system}));
    }

    let mut last_was_tool_result = false;
    let mut i = 0;
    while i < transformed.len() {
        let msg = &transformed[i];

        if compat.requires_assistant_after_tool_result
            && last_was_tool_result
            && matches!(msg, Message::User(_))
        {
            params.push(json!({"role": "assistant", "content": "I have processed the tool results."}));
        }

        match msg {
            Message::User(user) => {
                match &user.content {
                    UserContent::Text(text) => {
                        params.push(json!({"role": "user", "content": text}));
                    }
                    UserContent::Blocks(blocks) => {
                        let mut content: Vec<Value> = Vec::new();
                        for block in blocks {
                            match block {
                                ContentPart::Text(t) => {
                                    content.push(json!({"type": "text", "text": t.text}));
                                }
                                ContentPart::Image(img) if model.supports_images() => {
                                    content.push(image_url_part(img));
                                }
                                ContentPart::Image(_) => {}
                            }
                        }
                        if content.is_empty() {
                            i += 1;
                            continue;
                        }
                        params.push(json!({"role": "user", "content": content}));
                    }
                }
                last_was_tool_result = false;
            }

            Message::Assistant(assistant) => {
                let mut message = json!({"role": "assistant"});

                let text_blocks: Vec<&TextContent> = assistant
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        AssistantContent::Text(t) if !t.text.trim().is_empty() => Some(t),
                        _ => None,
                    })
                    .collect();
                if !text_blocks.is_empty() {
                    if model.provider == "github-copilot" {
                        let joined: String = text_blocks.iter().map(|t| t.text.as_str()).collect();
                        message["content"] = json!(joined);
                    } else {
                        let blocks: Vec<Value> = text_blocks
                            .iter()
                            .map(|t| json!({"type": "text", "text": t.text}))
                            .collect();
                        message["content"] = json!(blocks);
                    }
                }

                let thinking_blocks: Vec<&ThinkingContent> = assistant
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        AssistantContent::Thinking(t) if !t.thinking.trim().is_empty() => Some(t),
                        _ => None,
                    })
                    .collect();
                if !thinking_blocks.is_empty() {
                    if compat.requires_thinking_as_text {
                        let thinking_text = thinking_blocks
                            .iter()
                            .map(|t| t.thinking.as_str())
                            .collect::<Vec<_>>()
                            .join("\n\n");
                        let text_block = json!({"type": "text", "text": thinking_text});
                        if matches!(message.get("content"), Some(Value::Array(_))) {
                            if let Some(Value::Array(existing)) = message.get_mut("content") {
                                existing.insert(0, text_block);
                            }
                        } else {
                            message["content"] = json!([text_block]);
                        }
                    } else if let Some(field) =
                        thinking_blocks[0].thinking_signature.as_deref().filter(|s| !s.is_empty())
                    {
                        // The signature names the field the host streamed
                        // the reasoning under; replay it there.
                        let joined = thinking_blocks
                            .iter()
                            .map(|t| t.thinking.as_str())
                            .collect::<Vec<_>>()
                            .join("\n");
                        message[field] = json!(joined);
                    }
                }

                let tool_calls = assistant.tool_calls();
                if !tool_calls.is_empty() {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                },
                            })
                        })
                        .collect();
                    message["tool_calls"] = json!(calls);

                    let reasoning_details: Vec<Value> = tool_calls
                        .iter()
                        .filter_map(|tc| tc.thought_signature.as_deref())
                        .filter_map(|sig| serde_json::from_str(sig).ok())
                        .collect();
                    if !reasoning_details.is_empty() {
                        message["reasoning_details"] = json!(reasoning_details);
                    }
                }

                let has_content = message.get("content").is_some();
                if !has_content && message.get("tool_calls").is_none() {
                    i += 1;
                    continue;
                }
                if !has_content && compat.requires_assistant_after_tool_result {
                    message["content"] = json!("");
                }
                params.push(message);
                last_was_tool_result = false;
            }

            Message::ToolResult(_) => {
                // Consecutive results are emitted back to back; attached
                // images follow as one user message.
                let mut image_blocks: Vec<Value> = Vec::new();
                while i < transformed.len() {
                    let Message::ToolResult(tr) = &transformed[i] else { break };
                    let text_result = tr.text();
                    let has_images = tr.content.iter().any(|c| matches!(c, ContentPart::Image(_)));

                    let mut result = json!({
                        "role": "tool",
                        "content": if text_result.is_empty() { "(see attached image)" } else { &text_result },
                        "tool_call_id": tr.tool_call_id,
                    });
                    if compat.requires_tool_result_name && !tr.tool_name.is_empty() {
                        result["name"] = json!(tr.tool_name);
                    }
                    params.push(result);

                    if has_images && model.supports_images() {
                        for block in &tr.content {
                            if let ContentPart::Image(img) = block {
                                image_blocks.push(image_url_part(img));
                            }
                        }
                    }
                    i += 1;
                }

                if image_blocks.is_empty() {
                    last_was_tool_result = true;
                } else {
                    if compat.requires_assistant_after_tool_result {
                        params.push(json!({"role": "assistant", "content": "I have processed the tool results."}));
                    }
                    let mut content = vec![json!({"type": "text", "text": "Attached image(s) from tool result:"})];
                    content.extend(image_blocks);
                    params.push(json!({"role": "user", "content": content}));
                    last_was_tool_result = false;
                }
                continue;
            }
        }
        i += 1;
    }

    params
}

fn convert_tools(tools: &[Tool], compat: &Compat) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut function = json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            });
            if compat.supports_strict_mode {
                function["strict"] = json!(false);
            }
            json!({"type": "function", "function": function})
        })
        .collect()
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::Length,
        "function_call" | "tool_calls" => StopReason::ToolUse,
        "content_filter" => StopReason::Error,
        _ => StopReason::Stop,
    }
}

fn build_body(model: &Model, context: &Context, options: &OpenAiCompletionsOptions, compat: &Compat) -> Value {
    let mut body = json!({
        "model": model.id,
        "messages": convert_messages(model, context, compat),
        "stream": true,
    });

    if compat.supports_usage_in_streaming {
        body["stream_options"] = json!({"include_usage": true});
    }
    if compat.supports_store {
        body["store"] = json!(false);
    }
    if let Some(max_tokens) = options.max_tokens {
        match compat.max_tokens_field {
            MaxTokensField::MaxTokens => body["max_tokens"] = json!(max_tokens),
            MaxTokensField::MaxCompletionTokens => body["max_completion_tokens"] = json!(max_tokens),
        }
    }
    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }

    if !context.tools.is_empty() {
        body["tools"] = json!(convert_tools(&context.tools, compat));
    } else if has_tool_history(&context.messages) {
        body["tools"] = json!([]);
    }
    if let Some(tool_choice) = &options.tool_choice {
        body["tool_choice"] = tool_choice.clone();
    }

    match compat.thinking_format {
        ThinkingFormat::Zai if model.reasoning => {
            let state = if options.reasoning_effort.is_some() { "enabled" } else { "disabled" };
            body["thinking"] = json!({"type": state});
        }
        ThinkingFormat::Qwen if model.reasoning => {
            body["enable_thinking"] = json!(options.reasoning_effort.is_some());
        }
        _ => {
            if let Some(effort) = &options.reasoning_effort {
                if model.reasoning && compat.supports_reasoning_effort {
                    body["reasoning_effort"] = json!(effort);
                }
            }
        }
    }

    body
}

/// Stream a response from a Chat Completions endpoint.
pub fn stream_openai_completions(
    model: Model,
    context: Context,
    options: OpenAiCompletionsOptions,
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

/// Streaming block currently being assembled.
enum CurrentBlock {
    Text,
    Thinking { field: String },
    ToolCall { id: String, partial_args: String },
}

async fn run(
    model: &Model,
    context: &Context,
    options: &OpenAiCompletionsOptions,
    output: &mut AssistantMessage,
    sink: &AssistantMessageSink,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    let api_key = options
        .api_key
        .clone()
        .or_else(|| get_env_api_key(&model.provider))
        .ok_or_else(|| AdapterError::msg(format!("No API key for provider: {}", model.provider)))?;

    let compat = resolve_compat(model);
    let body = build_body(model, context, options, &compat);
    if let Some(on_payload) = &options.on_payload {
        on_payload(&body);
    }

    let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));
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
            "Provider API error ({status}): {error_body}"
        )));
    }

    sink.push(AssistantMessageEvent::Start { partial: output.clone() });

    let mut current: Option<CurrentBlock> = None;
    let mut reader = SseReader::new(response, cancel.clone());

    while let Some(event) = reader.next().await? {
        let chunk: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => continue,
        };

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            let cached = usage["prompt_tokens_details"]["cached_tokens"].as_u64().unwrap_or(0);
            let reasoning_tokens = usage["completion_tokens_details"]["reasoning_tokens"]
                .as_u64()
                .unwrap_or(0);
            let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0);
            output.usage.input = prompt.saturating_sub(cached);
            output.usage.output = usage["completion_tokens"].as_u64().unwrap_or(0) + reasoning_tokens;
            output.usage.cache_read = cached;
            output.usage.cache_write = 0;
            output.usage.update_total();
            calculate_cost(model, &mut output.usage);
        }

        let Some(choice) = chunk["choices"].get(0) else { continue };

        if let Some(reason) = choice["finish_reason"].as_str() {
            output.stop_reason = map_stop_reason(reason);
        }

        let delta = &choice["delta"];
        if delta.is_null() {
            continue;
        }

        // Text content
        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            if !matches!(current, Some(CurrentBlock::Text)) {
                finish_current(&mut current, output, sink);
                current = Some(CurrentBlock::Text);
                output.content.push(AssistantContent::Text(TextContent::new("")));
                sink.push(AssistantMessageEvent::TextStart {
                    content_index: output.content.len() - 1,
                    partial: output.clone(),
                });
            }
            let index = output.content.len() - 1;
            if let Some(AssistantContent::Text(block)) = output.content.get_mut(index) {
                block.text.push_str(text);
            }
            sink.push(AssistantMessageEvent::TextDelta {
                content_index: index,
                delta: text.to_string(),
                partial: output.clone(),
            });
        }

        // Reasoning content arrives under several field names.
        let reasoning_field = ["reasoning_content", "reasoning", "reasoning_text"]
            .into_iter()
            .find(|field| delta[*field].as_str().map_or(false, |v| !v.is_empty()));
        if let Some(field) = reasoning_field {
            let text = delta[field].as_str().unwrap_or_default().to_string();
            let needs_new = !matches!(&current, Some(CurrentBlock::Thinking { field: f }) if f == field);
            if needs_new {
                finish_current(&mut current, output, sink);
                current = Some(CurrentBlock::Thinking { field: field.to_string() });
                output.content.push(AssistantContent::Thinking(ThinkingContent {
                    thinking: String::new(),
                    thinking_signature: Some(field.to_string()),
                }));
                sink.push(AssistantMessageEvent::ThinkingStart {
                    content_index: output.content.len() - 1,
                    partial: output.clone(),
                });
            }
            let index = output.content.len() - 1;
            if let Some(AssistantContent::Thinking(block)) = output.content.get_mut(index) {
                block.thinking.push_str(&text);
            }
            sink.push(AssistantMessageEvent::ThinkingDelta {
                content_index: index,
                delta: text,
                partial: output.clone(),
            });
        }

        // Tool calls
        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let tc_id = tc["id"].as_str().filter(|s| !s.is_empty());
                let tc_name = tc["function"]["name"].as_str().unwrap_or_default();
                let tc_args = tc["function"]["arguments"].as_str().unwrap_or_default();

                let continues_current = matches!(
                    &current,
                    Some(CurrentBlock::ToolCall { id, .. }) if tc_id.is_none() || tc_id == Some(id.as_str())
                );
                if !continues_current {
                    finish_current(&mut current, output, sink);
                    current = Some(CurrentBlock::ToolCall {
                        id: tc_id.unwrap_or_default().to_string(),
                        partial_args: String::new(),
                    });
                    output.content.push(AssistantContent::ToolCall(ToolCall::new(
                        tc_id.unwrap_or_default(),
                        tc_name,
                        json!({}),
                    )));
                    sink.push(AssistantMessageEvent::ToolCallStart {
                        content_index: output.content.len() - 1,
                        partial: output.clone(),
                    });
                }

                let index = output.content.len() - 1;
                let mut delta_args: Option<String> = None;
                if let (
                    Some(CurrentBlock::ToolCall { id, partial_args }),
                    Some(AssistantContent::ToolCall(block)),
                ) = (&mut current, output.content.get_mut(index))
                {
                    if let Some(new_id) = tc_id {
                        *id = new_id.to_string();
                        block.id = new_id.to_string();
                    }
                    if !tc_name.is_empty() {
                        block.name = tc_name.to_string();
                    }
                    if !tc_args.is_empty() {
                        partial_args.push_str(tc_args);
                        block.arguments = parse_streaming_json(partial_args);
                        delta_args = Some(tc_args.to_string());
                    }
                }
                if let Some(delta_args) = delta_args {
                    sink.push(AssistantMessageEvent::ToolCallDelta {
                        content_index: index,
                        delta: delta_args,
                        partial: output.clone(),
                    });
                }
            }
        }

        // Encrypted reasoning signatures attached to tool calls.
        if let Some(details) = delta["reasoning_details"].as_array() {
            for detail in details {
                if detail["type"] == "reasoning.encrypted" {
                    let (Some(id), Some(_)) = (detail["id"].as_str(), detail["data"].as_str()) else {
                        continue;
                    };
                    for block in &mut output.content {
                        if let AssistantContent::ToolCall(tc) = block {
                            if tc.id == id {
                                tc.thought_signature = Some(detail.to_string());
                            }
                        }
                    }
                }
            }
        }
    }

    finish_current(&mut current, output, sink);

    if output.stop_reason.is_terminal_failure() {
        return Err(AdapterError::msg("An unknown error occurred"));
    }

    Ok(())
}

/// Emit the end event for the block being assembled, if any.
fn finish_current(
    current: &mut Option<CurrentBlock>,
    output: &mut AssistantMessage,
    sink: &AssistantMessageSink,
) {
    let Some(block) = current.take() else { return };
    let index = output.content.len().saturating_sub(1);

    match block {
        CurrentBlock::Text => {
            let content = match output.content.get(index) {
                Some(AssistantContent::Text(t)) => t.text.clone(),
                _ => return,
            };
            sink.push(AssistantMessageEvent::TextEnd {
                content_index: index,
                content,
                partial: output.clone(),
            });
        }
        CurrentBlock::Thinking { .. } => {
            let (content, signature) = match output.content.get(index) {
                Some(AssistantContent::Thinking(t)) => {
                    (t.thinking.clone(), t.thinking_signature.clone())
                }
                _ => return,
            };
            sink.push(AssistantMessageEvent::ThinkingEnd {
                content_index: index,
                content,
                signature,
                partial: output.clone(),
            });
        }
        CurrentBlock::ToolCall { partial_args, .. } => {
            let tool_call = {
                let Some(AssistantContent::ToolCall(block)) = output.content.get_mut(index) else {
                    return;
                };
                block.arguments = match serde_json::from_str(&partial_args) {
                    Ok(value) => value,
                    Err(_) if partial_args.is_empty() => json!({}),
                    Err(_) => parse_streaming_json(&partial_args),
                };
                block.clone()
            };
            sink.push(AssistantMessageEvent::ToolCallEnd {
                content_index: index,
                tool_call,
                partial: output.clone(),
            });
        }
    }
}

/// Stream using the simple API, mapping the reasoning level to a
/// `reasoning_effort` string.
pub fn stream_simple_openai_completions(
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

    let completions = OpenAiCompletionsOptions {
        api_key: Some(api_key),
        reasoning_effort,
        ..OpenAiCompletionsOptions::from(base)
    };
    Ok(stream_openai_completions(model, context, completions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use unillm_core::model::{CompletionsCompat, InputModality, ModelCost};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model_for(provider: &str, base_url: &str) -> Model {
        Model {
            id: "gpt-4o".into(),
            name: "GPT-4o".into(),
            api: "openai-completions".into(),
            provider: provider.into(),
            base_url: base_url.into(),
            reasoning: false,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost::new(2.5, 10.0, 1.25, 0.0),
            context_window: 128_000,
            max_tokens: 16_384,
            headers: None,
            compat: None,
        }
    }

    fn chunks_body(chunks: &[&str]) -> String {
        let mut body: String = chunks.iter().map(|c| format!("data: {c}\n\n")).collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    async fn mock_completions(body: String) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
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
    async fn streams_text_and_usage() {
        let body = chunks_body(&[
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":4,"prompt_tokens_details":{"cached_tokens":2}}}"#,
        ]);
        let server = mock_completions(body).await;

        let options = OpenAiCompletionsOptions {
            api_key: Some("sk-test".into()),
            ..OpenAiCompletionsOptions::default()
        };
        let message = stream_openai_completions(
            model_for("openai", &server.uri()),
            Context {
                messages: vec![Message::user("hi")],
                ..Context::default()
            },
            options,
        )
        .result()
        .await
        .unwrap();

        assert_eq!(message.text(), "Hello");
        assert_eq!(message.stop_reason, StopReason::Stop);
        assert_eq!(message.usage.input, 8); // prompt minus cached
        assert_eq!(message.usage.cache_read, 2);
        assert_eq!(message.usage.output, 4);
    }

    #[tokio::test]
    async fn streams_split_tool_call_arguments() {
        let body = chunks_body(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"id":"call_9","function":{"name":"search","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"function":{"arguments":"{\"query\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"function":{"arguments":" \"rust\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ]);
        let server = mock_completions(body).await;

        let options = OpenAiCompletionsOptions {
            api_key: Some("sk-test".into()),
            ..OpenAiCompletionsOptions::default()
        };
        let mut stream = stream_openai_completions(
            model_for("openai", &server.uri()),
            Context {
                messages: vec![Message::user("find rust")],
                ..Context::default()
            },
            options,
        );

        let mut deltas = String::new();
        let mut ended: Option<ToolCall> = None;
        let mut reason = None;
        while let Some(event) = stream.next().await {
            match event {
                AssistantMessageEvent::ToolCallDelta { delta, .. } => deltas.push_str(&delta),
                AssistantMessageEvent::ToolCallEnd { tool_call, .. } => ended = Some(tool_call),
                AssistantMessageEvent::Done { reason: r, .. } => reason = Some(r),
                _ => {}
            }
        }

        let call = ended.expect("tool call");
        assert_eq!(call.id, "call_9");
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments, json!({"query": "rust"}));
        let reparsed: Value = serde_json::from_str(&deltas).unwrap();
        assert_eq!(reparsed, call.arguments);
        assert_eq!(reason, Some(StopReason::ToolUse));
    }

    #[tokio::test]
    async fn reasoning_content_becomes_thinking_block() {
        let body = chunks_body(&[
            r#"{"choices":[{"delta":{"reasoning_content":"hmm, "}}]}"#,
            r#"{"choices":[{"delta":{"reasoning_content":"ok"}}]}"#,
            r#"{"choices":[{"delta":{"content":"Answer"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        ]);
        let server = mock_completions(body).await;

        let options = OpenAiCompletionsOptions {
            api_key: Some("sk-test".into()),
            ..OpenAiCompletionsOptions::default()
        };
        let message = stream_openai_completions(
            model_for("openai", &server.uri()),
            Context {
                messages: vec![Message::user("hi")],
                ..Context::default()
            },
            options,
        )
        .result()
        .await
        .unwrap();

        assert_eq!(message.content.len(), 2);
        match &message.content[0] {
            AssistantContent::Thinking(t) => {
                assert_eq!(t.thinking, "hmm, ok");
                assert_eq!(t.thinking_signature.as_deref(), Some("reasoning_content"));
            }
            other => panic!("expected thinking, got {other:?}"),
        }
        assert_eq!(message.text(), "Answer");
    }

    #[tokio::test]
    async fn reasoning_effort_sent_only_when_supported() {
        let recorded: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

        for (provider, expect_effort) in [("openai", true), ("xai", false)] {
            let body = chunks_body(&[r#"{"choices":[{"delta":{"content":"ok"},"finish_reason":"stop"}]}"#]);
            let server = mock_completions(body).await;
            let mut m = model_for(provider, &server.uri());
            m.reasoning = true;

            let recorded_clone = recorded.clone();
            let options = SimpleStreamOptions {
                api_key: Some("sk-test".into()),
                reasoning: Some(unillm_core::model::ThinkingLevel::Medium),
                on_payload: Some(Arc::new(move |payload| {
                    recorded_clone.lock().unwrap().push(payload.clone());
                })),
                ..SimpleStreamOptions::default()
            };
            stream_simple_openai_completions(m, Context {
                messages: vec![Message::user("hi")],
                ..Context::default()
            }, options)
            .unwrap()
            .result()
            .await
            .unwrap();

            let payload = recorded.lock().unwrap().last().cloned().unwrap();
            assert_eq!(
                payload.get("reasoning_effort").is_some(),
                expect_effort,
                "provider {provider}"
            );
            if expect_effort {
                assert_eq!(payload["reasoning_effort"], "medium");
            }
        }
    }

    #[test]
    fn mistral_tool_ids_are_nine_alphanumerics() {
        assert_eq!(normalize_mistral_tool_id("call_123456789"), "call12345");
        assert_eq!(normalize_mistral_tool_id("ab"), "abABCDEFG");
        assert_eq!(normalize_mistral_tool_id("x!y@z#123456"), "xyz123456");
    }

    #[test]
    fn compat_detection_for_known_hosts() {
        let mistral = model_for("mistral", "https://api.mistral.ai/v1");
        let compat = resolve_compat(&mistral);
        assert!(compat.requires_mistral_tool_ids);
        assert!(compat.requires_tool_result_name);
        assert_eq!(compat.max_tokens_field, MaxTokensField::MaxTokens);

        let openai = model_for("openai", "https://api.openai.com/v1");
        let compat = resolve_compat(&openai);
        assert!(compat.supports_store);
        assert_eq!(compat.max_tokens_field, MaxTokensField::MaxCompletionTokens);

        let zai = model_for("zai", "https://api.z.ai/v1");
        assert_eq!(resolve_compat(&zai).thinking_format, ThinkingFormat::Zai);
    }

    #[test]
    fn model_compat_overrides_detection() {
        let mut m = model_for("openai", "https://api.openai.com/v1");
        m.compat = Some(CompletionsCompat {
            supports_store: Some(false),
            max_tokens_field: Some(MaxTokensField::MaxTokens),
            ..CompletionsCompat::default()
        });
        let compat = resolve_compat(&m);
        assert!(!compat.supports_store);
        assert_eq!(compat.max_tokens_field, MaxTokensField::MaxTokens);
        // Untouched fields still come from detection.
        assert!(compat.supports_developer_role);
    }

    #[test]
    fn system_prompt_uses_developer_role_for_reasoning_models() {
        let mut m = model_for("openai", "https://api.openai.com/v1");
        m.reasoning = true;
        let context = Context {
            system_prompt: Some("be brief".into()),
            messages: vec![Message::user("hi")],
            ..Context::default()
        };
        let messages = convert_messages(&m, &context, &resolve_compat(&m));
        assert_eq!(messages[0]["role"], "developer");

        m.reasoning = false;
        let messages = convert_messages(&m, &context, &resolve_compat(&m));
        assert_eq!(messages[0]["role"], "system");
    }

    #[test]
    fn empty_tools_sent_when_history_has_tool_traffic() {
        let m = model_for("openai", "https://api.openai.com/v1");
        let context = Context {
            messages: vec![
                Message::user("hi"),
                Message::Assistant(AssistantMessage {
                    content: vec![AssistantContent::ToolCall(ToolCall::new("c1", "t", json!({})))],
                    stop_reason: StopReason::ToolUse,
                    ..AssistantMessage::default()
                }),
                Message::ToolResult(unillm_core::message::ToolResultMessage {
                    tool_call_id: "c1".into(),
                    tool_name: "t".into(),
                    content: vec![ContentPart::text("done")],
                    details: None,
                    is_error: false,
                    timestamp: chrono::Utc::now(),
                }),
            ],
            ..Context::default()
        };
        let body = build_body(&m, &context, &OpenAiCompletionsOptions::default(), &resolve_compat(&m));
        assert_eq!(body["tools"], json!([]));
    }
}
