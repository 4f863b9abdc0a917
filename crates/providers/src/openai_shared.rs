//! Shared conversion and stream processing for OpenAI Responses API
//! backends (OpenAI, Azure, Codex).
//!
//! Responses streams carry `response.*` events; tool-call IDs are the
//! composite `call_id|item_id` so a later request can replay both halves.
//! Reasoning items round-trip through `thinking_signature` as serialized
//! JSON.

use serde_json::{json, Value};

use unillm_core::event::{AssistantMessageEvent, AssistantMessageSink};
use unillm_core::json::parse_streaming_json;
use unillm_core::message::{
    AssistantContent, AssistantMessage, ContentPart, Context, Message, StopReason, TextContent,
    ThinkingContent, Tool, ToolCall, UserContent,
};
use unillm_core::model::{calculate_cost, Model};

use crate::adapter::AdapterError;
use crate::sse::SseReader;
use crate::transform::{transform_messages, TransformOptions};

/// Providers whose composite tool-call IDs get sanitized on replay.
pub(crate) const OPENAI_TOOL_CALL_PROVIDERS: &[&str] = &["openai", "openai-codex", "opencode"];

/// GitHub Copilot wants to know who initiated a call and whether images
/// are involved.
pub(crate) fn copilot_headers(context: &Context) -> Vec<(&'static str, String)> {
    let is_agent_call = context
        .messages
        .last()
        .map(|m| m.role() != "user")
        .unwrap_or(false);
    let mut headers = vec![
        ("X-Initiator", if is_agent_call { "agent" } else { "user" }.to_string()),
        ("Openai-Intent", "conversation-edits".to_string()),
    ];

    let has_images = context.messages.iter().any(|m| match m {
        Message::User(u) => matches!(
            &u.content,
            UserContent::Blocks(blocks) if blocks.iter().any(|b| matches!(b, ContentPart::Image(_)))
        ),
        Message::ToolResult(tr) => tr.content.iter().any(|b| matches!(b, ContentPart::Image(_))),
        Message::Assistant(_) => false,
    });
    if has_images {
        headers.push(("Copilot-Vision-Request", "true".to_string()));
    }
    headers
}

/// Fast deterministic hash to shorten overlong message IDs.
fn short_hash(s: &str) -> String {
    let mut h1: u32 = 0xDEAD_BEEF;
    let mut h2: u32 = 0x41C6_CE57;
    for c in s.chars() {
        let c = c as u32;
        h1 = (h1 ^ c).wrapping_mul(2_654_435_761);
        h2 = (h2 ^ c).wrapping_mul(1_597_334_677);
    }
    h1 = (h1 ^ (h1 >> 16)).wrapping_mul(2_246_822_507) ^ (h2 ^ (h2 >> 13)).wrapping_mul(3_266_489_909);
    h2 = (h2 ^ (h2 >> 16)).wrapping_mul(2_246_822_507) ^ (h1 ^ (h1 >> 13)).wrapping_mul(3_266_489_909);
    format!("{}{}", to_base36(h2), to_base36(h1))
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn sanitize_id_part(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn normalize_composite_id(id: &str) -> String {
    let Some((call_id, item_id)) = id.split_once('|') else {
        return id.to_string();
    };
    let call_id = sanitize_id_part(call_id);
    let mut item_id = sanitize_id_part(item_id);
    if !item_id.starts_with("fc") {
        item_id = format!("fc_{item_id}");
    }
    let call_id: String = call_id.chars().take(64).collect();
    let item_id: String = item_id.chars().take(64).collect();
    format!(
        "{}|{}",
        call_id.trim_end_matches('_'),
        item_id.trim_end_matches('_')
    )
}

/// Convert internal messages to Responses API `input` items.
pub(crate) fn convert_responses_messages(
    model: &Model,
    context: &Context,
    allowed_tool_call_providers: &[&str],
    include_system_prompt: bool,
) -> Vec<Value> {
    let provider_allowed = allowed_tool_call_providers.contains(&model.provider.as_str());
    let normalize = |id: &str| {
        if provider_allowed {
            normalize_composite_id(id)
        } else {
            id.to_string()
        }
    };
    let transformed = transform_messages(
        &context.messages,
        &TransformOptions {
            current_model: Some(&model.id),
            normalize_tool_id: Some(&normalize),
            convert_thinking_to_text: false,
        },
    );

    let mut items: Vec<Value> = Vec::new();

    if include_system_prompt {
        if let Some(system) = &context.system_prompt {
            let role = if model.reasoning { "developer" } else { "system" };
            items.push(json!({"role": role, "content": system}));
        }
    }

    for (msg_index, msg) in transformed.iter().enumerate() {
        match msg {
            Message::User(user) => {
                let mut content: Vec<Value> = Vec::new();
                match &user.content {
                    UserContent::Text(text) => {
                        content.push(json!({"type": "input_text", "text": text}));
                    }
                    UserContent::Blocks(blocks) => {
                        for block in blocks {
                            match block {
                                ContentPart::Text(t) => {
                                    content.push(json!({"type": "input_text", "text": t.text}));
                                }
                                ContentPart::Image(img) if model.supports_images() => {
                                    content.push(json!({
                                        "type": "input_image",
                                        "detail": "auto",
                                        "image_url": format!("data:{};base64,{}", img.mime_type, img.data),
                                    }));
                                }
                                ContentPart::Image(_) => {}
                            }
                        }
                    }
                }
                if !content.is_empty() {
                    items.push(json!({"role": "user", "content": content}));
                }
            }

            Message::Assistant(assistant) => {
                let is_different_model = assistant.model != model.id
                    && assistant.provider == model.provider
                    && assistant.api == model.api;

                for block in &assistant.content {
                    match block {
                        AssistantContent::Thinking(thinking) => {
                            // Reasoning items round-trip verbatim via the
                            // serialized signature.
                            if let Some(signature) = &thinking.thinking_signature {
                                if let Ok(item) = serde_json::from_str::<Value>(signature) {
                                    items.push(item);
                                }
                            }
                        }
                        AssistantContent::Text(text) => {
                            let msg_id = match text.text_signature.as_deref() {
                                None | Some("") => format!("msg_{msg_index}"),
                                Some(id) if id.len() > 64 => format!("msg_{}", short_hash(id)),
                                Some(id) => id.to_string(),
                            };
                            items.push(json!({
                                "type": "message",
                                "role": "assistant",
                                "content": [{
                                    "type": "output_text",
                                    "text": text.text,
                                    "annotations": [],
                                }],
                                "status": "completed",
                                "id": msg_id,
                            }));
                        }
                        AssistantContent::ToolCall(tc) => {
                            let (call_id, item_id) = match tc.id.split_once('|') {
                                Some((call, item)) => (call.to_string(), Some(item.to_string())),
                                None => (tc.id.clone(), None),
                            };
                            let item_id = item_id.filter(|id| {
                                !(is_different_model && id.starts_with("fc_"))
                            });
                            items.push(json!({
                                "type": "function_call",
                                "id": item_id,
                                "call_id": call_id,
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }));
                        }
                    }
                }
            }

            Message::ToolResult(tool_result) => {
                let text = tool_result.text();
                let call_id = tool_result
                    .tool_call_id
                    .split('|')
                    .next()
                    .unwrap_or_default();
                items.push(json!({
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": if text.is_empty() { "(see attached image)" } else { &text },
                }));

                let images: Vec<&unillm_core::message::ImageContent> = tool_result
                    .content
                    .iter()
                    .filter_map(|c| match c {
                        ContentPart::Image(img) => Some(img),
                        ContentPart::Text(_) => None,
                    })
                    .collect();
                if !images.is_empty() && model.supports_images() {
                    let mut content =
                        vec![json!({"type": "input_text", "text": "Attached image(s) from tool result:"})];
                    for img in images {
                        content.push(json!({
                            "type": "input_image",
                            "detail": "auto",
                            "image_url": format!("data:{};base64,{}", img.mime_type, img.data),
                        }));
                    }
                    items.push(json!({"role": "user", "content": content}));
                }
            }
        }
    }

    items
}

/// Convert tools to Responses function format.
pub(crate) fn convert_responses_tools(tools: &[Tool], strict: bool) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
                "strict": strict,
            })
        })
        .collect()
}

/// Map a Responses API terminal status to a stop reason.
pub(crate) fn map_responses_stop_reason(status: Option<&str>) -> StopReason {
    match status {
        Some("incomplete") => StopReason::Length,
        Some("failed") | Some("cancelled") => StopReason::Error,
        _ => StopReason::Stop,
    }
}

/// Cost multiplier for OpenAI service tiers.
pub(crate) fn apply_service_tier_pricing(output: &mut AssistantMessage, service_tier: Option<&str>) {
    let multiplier = match service_tier {
        Some("flex") => 0.5,
        Some("priority") => 2.0,
        _ => return,
    };
    let cost = &mut output.usage.cost;
    cost.input *= multiplier;
    cost.output *= multiplier;
    cost.cache_read *= multiplier;
    cost.cache_write *= multiplier;
    cost.total = cost.input + cost.output + cost.cache_read + cost.cache_write;
}

/// Process a Responses API SSE stream, pushing normalized events.
pub(crate) async fn process_responses_stream(
    reader: &mut SseReader,
    model: &Model,
    output: &mut AssistantMessage,
    sink: &AssistantMessageSink,
    service_tier: Option<&str>,
    tier_pricing: bool,
) -> Result<(), AdapterError> {
    // Argument accumulation for the function call being streamed.
    let mut partial_args = String::new();

    while let Some(event) = reader.next().await? {
        let data: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => continue,
        };

        match data["type"].as_str().unwrap_or_default() {
            "response.output_item.added" => {
                let item = &data["item"];
                match item["type"].as_str().unwrap_or_default() {
                    "reasoning" => {
                        output
                            .content
                            .push(AssistantContent::Thinking(ThinkingContent::default()));
                        sink.push(AssistantMessageEvent::ThinkingStart {
                            content_index: output.content.len() - 1,
                            partial: output.clone(),
                        });
                    }
                    "message" => {
                        let mut text = TextContent::new("");
                        text.text_signature = item["id"].as_str().map(str::to_string);
                        output.content.push(AssistantContent::Text(text));
                        sink.push(AssistantMessageEvent::TextStart {
                            content_index: output.content.len() - 1,
                            partial: output.clone(),
                        });
                    }
                    "function_call" => {
                        let call_id = item["call_id"].as_str().unwrap_or_default();
                        let item_id = item["id"].as_str().unwrap_or_default();
                        let name = item["name"].as_str().unwrap_or_default();
                        partial_args = item["arguments"].as_str().unwrap_or_default().to_string();
                        output.content.push(AssistantContent::ToolCall(ToolCall::new(
                            format!("{call_id}|{item_id}"),
                            name,
                            json!({}),
                        )));
                        sink.push(AssistantMessageEvent::ToolCallStart {
                            content_index: output.content.len() - 1,
                            partial: output.clone(),
                        });
                    }
                    _ => {}
                }
            }

            "response.reasoning_summary_text.delta" => {
                push_thinking_delta(output, sink, data["delta"].as_str().unwrap_or_default());
            }

            "response.reasoning_summary_part.done" => {
                // Summary parts are separated by blank lines.
                push_thinking_delta(output, sink, "\n\n");
            }

            "response.output_text.delta" | "response.refusal.delta" => {
                let delta = data["delta"].as_str().unwrap_or_default().to_string();
                if delta.is_empty() {
                    continue;
                }
                let index = output.content.len().saturating_sub(1);
                let mut applied = false;
                if let Some(AssistantContent::Text(block)) = output.content.get_mut(index) {
                    block.text.push_str(&delta);
                    applied = true;
                }
                if applied {
                    sink.push(AssistantMessageEvent::TextDelta {
                        content_index: index,
                        delta,
                        partial: output.clone(),
                    });
                }
            }

            "response.function_call_arguments.delta" => {
                let delta = data["delta"].as_str().unwrap_or_default().to_string();
                if delta.is_empty() {
                    continue;
                }
                partial_args.push_str(&delta);
                let snapshot = parse_streaming_json(&partial_args);
                let index = output.content.len().saturating_sub(1);
                let mut applied = false;
                if let Some(AssistantContent::ToolCall(block)) = output.content.get_mut(index) {
                    block.arguments = snapshot;
                    applied = true;
                }
                if applied {
                    sink.push(AssistantMessageEvent::ToolCallDelta {
                        content_index: index,
                        delta,
                        partial: output.clone(),
                    });
                }
            }

            "response.function_call_arguments.done" => {
                if let Some(args) = data["arguments"].as_str() {
                    partial_args = args.to_string();
                }
            }

            "response.output_item.done" => {
                let item = &data["item"];
                let index = output.content.len().saturating_sub(1);
                match item["type"].as_str().unwrap_or_default() {
                    "reasoning" => {
                        let summary_parts: Vec<String> = item["summary"]
                            .as_array()
                            .map(|parts| {
                                parts
                                    .iter()
                                    .filter_map(|p| p["text"].as_str().map(str::to_string))
                                    .collect()
                            })
                            .unwrap_or_default();
                        let thinking_text = summary_parts.join("\n\n");
                        let signature = json!({
                            "type": "reasoning",
                            "id": item["id"],
                            "summary": item["summary"].as_array().cloned().unwrap_or_default(),
                        })
                        .to_string();

                        let mut finished = None;
                        if let Some(AssistantContent::Thinking(block)) = output.content.get_mut(index) {
                            block.thinking = thinking_text.clone();
                            block.thinking_signature = Some(signature.clone());
                            finished = Some(());
                        }
                        if finished.is_some() {
                            sink.push(AssistantMessageEvent::ThinkingEnd {
                                content_index: index,
                                content: thinking_text,
                                signature: Some(signature),
                                partial: output.clone(),
                            });
                        }
                    }
                    "message" => {
                        let text: String = item["content"]
                            .as_array()
                            .map(|parts| {
                                parts
                                    .iter()
                                    .map(|c| {
                                        if c["type"] == "output_text" {
                                            c["text"].as_str().unwrap_or_default()
                                        } else {
                                            c["refusal"].as_str().unwrap_or_default()
                                        }
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        let mut finished = false;
                        if let Some(AssistantContent::Text(block)) = output.content.get_mut(index) {
                            block.text = text.clone();
                            block.text_signature = item["id"].as_str().map(str::to_string);
                            finished = true;
                        }
                        if finished {
                            sink.push(AssistantMessageEvent::TextEnd {
                                content_index: index,
                                content: text,
                                partial: output.clone(),
                            });
                        }
                    }
                    "function_call" => {
                        let raw = if partial_args.is_empty() {
                            item["arguments"].as_str().unwrap_or_default().to_string()
                        } else {
                            std::mem::take(&mut partial_args)
                        };
                        let arguments: Value = serde_json::from_str(&raw)
                            .unwrap_or_else(|_| parse_streaming_json(&raw));

                        let call_id = item["call_id"].as_str().unwrap_or_default();
                        let item_id = item["id"].as_str().unwrap_or_default();
                        let name = item["name"].as_str().unwrap_or_default();

                        let mut tool_call = None;
                        if let Some(AssistantContent::ToolCall(block)) = output.content.get_mut(index) {
                            block.id = format!("{call_id}|{item_id}");
                            block.name = name.to_string();
                            block.arguments = arguments;
                            tool_call = Some(block.clone());
                        }
                        if let Some(tool_call) = tool_call {
                            sink.push(AssistantMessageEvent::ToolCallEnd {
                                content_index: index,
                                tool_call,
                                partial: output.clone(),
                            });
                        }
                    }
                    _ => {}
                }
            }

            // The ChatGPT backend says `response.done`; same payload.
            "response.completed" | "response.done" => {
                let response = &data["response"];
                if let Some(usage) = response.get("usage").filter(|u| !u.is_null()) {
                    let input = usage["input_tokens"].as_u64().unwrap_or(0);
                    let cached = usage["input_tokens_details"]["cached_tokens"].as_u64().unwrap_or(0);
                    output.usage.input = input.saturating_sub(cached);
                    output.usage.output = usage["output_tokens"].as_u64().unwrap_or(0);
                    output.usage.cache_read = cached;
                    output.usage.cache_write = 0;
                    output.usage.total_tokens = usage["total_tokens"].as_u64().unwrap_or(0);
                    calculate_cost(model, &mut output.usage);
                }

                if tier_pricing {
                    let tier = response["service_tier"].as_str().or(service_tier);
                    apply_service_tier_pricing(output, tier);
                }

                output.stop_reason = map_responses_stop_reason(response["status"].as_str());
                let has_tool_calls = output
                    .content
                    .iter()
                    .any(|b| matches!(b, AssistantContent::ToolCall(_)));
                if has_tool_calls && output.stop_reason == StopReason::Stop {
                    output.stop_reason = StopReason::ToolUse;
                }
            }

            "error" => {
                let code = data["code"].as_str().unwrap_or_default();
                let message = data["message"].as_str().unwrap_or_default();
                return Err(AdapterError::msg(if message.is_empty() {
                    "Unknown error".to_string()
                } else {
                    format!("Error Code {code}: {message}")
                }));
            }

            "response.failed" => {
                let message = data["response"]["error"]["message"]
                    .as_str()
                    .filter(|m| !m.is_empty())
                    .unwrap_or("Unknown error");
                return Err(AdapterError::msg(message));
            }

            _ => {}
        }
    }

    Ok(())
}

fn push_thinking_delta(output: &mut AssistantMessage, sink: &AssistantMessageSink, delta: &str) {
    if delta.is_empty() {
        return;
    }
    let index = output.content.len().saturating_sub(1);
    let mut applied = false;
    if let Some(AssistantContent::Thinking(block)) = output.content.get_mut(index) {
        block.thinking.push_str(delta);
        applied = true;
    }
    if applied {
        sink.push(AssistantMessageEvent::ThinkingDelta {
            content_index: index,
            delta: delta.to_string(),
            partial: output.clone(),
        });
    }
}
