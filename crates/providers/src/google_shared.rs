//! Shared conversion and chunk processing for the Google backends
//! (Generative AI, Vertex, Gemini CLI).
//!
//! All three speak the same `GenerateContentResponse` chunk shape:
//! `candidates[0].content.parts[]` carrying text, thought-text, or
//! function calls, plus `finishReason` and `usageMetadata`. Function
//! calls arrive whole; a synthetic delta precedes each `ToolCallEnd` so
//! concatenated deltas always reproduce the final arguments.

use serde_json::{json, Value};

use unillm_core::event::{AssistantMessageEvent, AssistantMessageSink};
use unillm_core::message::{
    AssistantContent, AssistantMessage, ContentPart, Context, Message, StopReason, TextContent,
    ThinkingContent, Tool, ToolCall, UserContent,
};
use unillm_core::model::{calculate_cost, Model};

use crate::transform::{transform_messages, TransformOptions};

/// Whether a streamed Gemini part is thinking rather than text.
fn is_thinking_part(part: &Value) -> bool {
    part["thought"] == Value::Bool(true)
}

/// Preserve the last non-empty signature for the current block.
fn retain_thought_signature(existing: Option<String>, incoming: Option<&str>) -> Option<String> {
    match incoming {
        Some(sig) if !sig.is_empty() => Some(sig.to_string()),
        _ => existing,
    }
}

/// Thought signatures must be base64 for Google APIs.
fn is_valid_thought_signature(signature: &str) -> bool {
    !signature.is_empty()
        && signature.len() % 4 == 0
        && signature
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

fn resolve_thought_signature(same_provider_and_model: bool, signature: Option<&str>) -> Option<String> {
    signature
        .filter(|sig| same_provider_and_model && is_valid_thought_signature(sig))
        .map(str::to_string)
}

/// Models routed through Google APIs that need explicit tool-call IDs.
fn requires_tool_call_id(model_id: &str) -> bool {
    model_id.starts_with("claude-") || model_id.starts_with("gpt-oss-")
}

/// Convert internal messages to Gemini `Content[]` format.
pub(crate) fn convert_messages(model: &Model, context: &Context) -> Vec<Value> {
    let normalize = |id: &str| {
        if !requires_tool_call_id(&model.id) {
            return id.to_string();
        }
        id.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .take(64)
            .collect()
    };
    let transformed = transform_messages(
        &context.messages,
        &TransformOptions {
            current_model: Some(&model.id),
            normalize_tool_id: Some(&normalize),
            convert_thinking_to_text: false,
        },
    );

    let mut contents: Vec<Value> = Vec::new();

    for msg in &transformed {
        match msg {
            Message::User(user) => {
                let mut parts: Vec<Value> = Vec::new();
                match &user.content {
                    UserContent::Text(text) => parts.push(json!({"text": text})),
                    UserContent::Blocks(blocks) => {
                        for block in blocks {
                            match block {
                                ContentPart::Text(t) => parts.push(json!({"text": t.text})),
                                ContentPart::Image(img) if model.supports_images() => {
                                    parts.push(json!({
                                        "inlineData": {"mimeType": img.mime_type, "data": img.data},
                                    }));
                                }
                                ContentPart::Image(_) => {}
                            }
                        }
                    }
                }
                if !parts.is_empty() {
                    contents.push(json!({"role": "user", "parts": parts}));
                }
            }

            Message::Assistant(assistant) => {
                let same = assistant.provider == model.provider && assistant.model == model.id;
                let is_gemini3 = model.id.to_lowercase().contains("gemini-3");
                let mut parts: Vec<Value> = Vec::new();

                for block in &assistant.content {
                    match block {
                        AssistantContent::Text(text) => {
                            if text.text.trim().is_empty() {
                                continue;
                            }
                            let mut part = json!({"text": text.text});
                            if let Some(sig) =
                                resolve_thought_signature(same, text.text_signature.as_deref())
                            {
                                part["thoughtSignature"] = json!(sig);
                            }
                            parts.push(part);
                        }
                        AssistantContent::Thinking(thinking) => {
                            if thinking.thinking.trim().is_empty() {
                                continue;
                            }
                            if same {
                                let mut part = json!({"thought": true, "text": thinking.thinking});
                                if let Some(sig) = resolve_thought_signature(
                                    same,
                                    thinking.thinking_signature.as_deref(),
                                ) {
                                    part["thoughtSignature"] = json!(sig);
                                }
                                parts.push(part);
                            } else {
                                parts.push(json!({"text": thinking.thinking}));
                            }
                        }
                        AssistantContent::ToolCall(tc) => {
                            let sig = resolve_thought_signature(same, tc.thought_signature.as_deref());
                            if is_gemini3 && sig.is_none() {
                                // Gemini 3 rejects unsigned replayed calls;
                                // describe them instead.
                                parts.push(json!({
                                    "text": format!(
                                        "[Historical context: a different model called tool \"{}\" with arguments: {}. Do not mimic this format - use proper function calling.]",
                                        tc.name, tc.arguments
                                    ),
                                }));
                            } else {
                                let mut fc = json!({
                                    "functionCall": {"name": tc.name, "args": tc.arguments},
                                });
                                if requires_tool_call_id(&model.id) {
                                    fc["functionCall"]["id"] = json!(tc.id);
                                }
                                if let Some(sig) = sig {
                                    fc["thoughtSignature"] = json!(sig);
                                }
                                parts.push(fc);
                            }
                        }
                    }
                }

                if !parts.is_empty() {
                    contents.push(json!({"role": "model", "parts": parts}));
                }
            }

            Message::ToolResult(tool_result) => {
                let text = tool_result.text();
                let images: Vec<Value> = if model.supports_images() {
                    tool_result
                        .content
                        .iter()
                        .filter_map(|c| match c {
                            ContentPart::Image(img) => Some(json!({
                                "inlineData": {"mimeType": img.mime_type, "data": img.data},
                            })),
                            ContentPart::Text(_) => None,
                        })
                        .collect()
                } else {
                    Vec::new()
                };

                let has_images = !images.is_empty();
                let supports_multimodal_fn = model.id.contains("gemini-3");
                let response_value = if !text.is_empty() {
                    text.clone()
                } else if has_images {
                    "(see attached image)".to_string()
                } else {
                    String::new()
                };

                let mut fn_response = json!({
                    "name": tool_result.tool_name,
                    "response": if tool_result.is_error {
                        json!({"error": response_value})
                    } else {
                        json!({"output": response_value})
                    },
                });
                if has_images && supports_multimodal_fn {
                    fn_response["parts"] = json!(images.clone());
                }
                if requires_tool_call_id(&model.id) {
                    fn_response["id"] = json!(tool_result.tool_call_id);
                }
                let part = json!({"functionResponse": fn_response});

                // Consecutive function responses share one user content.
                let appended = match contents.last_mut() {
                    Some(last)
                        if last["role"] == "user"
                            && last["parts"]
                                .as_array()
                                .is_some_and(|parts| parts.iter().any(|p| p.get("functionResponse").is_some())) =>
                    {
                        last["parts"].as_array_mut().map(|parts| parts.push(part.clone()));
                        true
                    }
                    _ => false,
                };
                if !appended {
                    contents.push(json!({"role": "user", "parts": [part]}));
                }

                if has_images && !supports_multimodal_fn {
                    let mut parts = vec![json!({"text": "Tool result image:"})];
                    parts.extend(images);
                    contents.push(json!({"role": "user", "parts": parts}));
                }
            }
        }
    }

    contents
}

/// Convert tools to Gemini function declarations.
pub(crate) fn convert_tools(tools: &[Tool]) -> Value {
    let declarations: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            })
        })
        .collect();
    json!([{"functionDeclarations": declarations}])
}

/// Map a Gemini `FinishReason` to a stop reason.
pub(crate) fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "STOP" => StopReason::Stop,
        "MAX_TOKENS" => StopReason::Length,
        _ => StopReason::Error,
    }
}

/// Thinking request configuration shared by the Google adapters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoogleThinking {
    pub enabled: bool,
    /// Token budget for 2.x-generation models; `-1` means dynamic.
    pub budget_tokens: Option<i64>,
    /// `thinkingLevel` for 3.x-generation models.
    pub level: Option<String>,
}

/// Build the camelCase `generationConfig` for a request.
pub(crate) fn build_generation_config(
    model: &Model,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    thinking: &GoogleThinking,
) -> Value {
    let mut config = json!({});
    if let Some(temperature) = temperature {
        config["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = max_tokens {
        config["maxOutputTokens"] = json!(max_tokens);
    }
    if thinking.enabled && model.reasoning {
        let mut thinking_config = json!({"includeThoughts": true});
        if let Some(level) = &thinking.level {
            thinking_config["thinkingLevel"] = json!(level);
        } else if let Some(budget) = thinking.budget_tokens {
            thinking_config["thinkingBudget"] = json!(budget);
        }
        config["thinkingConfig"] = thinking_config;
    }
    config
}

/// Incremental state for one Gemini chunk stream.
///
/// Gemini interleaves thinking and text parts within candidates and sends
/// function calls whole; this tracks the open text/thinking block and
/// closes it when the part kind flips.
pub(crate) struct GoogleStreamProcessor {
    current: Option<OpenBlock>,
}

enum OpenBlock {
    Text,
    Thinking,
}

impl GoogleStreamProcessor {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// Apply one `GenerateContentResponse` chunk. Returns whether any
    /// content arrived.
    pub fn process_chunk(
        &mut self,
        chunk: &Value,
        model: &Model,
        output: &mut AssistantMessage,
        sink: &AssistantMessageSink,
    ) -> bool {
        let mut has_content = false;

        if let Some(candidate) = chunk["candidates"].get(0) {
            if let Some(parts) = candidate["content"]["parts"].as_array() {
                for part in parts {
                    if let Some(text) = part["text"].as_str() {
                        has_content = true;
                        self.apply_text_part(part, text, output, sink);
                    }

                    if part.get("functionCall").is_some() {
                        has_content = true;
                        self.finish_open_block(output, sink);
                        self.apply_function_call(part, output, sink);
                    }
                }
            }

            if let Some(reason) = candidate["finishReason"].as_str() {
                let reason = reason.rsplit('.').next().unwrap_or(reason);
                output.stop_reason = map_finish_reason(reason);
                let has_tool_calls = output
                    .content
                    .iter()
                    .any(|b| matches!(b, AssistantContent::ToolCall(_)));
                if has_tool_calls {
                    output.stop_reason = StopReason::ToolUse;
                }
            }
        }

        if let Some(usage) = chunk.get("usageMetadata").filter(|u| !u.is_null()) {
            output.usage.input = usage["promptTokenCount"].as_u64().unwrap_or(0);
            output.usage.output = usage["candidatesTokenCount"].as_u64().unwrap_or(0)
                + usage["thoughtsTokenCount"].as_u64().unwrap_or(0);
            output.usage.cache_read = usage["cachedContentTokenCount"].as_u64().unwrap_or(0);
            output.usage.cache_write = 0;
            output.usage.total_tokens = usage["totalTokenCount"].as_u64().unwrap_or(0);
            calculate_cost(model, &mut output.usage);
        }

        has_content
    }

    fn apply_text_part(
        &mut self,
        part: &Value,
        text: &str,
        output: &mut AssistantMessage,
        sink: &AssistantMessageSink,
    ) {
        let is_thinking = is_thinking_part(part);
        let continues = matches!(
            (&self.current, is_thinking),
            (Some(OpenBlock::Thinking), true) | (Some(OpenBlock::Text), false)
        );
        if !continues {
            self.finish_open_block(output, sink);
            if is_thinking {
                self.current = Some(OpenBlock::Thinking);
                output
                    .content
                    .push(AssistantContent::Thinking(ThinkingContent::default()));
                sink.push(AssistantMessageEvent::ThinkingStart {
                    content_index: output.content.len() - 1,
                    partial: output.clone(),
                });
            } else {
                self.current = Some(OpenBlock::Text);
                output.content.push(AssistantContent::Text(TextContent::new("")));
                sink.push(AssistantMessageEvent::TextStart {
                    content_index: output.content.len() - 1,
                    partial: output.clone(),
                });
            }
        }

        let index = output.content.len() - 1;
        let signature = part["thoughtSignature"].as_str();
        let mut applied_thinking = false;
        let mut applied_text = false;
        match output.content.get_mut(index) {
            Some(AssistantContent::Thinking(block)) => {
                block.thinking.push_str(text);
                block.thinking_signature =
                    retain_thought_signature(block.thinking_signature.take(), signature);
                applied_thinking = true;
            }
            Some(AssistantContent::Text(block)) => {
                block.text.push_str(text);
                block.text_signature =
                    retain_thought_signature(block.text_signature.take(), signature);
                applied_text = true;
            }
            _ => {}
        }
        if applied_thinking {
            sink.push(AssistantMessageEvent::ThinkingDelta {
                content_index: index,
                delta: text.to_string(),
                partial: output.clone(),
            });
        } else if applied_text {
            sink.push(AssistantMessageEvent::TextDelta {
                content_index: index,
                delta: text.to_string(),
                partial: output.clone(),
            });
        }
    }

    fn apply_function_call(
        &mut self,
        part: &Value,
        output: &mut AssistantMessage,
        sink: &AssistantMessageSink,
    ) {
        let fc = &part["functionCall"];
        let name = fc["name"].as_str().unwrap_or_default();
        let provided_id = fc["id"].as_str().filter(|id| !id.is_empty());

        // Reused or missing IDs get a synthesized unique one.
        let needs_new = provided_id.map_or(true, |id| {
            output
                .content
                .iter()
                .any(|b| matches!(b, AssistantContent::ToolCall(tc) if tc.id == id))
        });
        let id = if needs_new {
            format!("{name}_{}", uuid::Uuid::new_v4().simple())
        } else {
            provided_id.unwrap_or_default().to_string()
        };

        let arguments = fc.get("args").cloned().unwrap_or_else(|| json!({}));
        let mut tool_call = ToolCall::new(id, name, arguments);
        tool_call.thought_signature = part["thoughtSignature"].as_str().map(str::to_string);

        output.content.push(AssistantContent::ToolCall(tool_call.clone()));
        let index = output.content.len() - 1;
        sink.push(AssistantMessageEvent::ToolCallStart {
            content_index: index,
            partial: output.clone(),
        });
        // Whole-call arrival: one synthetic delta carries the serialized
        // arguments so delta concatenation stays faithful.
        sink.push(AssistantMessageEvent::ToolCallDelta {
            content_index: index,
            delta: tool_call.arguments.to_string(),
            partial: output.clone(),
        });
        sink.push(AssistantMessageEvent::ToolCallEnd {
            content_index: index,
            tool_call,
            partial: output.clone(),
        });
    }

    /// Close the open text/thinking block, if any.
    pub fn finish_open_block(&mut self, output: &mut AssistantMessage, sink: &AssistantMessageSink) {
        let Some(open) = self.current.take() else { return };
        let index = output.content.len().saturating_sub(1);
        match open {
            OpenBlock::Text => {
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
            OpenBlock::Thinking => {
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
        }
    }
}
