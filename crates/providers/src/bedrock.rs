//! Amazon Bedrock Converse Stream adapter.
//!
//! Built on the AWS SDK: credentials come from the standard chain
//! (profile, env, IMDS, web identity) and SigV4 plus the binary
//! eventstream framing are the SDK's problem. This adapter translates
//! between `Context` and the Converse types, and maps stream events into
//! the normalized vocabulary. Claude models on Bedrock take Anthropic
//! thinking budgets through `additionalModelRequestFields`.

use std::collections::HashMap;

use aws_sdk_bedrockruntime::types as bedrock;
use base64::Engine;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use unillm_core::event::{
    assistant_message_channel, AssistantMessageEvent, AssistantMessageSink, AssistantMessageStream,
};
use unillm_core::json::parse_streaming_json;
use unillm_core::message::{
    AssistantContent, AssistantMessage, ContentPart, Context, Message, StopReason, TextContent,
    ThinkingContent, ToolCall, UserContent,
};
use unillm_core::model::{calculate_cost, Model, ThinkingLevel};
use unillm_core::provider::{PayloadHook, SimpleStreamOptions, ThinkingBudgets};

use crate::adapter::{check_cancel, finish_stream, new_output, AdapterError};
use crate::options::{adjust_max_tokens_for_thinking, build_base_options, clamp_reasoning};
use crate::transform::{transform_messages, TransformOptions};

/// Extended options for the Bedrock adapter.
#[derive(Clone, Default)]
pub struct BedrockOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub session_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub on_payload: Option<PayloadHook>,
    pub tool_choice: Option<Value>,
    pub reasoning: Option<ThinkingLevel>,
    pub thinking_budgets: Option<ThinkingBudgets>,
    pub interleaved_thinking: bool,
}

fn normalize_tool_call_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(64)
        .collect()
}

fn supports_adaptive_thinking(model_id: &str) -> bool {
    model_id.contains("opus-4-6") || model_id.contains("opus-4.6")
}

fn is_bedrock_claude(model_id: &str) -> bool {
    model_id.contains("anthropic.claude") || model_id.contains("anthropic/claude")
}

fn supports_thinking_signature(model_id: &str) -> bool {
    is_bedrock_claude(model_id)
}

fn map_stop_reason(reason: &bedrock::StopReason) -> StopReason {
    match reason {
        bedrock::StopReason::EndTurn | bedrock::StopReason::StopSequence => StopReason::Stop,
        bedrock::StopReason::MaxTokens => StopReason::Length,
        bedrock::StopReason::ToolUse => StopReason::ToolUse,
        _ => StopReason::Error,
    }
}

fn map_effort(level: ThinkingLevel) -> &'static str {
    match level {
        ThinkingLevel::Minimal | ThinkingLevel::Low => "low",
        ThinkingLevel::Medium => "medium",
        ThinkingLevel::High | ThinkingLevel::Off => "high",
        ThinkingLevel::Xhigh => "max",
    }
}

fn anthropic_budget(level: ThinkingLevel) -> u32 {
    match level {
        ThinkingLevel::Off => 0,
        ThinkingLevel::Minimal => 1024,
        ThinkingLevel::Low => 2048,
        ThinkingLevel::Medium => 4096,
        ThinkingLevel::High | ThinkingLevel::Xhigh => 8192,
    }
}

/// serde_json → smithy Document.
fn value_to_document(value: &Value) -> aws_smithy_types::Document {
    use aws_smithy_types::{Document, Number};
    match value {
        Value::Null => Document::Null,
        Value::Bool(b) => Document::Bool(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Document::Number(Number::PosInt(u))
            } else if let Some(i) = n.as_i64() {
                Document::Number(Number::NegInt(i))
            } else {
                Document::Number(Number::Float(n.as_f64().unwrap_or(0.0)))
            }
        }
        Value::String(s) => Document::String(s.clone()),
        Value::Array(items) => Document::Array(items.iter().map(value_to_document).collect()),
        Value::Object(map) => Document::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_document(v)))
                .collect(),
        ),
    }
}

fn image_block(mime_type: &str, data_b64: &str) -> Result<bedrock::ImageBlock, AdapterError> {
    let format = match mime_type {
        "image/jpeg" | "image/jpg" => bedrock::ImageFormat::Jpeg,
        "image/png" => bedrock::ImageFormat::Png,
        "image/gif" => bedrock::ImageFormat::Gif,
        "image/webp" => bedrock::ImageFormat::Webp,
        other => return Err(AdapterError::msg(format!("Unknown image type: {other}"))),
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data_b64)
        .map_err(|e| AdapterError::msg(format!("Invalid image payload: {e}")))?;
    bedrock::ImageBlock::builder()
        .format(format)
        .source(bedrock::ImageSource::Bytes(aws_smithy_types::Blob::new(bytes)))
        .build()
        .map_err(|e| AdapterError::msg(format!("Failed to build image block: {e}")))
}

fn convert_messages(model: &Model, context: &Context) -> Result<Vec<bedrock::Message>, AdapterError> {
    let normalize = |id: &str| normalize_tool_call_id(id);
    let transformed = transform_messages(
        &context.messages,
        &TransformOptions {
            current_model: Some(&model.id),
            normalize_tool_id: Some(&normalize),
            convert_thinking_to_text: false,
        },
    );

    let mut result: Vec<bedrock::Message> = Vec::new();
    let mut i = 0;
    while i < transformed.len() {
        match &transformed[i] {
            Message::User(user) => {
                let mut blocks: Vec<bedrock::ContentBlock> = Vec::new();
                match &user.content {
                    UserContent::Text(text) => {
                        blocks.push(bedrock::ContentBlock::Text(text.clone()));
                    }
                    UserContent::Blocks(parts) => {
                        for part in parts {
                            match part {
                                ContentPart::Text(t) => {
                                    blocks.push(bedrock::ContentBlock::Text(t.text.clone()));
                                }
                                ContentPart::Image(img) if model.supports_images() => {
                                    blocks.push(bedrock::ContentBlock::Image(image_block(
                                        &img.mime_type,
                                        &img.data,
                                    )?));
                                }
                                ContentPart::Image(_) => {}
                            }
                        }
                    }
                }
                if blocks.is_empty() {
                    i += 1;
                    continue;
                }
                let message = bedrock::Message::builder()
                    .role(bedrock::ConversationRole::User)
                    .set_content(Some(blocks))
                    .build()
                    .map_err(|e| AdapterError::msg(format!("Failed to build message: {e}")))?;
                result.push(message);
            }

            Message::Assistant(assistant) => {
                let mut blocks: Vec<bedrock::ContentBlock> = Vec::new();
                for block in &assistant.content {
                    match block {
                        AssistantContent::Text(t) => {
                            if !t.text.trim().is_empty() {
                                blocks.push(bedrock::ContentBlock::Text(t.text.clone()));
                            }
                        }
                        AssistantContent::ToolCall(tc) => {
                            let tool_use = bedrock::ToolUseBlock::builder()
                                .tool_use_id(&tc.id)
                                .name(&tc.name)
                                .input(value_to_document(&tc.arguments))
                                .build()
                                .map_err(|e| AdapterError::msg(format!("Failed to build tool use: {e}")))?;
                            blocks.push(bedrock::ContentBlock::ToolUse(tool_use));
                        }
                        AssistantContent::Thinking(thinking) => {
                            if thinking.thinking.trim().is_empty() {
                                continue;
                            }
                            let mut text = bedrock::ReasoningTextBlock::builder()
                                .text(&thinking.thinking);
                            if supports_thinking_signature(&model.id) {
                                if let Some(sig) = &thinking.thinking_signature {
                                    text = text.signature(sig);
                                }
                            }
                            let text = text
                                .build()
                                .map_err(|e| AdapterError::msg(format!("Failed to build reasoning: {e}")))?;
                            blocks.push(bedrock::ContentBlock::ReasoningContent(
                                bedrock::ReasoningContentBlock::ReasoningText(text),
                            ));
                        }
                    }
                }
                if blocks.is_empty() {
                    i += 1;
                    continue;
                }
                let message = bedrock::Message::builder()
                    .role(bedrock::ConversationRole::Assistant)
                    .set_content(Some(blocks))
                    .build()
                    .map_err(|e| AdapterError::msg(format!("Failed to build message: {e}")))?;
                result.push(message);
            }

            Message::ToolResult(_) => {
                let mut blocks: Vec<bedrock::ContentBlock> = Vec::new();
                while i < transformed.len() {
                    let Message::ToolResult(tr) = &transformed[i] else { break };
                    let mut content: Vec<bedrock::ToolResultContentBlock> = Vec::new();
                    for part in &tr.content {
                        match part {
                            ContentPart::Text(t) => {
                                content.push(bedrock::ToolResultContentBlock::Text(t.text.clone()));
                            }
                            ContentPart::Image(img) if model.supports_images() => {
                                content.push(bedrock::ToolResultContentBlock::Image(image_block(
                                    &img.mime_type,
                                    &img.data,
                                )?));
                            }
                            ContentPart::Image(_) => {}
                        }
                    }
                    let tool_result = bedrock::ToolResultBlock::builder()
                        .tool_use_id(&tr.tool_call_id)
                        .set_content(Some(content))
                        .status(if tr.is_error {
                            bedrock::ToolResultStatus::Error
                        } else {
                            bedrock::ToolResultStatus::Success
                        })
                        .build()
                        .map_err(|e| AdapterError::msg(format!("Failed to build tool result: {e}")))?;
                    blocks.push(bedrock::ContentBlock::ToolResult(tool_result));
                    i += 1;
                }
                let message = bedrock::Message::builder()
                    .role(bedrock::ConversationRole::User)
                    .set_content(Some(blocks))
                    .build()
                    .map_err(|e| AdapterError::msg(format!("Failed to build message: {e}")))?;
                result.push(message);
                continue;
            }
        }
        i += 1;
    }

    Ok(result)
}

fn convert_tool_config(
    context: &Context,
    tool_choice: Option<&Value>,
) -> Result<Option<bedrock::ToolConfiguration>, AdapterError> {
    if context.tools.is_empty() {
        return Ok(None);
    }

    let mut builder = bedrock::ToolConfiguration::builder();
    for tool in &context.tools {
        let spec = bedrock::ToolSpecification::builder()
            .name(&tool.name)
            .description(&tool.description)
            .input_schema(bedrock::ToolInputSchema::Json(value_to_document(&tool.parameters)))
            .build()
            .map_err(|e| AdapterError::msg(format!("Failed to build tool spec: {e}")))?;
        builder = builder.tools(bedrock::Tool::ToolSpec(spec));
    }

    if let Some(choice) = tool_choice {
        let choice = match (choice.as_str(), choice["name"].as_str()) {
            (Some("auto"), _) => Some(bedrock::ToolChoice::Auto(bedrock::AutoToolChoice::builder().build())),
            (Some("any"), _) => Some(bedrock::ToolChoice::Any(bedrock::AnyToolChoice::builder().build())),
            (_, Some(name)) => Some(bedrock::ToolChoice::Tool(
                bedrock::SpecificToolChoice::builder()
                    .name(name)
                    .build()
                    .map_err(|e| AdapterError::msg(format!("Failed to build tool choice: {e}")))?,
            )),
            _ => None,
        };
        if let Some(choice) = choice {
            builder = builder.tool_choice(choice);
        }
    }

    builder
        .build()
        .map(Some)
        .map_err(|e| AdapterError::msg(format!("Failed to build tool config: {e}")))
}

/// Thinking configuration rides `additionalModelRequestFields` on Claude.
fn build_additional_fields(model: &Model, options: &BedrockOptions) -> Option<Value> {
    let level = options.reasoning.filter(|level| !level.is_off())?;
    if !model.reasoning || !is_bedrock_claude(&model.id) {
        return None;
    }

    let mut fields = if supports_adaptive_thinking(&model.id) {
        json!({
            "thinking": {"type": "adaptive"},
            "output_config": {"effort": map_effort(level)},
        })
    } else {
        let clamped = if level == ThinkingLevel::Xhigh { ThinkingLevel::High } else { level };
        let budget = options
            .thinking_budgets
            .as_ref()
            .and_then(|b| b.get(clamped))
            .unwrap_or_else(|| anthropic_budget(level));
        json!({"thinking": {"type": "enabled", "budget_tokens": budget}})
    };

    if options.interleaved_thinking && !supports_adaptive_thinking(&model.id) {
        fields["anthropic_beta"] = json!(["interleaved-thinking-2025-05-14"]);
    }
    Some(fields)
}

/// Stream a response from the Bedrock Converse Stream API.
pub fn stream_bedrock(model: Model, context: Context, options: BedrockOptions) -> AssistantMessageStream {
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
    options: &BedrockOptions,
    output: &mut AssistantMessage,
    sink: &AssistantMessageSink,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    let region = options
        .region
        .clone()
        .or_else(|| std::env::var("AWS_REGION").ok())
        .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
        .unwrap_or_else(|| "us-east-1".to_string());

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region));
    if let Some(profile) = &options.profile {
        loader = loader.profile_name(profile);
    }
    let config = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AdapterError::Aborted),
        config = loader.load() => config,
    };
    let client = aws_sdk_bedrockruntime::Client::new(&config);

    let messages = convert_messages(model, context)?;
    let tool_config = convert_tool_config(context, options.tool_choice.as_ref())?;
    let additional = build_additional_fields(model, options);

    if let Some(on_payload) = &options.on_payload {
        // The SDK request is not JSON; report the interesting parts.
        on_payload(&json!({
            "modelId": model.id,
            "maxTokens": options.max_tokens,
            "temperature": options.temperature,
            "additionalModelRequestFields": additional,
        }));
    }

    let mut inference = bedrock::InferenceConfiguration::builder();
    if let Some(max_tokens) = options.max_tokens {
        inference = inference.max_tokens(max_tokens as i32);
    }
    if let Some(temperature) = options.temperature {
        inference = inference.temperature(temperature);
    }

    let mut request = client
        .converse_stream()
        .model_id(&model.id)
        .set_messages(Some(messages))
        .inference_config(inference.build());

    if let Some(system) = &context.system_prompt {
        request = request.system(bedrock::SystemContentBlock::Text(system.clone()));
    }
    if let Some(tool_config) = tool_config {
        request = request.tool_config(tool_config);
    }
    if let Some(additional) = &additional {
        request = request.additional_model_request_fields(value_to_document(additional));
    }

    debug!(provider = %model.provider, model = %model.id, "Sending streaming request");
    check_cancel(cancel)?;
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AdapterError::Aborted),
        response = request.send() => response.map_err(|e| AdapterError::msg(format!(
            "Bedrock API error: {}",
            aws_sdk_bedrockruntime::error::DisplayErrorContext(&e)
        )))?,
    };

    let mut stream = response.stream;
    // API block index -> our content index, plus raw JSON per tool call.
    let mut block_indices: HashMap<i32, usize> = HashMap::new();
    let mut partial_json: HashMap<usize, String> = HashMap::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AdapterError::Aborted),
            event = stream.recv() => event.map_err(|e| AdapterError::msg(format!(
                "Stream interrupted: {}",
                aws_sdk_bedrockruntime::error::DisplayErrorContext(&e)
            )))?,
        };
        let Some(event) = event else { break };

        match event {
            bedrock::ConverseStreamOutput::MessageStart(_) => {
                sink.push(AssistantMessageEvent::Start { partial: output.clone() });
            }

            bedrock::ConverseStreamOutput::ContentBlockStart(start) => {
                let api_index = start.content_block_index;
                if let Some(bedrock::ContentBlockStart::ToolUse(tool_use)) = start.start {
                    output.content.push(AssistantContent::ToolCall(ToolCall::new(
                        tool_use.tool_use_id,
                        tool_use.name,
                        json!({}),
                    )));
                    let index = output.content.len() - 1;
                    block_indices.insert(api_index, index);
                    partial_json.insert(index, String::new());
                    sink.push(AssistantMessageEvent::ToolCallStart {
                        content_index: index,
                        partial: output.clone(),
                    });
                }
            }

            bedrock::ConverseStreamOutput::ContentBlockDelta(delta_event) => {
                let api_index = delta_event.content_block_index;
                let Some(delta) = delta_event.delta else { continue };

                match delta {
                    bedrock::ContentBlockDelta::Text(text) => {
                        let index = match block_indices.get(&api_index) {
                            Some(&index) => index,
                            None => {
                                output.content.push(AssistantContent::Text(TextContent::new("")));
                                let index = output.content.len() - 1;
                                block_indices.insert(api_index, index);
                                sink.push(AssistantMessageEvent::TextStart {
                                    content_index: index,
                                    partial: output.clone(),
                                });
                                index
                            }
                        };
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

                    bedrock::ContentBlockDelta::ToolUse(tool_delta) => {
                        let Some(&index) = block_indices.get(&api_index) else { continue };
                        let fragment = tool_delta.input;
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

                    bedrock::ContentBlockDelta::ReasoningContent(reasoning) => {
                        let index = match block_indices.get(&api_index) {
                            Some(&index) => index,
                            None => {
                                output
                                    .content
                                    .push(AssistantContent::Thinking(ThinkingContent::default()));
                                let index = output.content.len() - 1;
                                block_indices.insert(api_index, index);
                                sink.push(AssistantMessageEvent::ThinkingStart {
                                    content_index: index,
                                    partial: output.clone(),
                                });
                                index
                            }
                        };
                        match reasoning {
                            bedrock::ReasoningContentBlockDelta::Text(text) => {
                                let mut applied = false;
                                if let Some(AssistantContent::Thinking(block)) =
                                    output.content.get_mut(index)
                                {
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
                            bedrock::ReasoningContentBlockDelta::Signature(signature) => {
                                if let Some(AssistantContent::Thinking(block)) =
                                    output.content.get_mut(index)
                                {
                                    block
                                        .thinking_signature
                                        .get_or_insert_with(String::new)
                                        .push_str(&signature);
                                }
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }

            bedrock::ConverseStreamOutput::ContentBlockStop(stop) => {
                let Some(&index) = block_indices.get(&stop.content_block_index) else { continue };

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

            bedrock::ConverseStreamOutput::MessageStop(stop) => {
                output.stop_reason = map_stop_reason(&stop.stop_reason);
            }

            bedrock::ConverseStreamOutput::Metadata(metadata) => {
                if let Some(usage) = metadata.usage {
                    output.usage.input = usage.input_tokens.max(0) as u64;
                    output.usage.output = usage.output_tokens.max(0) as u64;
                    output.usage.cache_read =
                        usage.cache_read_input_tokens.unwrap_or(0).max(0) as u64;
                    output.usage.cache_write =
                        usage.cache_write_input_tokens.unwrap_or(0).max(0) as u64;
                    output.usage.total_tokens = usage.total_tokens.max(0) as u64;
                    calculate_cost(model, &mut output.usage);
                }
            }

            _ => {}
        }
    }

    if output.stop_reason.is_terminal_failure() {
        return Err(AdapterError::msg("An unknown error occurred"));
    }
    Ok(())
}

/// Stream using the simple API with thinking-level support.
pub fn stream_simple_bedrock(
    model: Model,
    context: Context,
    options: SimpleStreamOptions,
) -> Result<AssistantMessageStream, unillm_core::Error> {
    let base = build_base_options(&model, &options);
    let mut bedrock_options = BedrockOptions {
        temperature: base.temperature,
        max_tokens: base.max_tokens,
        session_id: base.session_id,
        cancel: base.cancel,
        on_payload: base.on_payload,
        interleaved_thinking: false,
        ..BedrockOptions::default()
    };

    let level = options
        .effective_reasoning()
        .map(|level| clamp_reasoning(&model, level))
        .filter(|level| !level.is_off());

    if let Some(level) = level {
        bedrock_options.reasoning = Some(level);
        bedrock_options.thinking_budgets = options.thinking_budgets;

        // Budget-based Claude models raise the ceiling like the direct
        // Anthropic adapter does.
        if is_bedrock_claude(&model.id) && !supports_adaptive_thinking(&model.id) {
            let clamped = if level == ThinkingLevel::Xhigh { ThinkingLevel::High } else { level };
            let budget = options
                .thinking_budgets
                .as_ref()
                .and_then(|b| b.get(clamped))
                .unwrap_or_else(|| anthropic_budget(level));
            let (max_tokens, budget) =
                adjust_max_tokens_for_thinking(bedrock_options.max_tokens.unwrap_or(0), budget);
            bedrock_options.max_tokens = Some(max_tokens);
            let budgets = bedrock_options.thinking_budgets.get_or_insert_with(ThinkingBudgets::default);
            match clamped {
                ThinkingLevel::Minimal => budgets.minimal = Some(budget),
                ThinkingLevel::Low => budgets.low = Some(budget),
                ThinkingLevel::Medium => budgets.medium = Some(budget),
                _ => budgets.high = Some(budget),
            }
        }
    }

    Ok(stream_bedrock(model, context, bedrock_options))
}
