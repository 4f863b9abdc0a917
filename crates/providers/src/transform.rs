//! Message normalization shared by every adapter.
//!
//! Run over the context's messages before conversion to any wire format:
//! - errored/aborted assistant messages are skipped entirely;
//! - tool-call IDs are normalized per provider rules;
//! - thought signatures are stripped when the generating model differs
//!   from the current one;
//! - empty thinking blocks are dropped (optionally converted to text for
//!   providers that cannot accept thinking at all);
//! - tool calls orphaned by a later user message get synthetic results so
//!   the history stays well-formed.

use std::collections::HashMap;

use unillm_core::message::{
    AssistantContent, ContentPart, Message, StopReason, TextContent, ToolResultMessage,
};

/// Options controlling the transform.
#[derive(Default)]
pub struct TransformOptions<'a> {
    /// The model about to receive the messages.
    pub current_model: Option<&'a str>,
    /// Provider-specific tool-call-id normalizer.
    pub normalize_tool_id: Option<&'a dyn Fn(&str) -> String>,
    /// Convert thinking blocks to `<thinking>` text instead of keeping them.
    pub convert_thinking_to_text: bool,
}

/// Transform messages for cross-provider compatibility.
pub fn transform_messages(messages: &[Message], options: &TransformOptions<'_>) -> Vec<Message> {
    let mut result: Vec<Message> = Vec::with_capacity(messages.len());
    // id -> name of tool calls still awaiting a result
    let mut pending_tool_calls: HashMap<String, String> = HashMap::new();
    let mut pending_order: Vec<String> = Vec::new();

    for msg in messages {
        match msg {
            Message::Assistant(assistant) => {
                if assistant.stop_reason.is_terminal_failure() {
                    continue;
                }

                let mut cloned = assistant.clone();
                let mut new_content = Vec::with_capacity(cloned.content.len());

                for block in cloned.content.drain(..) {
                    match block {
                        AssistantContent::ToolCall(mut tc) => {
                            if let Some(normalize) = options.normalize_tool_id {
                                tc.id = normalize(&tc.id);
                            }
                            if let Some(current) = options.current_model {
                                if assistant.model != current {
                                    tc.thought_signature = None;
                                }
                            }
                            pending_tool_calls.insert(tc.id.clone(), tc.name.clone());
                            pending_order.push(tc.id.clone());
                            new_content.push(AssistantContent::ToolCall(tc));
                        }
                        AssistantContent::Thinking(thinking) => {
                            if options.convert_thinking_to_text {
                                if !thinking.thinking.is_empty() {
                                    new_content.push(AssistantContent::Text(TextContent::new(
                                        format!("<thinking>\n{}\n</thinking>", thinking.thinking),
                                    )));
                                }
                            } else if !thinking.thinking.is_empty()
                                || thinking.thinking_signature.is_some()
                            {
                                new_content.push(AssistantContent::Thinking(thinking));
                            }
                        }
                        other => new_content.push(other),
                    }
                }

                cloned.content = new_content;
                result.push(Message::Assistant(cloned));
            }

            Message::ToolResult(tool_result) => {
                let mut cloned = tool_result.clone();
                if let Some(normalize) = options.normalize_tool_id {
                    cloned.tool_call_id = normalize(&cloned.tool_call_id);
                }
                pending_tool_calls.remove(&cloned.tool_call_id);
                pending_order.retain(|id| id != &cloned.tool_call_id);
                result.push(Message::ToolResult(cloned));
            }

            Message::User(user) => {
                // A user message arriving with calls still pending means the
                // run was interrupted; synthesize results to keep the
                // history well-formed.
                for id in pending_order.drain(..) {
                    let name = pending_tool_calls.remove(&id).unwrap_or_default();
                    result.push(Message::ToolResult(ToolResultMessage {
                        tool_call_id: id,
                        tool_name: name,
                        content: vec![ContentPart::text("Interrupted by user message")],
                        details: None,
                        is_error: false,
                        timestamp: user.timestamp,
                    }));
                }
                pending_tool_calls.clear();
                result.push(Message::User(user.clone()));
            }
        }
    }

    result
}

/// Whether any message in the history carries tool traffic.
pub fn has_tool_history(messages: &[Message]) -> bool {
    messages.iter().any(|msg| match msg {
        Message::ToolResult(_) => true,
        Message::Assistant(a) => !a.tool_calls().is_empty(),
        Message::User(_) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use unillm_core::message::{AssistantMessage, ThinkingContent, ToolCall, UserMessage};

    fn assistant_with_call(id: &str, model: &str) -> Message {
        Message::Assistant(AssistantMessage {
            content: vec![AssistantContent::ToolCall(ToolCall {
                id: id.into(),
                name: "search".into(),
                arguments: serde_json::json!({}),
                thought_signature: Some("sig".into()),
            })],
            model: model.into(),
            stop_reason: StopReason::ToolUse,
            ..AssistantMessage::default()
        })
    }

    #[test]
    fn errored_assistant_messages_are_skipped() {
        let messages = vec![
            Message::user("hi"),
            Message::Assistant(AssistantMessage {
                stop_reason: StopReason::Error,
                error_message: Some("boom".into()),
                ..AssistantMessage::default()
            }),
        ];
        let out = transform_messages(&messages, &TransformOptions::default());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn orphaned_tool_calls_get_synthetic_results() {
        let messages = vec![
            assistant_with_call("call_1", "m"),
            Message::User(UserMessage::new("never mind")),
        ];
        let out = transform_messages(&messages, &TransformOptions::default());
        assert_eq!(out.len(), 3);
        match &out[1] {
            Message::ToolResult(tr) => {
                assert_eq!(tr.tool_call_id, "call_1");
                assert_eq!(tr.text(), "Interrupted by user message");
                assert!(!tr.is_error);
            }
            other => panic!("Expected synthetic tool result, got {other:?}"),
        }
    }

    #[test]
    fn answered_tool_calls_are_not_synthesized() {
        let messages = vec![
            assistant_with_call("call_1", "m"),
            Message::ToolResult(ToolResultMessage {
                tool_call_id: "call_1".into(),
                tool_name: "search".into(),
                content: vec![ContentPart::text("found it")],
                details: None,
                is_error: false,
                timestamp: chrono::Utc::now(),
            }),
            Message::user("thanks"),
        ];
        let out = transform_messages(&messages, &TransformOptions::default());
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn tool_ids_are_normalized_everywhere() {
        let normalize = |id: &str| id.replace('|', "_");
        let messages = vec![
            assistant_with_call("abc|def", "m"),
            Message::ToolResult(ToolResultMessage {
                tool_call_id: "abc|def".into(),
                tool_name: "search".into(),
                content: vec![],
                details: None,
                is_error: false,
                timestamp: chrono::Utc::now(),
            }),
        ];
        let out = transform_messages(
            &messages,
            &TransformOptions {
                normalize_tool_id: Some(&normalize),
                ..TransformOptions::default()
            },
        );
        match (&out[0], &out[1]) {
            (Message::Assistant(a), Message::ToolResult(tr)) => {
                assert_eq!(a.tool_calls()[0].id, "abc_def");
                assert_eq!(tr.tool_call_id, "abc_def");
            }
            _ => panic!("unexpected shapes"),
        }
    }

    #[test]
    fn signature_stripped_when_model_changes() {
        let messages = vec![assistant_with_call("c", "old-model")];
        let out = transform_messages(
            &messages,
            &TransformOptions {
                current_model: Some("new-model"),
                ..TransformOptions::default()
            },
        );
        match &out[0] {
            Message::Assistant(a) => assert!(a.tool_calls()[0].thought_signature.is_none()),
            _ => panic!(),
        }
    }

    #[test]
    fn empty_thinking_blocks_are_dropped() {
        let messages = vec![Message::Assistant(AssistantMessage {
            content: vec![
                AssistantContent::Thinking(ThinkingContent::default()),
                AssistantContent::Text(TextContent::new("visible")),
            ],
            ..AssistantMessage::default()
        })];
        let out = transform_messages(&messages, &TransformOptions::default());
        match &out[0] {
            Message::Assistant(a) => assert_eq!(a.content.len(), 1),
            _ => panic!(),
        }
    }

    #[test]
    fn thinking_converted_to_text_when_requested() {
        let messages = vec![Message::Assistant(AssistantMessage {
            content: vec![AssistantContent::Thinking(ThinkingContent {
                thinking: "deep thought".into(),
                thinking_signature: None,
            })],
            ..AssistantMessage::default()
        })];
        let out = transform_messages(
            &messages,
            &TransformOptions {
                convert_thinking_to_text: true,
                ..TransformOptions::default()
            },
        );
        match &out[0] {
            Message::Assistant(a) => {
                assert!(a.text().contains("<thinking>"));
                assert!(a.text().contains("deep thought"));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn tool_history_detection() {
        assert!(!has_tool_history(&[Message::user("x")]));
        assert!(has_tool_history(&[assistant_with_call("c", "m")]));
    }
}
