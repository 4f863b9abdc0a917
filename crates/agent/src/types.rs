//! Core types for the agent runtime.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use unillm_core::event::{AssistantMessageEvent, EventSink, EventStream};
use unillm_core::message::{ContentPart, Message, ToolResultMessage};
use unillm_core::model::{Model, ThinkingLevel};
use unillm_core::provider::{SimpleStreamOptions, ThinkingBudgets};
use unillm_core::{AssistantMessageStream, Context, Result};

/// Messages held by the agent. Applications with richer message types
/// adapt at the `convert_to_llm` boundary; the default is the LLM
/// message union itself.
pub type AgentMessage = Message;

/// Result of executing a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentToolResult {
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AgentToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentPart::text(text)],
            details: None,
        }
    }
}

/// Error type tools may fail with; the loop renders it as an error tool
/// result visible to the model, never as a run failure.
pub type AgentToolError = Box<dyn std::error::Error + Send + Sync>;

/// Callback for streaming partial tool results.
pub type ToolUpdateFn = Arc<dyn Fn(AgentToolResult) + Send + Sync>;

/// A tool the agent can execute.
///
/// `execute` receives the cancel signal and is expected to return
/// promptly once it fires, either with the partial result so far or an
/// error.
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// Unique name within the agent's tool set.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Short human-readable label for progress display.
    fn label(&self) -> &str {
        self.name()
    }

    /// JSON Schema for the tool's arguments.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        call_id: &str,
        arguments: &serde_json::Value,
        cancel: CancellationToken,
        on_update: ToolUpdateFn,
    ) -> std::result::Result<AgentToolResult, AgentToolError>;
}

/// Context for one agent run.
#[derive(Clone, Default)]
pub struct AgentContext {
    pub system_prompt: String,
    pub messages: Vec<AgentMessage>,
    pub tools: Vec<Arc<dyn AgentTool>>,
}

/// Adapter from app messages to LLM messages.
pub type ConvertToLlmFn = Arc<dyn Fn(&[AgentMessage]) -> Vec<Message> + Send + Sync>;

/// Override for the LLM call itself (tests, routing).
pub type AgentStreamFn =
    Arc<dyn Fn(&Model, &Context, SimpleStreamOptions) -> Result<AssistantMessageStream> + Send + Sync>;

/// Supplier draining queued steering or follow-up messages.
pub type QueueFn = Arc<dyn Fn() -> Vec<AgentMessage> + Send + Sync>;

/// Configuration for the agent loop.
#[derive(Clone)]
pub struct AgentLoopConfig {
    pub model: Model,
    pub reasoning: Option<ThinkingLevel>,
    pub session_id: Option<String>,
    pub thinking_budgets: Option<ThinkingBudgets>,
    pub api_key: Option<String>,
    /// `None` passes agent messages through unchanged.
    pub convert_to_llm: Option<ConvertToLlmFn>,
    /// `None` uses the dispatch layer's `stream_simple`.
    pub stream_fn: Option<AgentStreamFn>,
    pub get_steering_messages: Option<QueueFn>,
    pub get_follow_up_messages: Option<QueueFn>,
}

impl AgentLoopConfig {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            reasoning: None,
            session_id: None,
            thinking_budgets: None,
            api_key: None,
            convert_to_llm: None,
            stream_fn: None,
            get_steering_messages: None,
            get_follow_up_messages: None,
        }
    }
}

/// Events emitted by an agent run, in push order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart,
    AgentEnd {
        messages: Vec<AgentMessage>,
    },
    TurnStart,
    TurnEnd {
        message: AgentMessage,
        tool_results: Vec<ToolResultMessage>,
    },
    MessageStart {
        message: AgentMessage,
    },
    /// Forwards one normalized stream event along with the current
    /// message snapshot.
    MessageUpdate {
        message: AgentMessage,
        event: AssistantMessageEvent,
    },
    MessageEnd {
        message: AgentMessage,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
        partial_result: AgentToolResult,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: AgentToolResult,
        is_error: bool,
    },
}

/// Stream of agent events; the result latches the messages produced by
/// the run when `AgentEnd` fires.
pub type AgentEventStream = EventStream<AgentEvent, Vec<AgentMessage>>;

/// Producer half for agent event streams.
pub type AgentEventSink = EventSink<AgentEvent, Vec<AgentMessage>>;

/// Create a connected sink/stream pair for agent events.
pub fn agent_event_channel() -> (AgentEventSink, AgentEventStream) {
    EventStream::channel(|event| match event {
        AgentEvent::AgentEnd { messages } => Some(messages.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_events_serialize_with_type_tags() {
        let event = AgentEvent::ToolExecutionEnd {
            tool_call_id: "c1".into(),
            tool_name: "search".into(),
            result: AgentToolResult::text("found"),
            is_error: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_execution_end""#));
        assert!(json.contains(r#""tool_name":"search""#));

        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        match back {
            AgentEvent::ToolExecutionEnd { result, .. } => {
                assert_eq!(result.content.len(), 1);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn agent_end_latches_the_result() {
        let (sink, stream) = agent_event_channel();
        sink.push(AgentEvent::AgentStart);
        sink.push(AgentEvent::AgentEnd {
            messages: vec![Message::user("hi")],
        });
        sink.end();

        let messages = stream.await_result().await.unwrap();
        assert_eq!(messages.len(), 1);
    }
}
