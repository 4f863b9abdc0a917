//! unillm-agent — the stateful agent loop over the unillm streaming core.
//!
//! `agent_loop` drives multi-turn tool-calling conversations and emits a
//! higher-level event vocabulary; `Agent` wraps it with persistent state,
//! steering/follow-up queues, cancellation, and subscriptions.

pub mod agent;
pub mod loop_runner;
pub mod types;

pub use agent::{Agent, PromptInput, QueueMode, SubscriptionId};
pub use loop_runner::{agent_loop, agent_loop_continue, SKIPPED_BY_STEERING};
pub use types::{
    agent_event_channel, AgentContext, AgentEvent, AgentEventSink, AgentEventStream,
    AgentLoopConfig, AgentMessage, AgentStreamFn, AgentTool, AgentToolError, AgentToolResult,
    ConvertToLlmFn, QueueFn, ToolUpdateFn,
};
