//! unillm-core — provider-agnostic LLM streaming primitives.
//!
//! The core normalizes heterogeneous LLM backends into one typed
//! assistant-message event stream: messages and content blocks, the
//! `Model` descriptor and registry, the `EventStream` push/pull channel,
//! the `ApiProvider` registry, and the `stream`/`complete` dispatch entry
//! points. Backend adapters live in `unillm-providers`; the stateful
//! agent loop in `unillm-agent`.

pub mod env;
pub mod error;
pub mod event;
pub mod json;
pub mod message;
pub mod model;
pub mod provider;
pub mod validation;

pub use error::{Error, Result};
pub use event::{
    assistant_message_channel, AssistantMessageEvent, AssistantMessageSink,
    AssistantMessageStream, EventSink, EventStream,
};
pub use message::{
    AssistantContent, AssistantMessage, ContentPart, Context, ImageContent, Message, StopReason,
    TextContent, ThinkingContent, Tool, ToolCall, ToolResultMessage, Usage, UsageCost, UserContent,
    UserMessage,
};
pub use model::{
    calculate_cost, get_model, get_models, get_providers, register_models, supports_xhigh,
    CompletionsCompat, InputModality, MaxTokensField, Model, ModelCost, ThinkingFormat,
    ThinkingLevel,
};
pub use provider::{
    complete, complete_simple, get_api_provider, register_api_provider, stream, stream_simple,
    unregister_api_providers, ApiProvider, PayloadHook, SimpleStreamFn, SimpleStreamOptions,
    StreamFn, StreamOptions, ThinkingBudgets,
};
