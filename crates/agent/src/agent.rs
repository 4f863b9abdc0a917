//! The stateful agent: holds model, system prompt, tools, thinking level,
//! and accumulated messages; orchestrates runs of the agent loop and
//! fans events out to subscribers.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use unillm_core::message::{AssistantMessage, ContentPart, Message, StopReason, UserMessage};
use unillm_core::model::{Model, ThinkingLevel};
use unillm_core::provider::ThinkingBudgets;
use unillm_core::{Error, Result};

use crate::loop_runner::{agent_loop, agent_loop_continue};
use crate::types::{
    AgentContext, AgentEvent, AgentLoopConfig, AgentMessage, AgentStreamFn, AgentTool,
    ConvertToLlmFn,
};

/// How queued messages are consumed when a run picks them up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// One queued message per turn.
    #[default]
    OneAtATime,
    /// Everything queued at once.
    All,
}

type Listener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Handle returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct AgentState {
    system_prompt: String,
    model: Option<Model>,
    thinking_level: ThinkingLevel,
    tools: Vec<Arc<dyn AgentTool>>,
    messages: Vec<AgentMessage>,
    is_streaming: bool,
    stream_message: Option<AgentMessage>,
    pending_tool_calls: HashSet<String>,
    error: Option<String>,
}

/// Stateful agent orchestrating LLM calls and tool execution.
///
/// One run is active at a time; `prompt` rejects while running. Steering
/// and follow-up messages can be queued from other tasks or from event
/// listeners at any point.
pub struct Agent {
    state: Arc<Mutex<AgentState>>,
    steering: Arc<Mutex<VecDeque<AgentMessage>>>,
    follow_up: Arc<Mutex<VecDeque<AgentMessage>>>,
    listeners: Arc<Mutex<Vec<(u64, Listener)>>>,
    next_listener_id: AtomicU64,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
    steering_mode: QueueMode,
    follow_up_mode: QueueMode,
    stream_fn: Option<AgentStreamFn>,
    convert_to_llm: Option<ConvertToLlmFn>,
    session_id: Mutex<Option<String>>,
    thinking_budgets: Mutex<Option<ThinkingBudgets>>,
    api_key: Mutex<Option<String>>,
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AgentState {
                system_prompt: String::new(),
                model: None,
                thinking_level: ThinkingLevel::Off,
                tools: Vec::new(),
                messages: Vec::new(),
                is_streaming: false,
                stream_message: None,
                pending_tool_calls: HashSet::new(),
                error: None,
            })),
            steering: Arc::new(Mutex::new(VecDeque::new())),
            follow_up: Arc::new(Mutex::new(VecDeque::new())),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            cancel: Arc::new(Mutex::new(None)),
            steering_mode: QueueMode::OneAtATime,
            follow_up_mode: QueueMode::OneAtATime,
            stream_fn: None,
            convert_to_llm: None,
            session_id: Mutex::new(None),
            thinking_budgets: Mutex::new(None),
            api_key: Mutex::new(None),
        }
    }

    /// Override how the agent reaches the LLM (tests, routing).
    pub fn with_stream_fn(mut self, stream_fn: AgentStreamFn) -> Self {
        self.stream_fn = Some(stream_fn);
        self
    }

    /// Install an app-message adapter applied at the LLM call boundary.
    pub fn with_convert_to_llm(mut self, convert: ConvertToLlmFn) -> Self {
        self.convert_to_llm = Some(convert);
        self
    }

    pub fn with_steering_mode(mut self, mode: QueueMode) -> Self {
        self.steering_mode = mode;
        self
    }

    pub fn with_follow_up_mode(mut self, mode: QueueMode) -> Self {
        self.follow_up_mode = mode;
        self
    }

    // --- State mutators ---

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.state.lock().unwrap().system_prompt = prompt.into();
    }

    pub fn set_model(&self, model: Model) {
        self.state.lock().unwrap().model = Some(model);
    }

    pub fn set_thinking_level(&self, level: ThinkingLevel) {
        self.state.lock().unwrap().thinking_level = level;
    }

    /// Replace the tool set. Tools may not change mid-run.
    pub fn set_tools(&self, tools: Vec<Arc<dyn AgentTool>>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.is_streaming {
            return Err(Error::InvalidInput(
                "Cannot change tools while the agent is running".into(),
            ));
        }
        state.tools = tools;
        Ok(())
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        *self.session_id.lock().unwrap() = session_id;
    }

    pub fn set_thinking_budgets(&self, budgets: Option<ThinkingBudgets>) {
        *self.thinking_budgets.lock().unwrap() = budgets;
    }

    pub fn set_api_key(&self, api_key: Option<String>) {
        *self.api_key.lock().unwrap() = api_key;
    }

    pub fn replace_messages(&self, messages: Vec<AgentMessage>) {
        self.state.lock().unwrap().messages = messages;
    }

    pub fn append_message(&self, message: AgentMessage) {
        self.state.lock().unwrap().messages.push(message);
    }

    pub fn clear_messages(&self) {
        self.state.lock().unwrap().messages.clear();
    }

    // --- State accessors ---

    pub fn messages(&self) -> Vec<AgentMessage> {
        self.state.lock().unwrap().messages.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().unwrap().is_streaming
    }

    /// The in-progress message of the active turn, if any.
    pub fn stream_message(&self) -> Option<AgentMessage> {
        self.state.lock().unwrap().stream_message.clone()
    }

    /// Call ids of tools currently executing.
    pub fn pending_tool_calls(&self) -> HashSet<String> {
        self.state.lock().unwrap().pending_tool_calls.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    // --- Subscriptions ---

    /// Register an event listener; every agent event of every run is
    /// delivered in push order. Listener panics are isolated and logged.
    pub fn subscribe(&self, listener: impl Fn(&AgentEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.listeners.lock().unwrap().retain(|(id, _)| *id != subscription.0);
    }

    fn emit(&self, event: &AgentEvent) {
        // Snapshot so listeners can unsubscribe during delivery.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(event)));
            if result.is_err() {
                warn!("Agent event listener panicked; continuing");
            }
        }
    }

    // --- Queue management ---

    /// Queue a steering message to interrupt the agent mid-run.
    pub fn steer(&self, message: AgentMessage) {
        self.steering.lock().unwrap().push_back(message);
    }

    /// Queue a message for after the current run completes.
    pub fn follow_up(&self, message: AgentMessage) {
        self.follow_up.lock().unwrap().push_back(message);
    }

    pub fn clear_steering_queue(&self) {
        self.steering.lock().unwrap().clear();
    }

    pub fn clear_follow_up_queue(&self) {
        self.follow_up.lock().unwrap().clear();
    }

    pub fn has_queued_messages(&self) -> bool {
        !self.steering.lock().unwrap().is_empty() || !self.follow_up.lock().unwrap().is_empty()
    }

    fn dequeue(queue: &Mutex<VecDeque<AgentMessage>>, mode: QueueMode) -> Vec<AgentMessage> {
        let mut queue = queue.lock().unwrap();
        match mode {
            QueueMode::OneAtATime => queue.pop_front().into_iter().collect(),
            QueueMode::All => queue.drain(..).collect(),
        }
    }

    // --- Main entry points ---

    /// Send a prompt and run until idle. Rejects while already running.
    pub async fn prompt(&self, input: impl Into<PromptInput>) -> Result<()> {
        let messages = match input.into() {
            PromptInput::Text(text) => vec![Message::user(text)],
            PromptInput::Message(message) => vec![message],
            PromptInput::Messages(messages) => messages,
        };
        self.run(Some(messages), false).await
    }

    /// Send a prompt with image attachments.
    pub async fn prompt_with_images(
        &self,
        text: impl Into<String>,
        images: Vec<unillm_core::message::ImageContent>,
    ) -> Result<()> {
        let mut blocks = vec![ContentPart::text(text)];
        blocks.extend(images.into_iter().map(ContentPart::Image));
        let message = Message::User(UserMessage::with_blocks(blocks));
        self.run(Some(vec![message]), false).await
    }

    /// Resume by processing queued messages without a new user prompt.
    pub async fn continue_run(&self) -> Result<()> {
        if self.is_streaming() {
            return Err(Error::InvalidInput("Agent is already processing.".into()));
        }

        let last_is_assistant = {
            let state = self.state.lock().unwrap();
            if state.messages.is_empty() {
                return Err(Error::InvalidInput("No messages to continue from".into()));
            }
            matches!(state.messages.last(), Some(Message::Assistant(_)))
        };

        if last_is_assistant {
            let steering = Self::dequeue(&self.steering, self.steering_mode);
            if !steering.is_empty() {
                return self.run(Some(steering), true).await;
            }
            let follow_up = Self::dequeue(&self.follow_up, self.follow_up_mode);
            if !follow_up.is_empty() {
                return self.run(Some(follow_up), false).await;
            }
            return Err(Error::InvalidInput(
                "Cannot continue from message role: assistant".into(),
            ));
        }

        self.run(None, false).await
    }

    /// Set the cancel signal for the active run. Safe to call when idle;
    /// idempotent.
    pub fn abort(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap().as_ref() {
            cancel.cancel();
        }
    }

    /// Reset messages, queues, and error state.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.messages.clear();
            state.is_streaming = false;
            state.stream_message = None;
            state.pending_tool_calls.clear();
            state.error = None;
        }
        self.clear_steering_queue();
        self.clear_follow_up_queue();
    }

    async fn run(&self, prompts: Option<Vec<AgentMessage>>, skip_initial_steering: bool) -> Result<()> {
        let (model, context, reasoning) = {
            let mut state = self.state.lock().unwrap();
            if state.is_streaming {
                return Err(Error::InvalidInput(
                    "Agent is already processing. Use steer() or follow_up() to queue messages.".into(),
                ));
            }
            let Some(model) = state.model.clone() else {
                return Err(Error::InvalidInput("No model configured".into()));
            };
            state.is_streaming = true;
            state.stream_message = None;
            state.error = None;

            let reasoning = match state.thinking_level {
                ThinkingLevel::Off => None,
                level => Some(level),
            };
            let context = AgentContext {
                system_prompt: state.system_prompt.clone(),
                messages: state.messages.clone(),
                tools: state.tools.clone(),
            };
            (model, context, reasoning)
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let steering_queue = self.steering.clone();
        let steering_mode = self.steering_mode;
        let skip_flag = Arc::new(Mutex::new(skip_initial_steering));
        let get_steering: crate::types::QueueFn = Arc::new(move || {
            let mut skip = skip_flag.lock().unwrap();
            if *skip {
                *skip = false;
                return Vec::new();
            }
            Self::dequeue(&steering_queue, steering_mode)
        });

        let follow_up_queue = self.follow_up.clone();
        let follow_up_mode = self.follow_up_mode;
        let get_follow_up: crate::types::QueueFn =
            Arc::new(move || Self::dequeue(&follow_up_queue, follow_up_mode));

        let config = AgentLoopConfig {
            model: model.clone(),
            reasoning,
            session_id: self.session_id.lock().unwrap().clone(),
            thinking_budgets: *self.thinking_budgets.lock().unwrap(),
            api_key: self.api_key.lock().unwrap().clone(),
            convert_to_llm: self.convert_to_llm.clone(),
            stream_fn: self.stream_fn.clone(),
            get_steering_messages: Some(get_steering),
            get_follow_up_messages: Some(get_follow_up),
        };

        let stream = match prompts {
            Some(prompts) => Ok(agent_loop(prompts, context, config, cancel.clone())),
            None => agent_loop_continue(context, config, cancel.clone()),
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(error) => {
                self.finish_run(&model, &cancel, Some(error.to_string()));
                return Err(error);
            }
        };

        while let Some(event) = stream.next().await {
            self.apply_event(&event);
            self.emit(&event);
        }

        self.finish_run(&model, &cancel, None);
        Ok(())
    }

    fn apply_event(&self, event: &AgentEvent) {
        let mut state = self.state.lock().unwrap();
        match event {
            AgentEvent::MessageStart { message } | AgentEvent::MessageUpdate { message, .. } => {
                state.stream_message = Some(message.clone());
            }
            AgentEvent::MessageEnd { message } => {
                state.stream_message = None;
                state.messages.push(message.clone());
            }
            AgentEvent::ToolExecutionStart { tool_call_id, .. } => {
                state.pending_tool_calls.insert(tool_call_id.clone());
            }
            AgentEvent::ToolExecutionEnd { tool_call_id, .. } => {
                state.pending_tool_calls.remove(tool_call_id);
            }
            AgentEvent::TurnEnd { message, .. } => {
                if let Message::Assistant(assistant) = message {
                    if let Some(error) = &assistant.error_message {
                        state.error = Some(error.clone());
                    }
                }
            }
            AgentEvent::AgentEnd { .. } => {
                state.is_streaming = false;
                state.stream_message = None;
            }
            _ => {}
        }
    }

    fn finish_run(&self, model: &Model, cancel: &CancellationToken, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = error {
            let message = AssistantMessage {
                api: model.api.clone(),
                provider: model.provider.clone(),
                model: model.id.clone(),
                stop_reason: if cancel.is_cancelled() {
                    StopReason::Aborted
                } else {
                    StopReason::Error
                },
                error_message: Some(error.clone()),
                ..AssistantMessage::default()
            };
            state.messages.push(Message::Assistant(message));
            state.error = Some(error);
        }
        state.is_streaming = false;
        state.stream_message = None;
        state.pending_tool_calls.clear();
        drop(state);
        *self.cancel.lock().unwrap() = None;
    }
}

/// Accepted prompt shapes.
pub enum PromptInput {
    Text(String),
    Message(AgentMessage),
    Messages(Vec<AgentMessage>),
}

impl From<&str> for PromptInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<AgentMessage> for PromptInput {
    fn from(message: AgentMessage) -> Self {
        Self::Message(message)
    }
}

impl From<Vec<AgentMessage>> for PromptInput {
    fn from(messages: Vec<AgentMessage>) -> Self {
        Self::Messages(messages)
    }
}
