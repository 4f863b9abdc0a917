//! End-to-end agent scenarios driven by in-process scripted providers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use unillm_agent::{
    Agent, AgentEvent, AgentStreamFn, AgentTool, AgentToolError, AgentToolResult, ToolUpdateFn,
    SKIPPED_BY_STEERING,
};
use unillm_core::event::{assistant_message_channel, AssistantMessageEvent, AssistantMessageStream};
use unillm_core::message::{
    AssistantContent, AssistantMessage, Message, StopReason, TextContent, ToolCall,
};
use unillm_core::model::{InputModality, Model, ModelCost};
use unillm_core::{register_api_provider, unregister_api_providers, ApiProvider};

fn test_model(api: &str) -> Model {
    Model {
        id: "scripted-1".into(),
        name: "Scripted".into(),
        api: api.into(),
        provider: "scripted".into(),
        base_url: "http://localhost".into(),
        reasoning: false,
        input: vec![InputModality::Text],
        cost: ModelCost::default(),
        context_window: 32_000,
        max_tokens: 4096,
        headers: None,
        compat: None,
    }
}

fn assistant_text(text: &str) -> AssistantMessage {
    AssistantMessage {
        content: vec![AssistantContent::Text(TextContent::new(text))],
        stop_reason: StopReason::Stop,
        ..AssistantMessage::default()
    }
}

fn assistant_tool_calls(calls: Vec<ToolCall>) -> AssistantMessage {
    AssistantMessage {
        content: calls.into_iter().map(AssistantContent::ToolCall).collect(),
        stop_reason: StopReason::ToolUse,
        ..AssistantMessage::default()
    }
}

/// Play a prepared assistant message as a well-formed event stream.
fn play_scripted(message: AssistantMessage) -> AssistantMessageStream {
    let (sink, stream) = assistant_message_channel();
    let task = tokio::spawn(async move {
        let mut partial = AssistantMessage {
            content: Vec::new(),
            ..message.clone()
        };
        sink.push(AssistantMessageEvent::Start {
            partial: partial.clone(),
        });

        for block in &message.content {
            let index = partial.content.len();
            match block {
                AssistantContent::Text(text) => {
                    partial.content.push(AssistantContent::Text(TextContent::new("")));
                    sink.push(AssistantMessageEvent::TextStart {
                        content_index: index,
                        partial: partial.clone(),
                    });
                    if let Some(AssistantContent::Text(b)) = partial.content.get_mut(index) {
                        b.text = text.text.clone();
                    }
                    sink.push(AssistantMessageEvent::TextDelta {
                        content_index: index,
                        delta: text.text.clone(),
                        partial: partial.clone(),
                    });
                    sink.push(AssistantMessageEvent::TextEnd {
                        content_index: index,
                        content: text.text.clone(),
                        partial: partial.clone(),
                    });
                }
                AssistantContent::ToolCall(call) => {
                    partial.content.push(AssistantContent::ToolCall(ToolCall::new(
                        call.id.clone(),
                        call.name.clone(),
                        json!({}),
                    )));
                    sink.push(AssistantMessageEvent::ToolCallStart {
                        content_index: index,
                        partial: partial.clone(),
                    });
                    if let Some(AssistantContent::ToolCall(b)) = partial.content.get_mut(index) {
                        b.arguments = call.arguments.clone();
                    }
                    sink.push(AssistantMessageEvent::ToolCallDelta {
                        content_index: index,
                        delta: call.arguments.to_string(),
                        partial: partial.clone(),
                    });
                    sink.push(AssistantMessageEvent::ToolCallEnd {
                        content_index: index,
                        tool_call: call.clone(),
                        partial: partial.clone(),
                    });
                }
                AssistantContent::Thinking(_) => {}
            }
        }

        let mut usage = message.usage.clone();
        usage.output = usage.output.max(1);
        usage.update_total();
        partial.usage = usage;
        sink.push(AssistantMessageEvent::Done {
            reason: message.stop_reason,
            message: partial,
        });
        sink.end();
    });
    stream.with_task(task)
}

/// Stream function playing each scripted turn in order.
fn scripted_stream_fn(turns: Vec<AssistantMessage>) -> AgentStreamFn {
    let queue = Arc::new(Mutex::new(VecDeque::from(turns)));
    Arc::new(move |_model, _context, _options| {
        let next = queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| assistant_text("script exhausted"));
        Ok(play_scripted(next))
    })
}

type ToolHandler =
    Arc<dyn Fn(&str, &Value) -> Result<AgentToolResult, AgentToolError> + Send + Sync>;

struct FnTool {
    name: String,
    description: String,
    schema: Value,
    handler: ToolHandler,
}

#[async_trait]
impl AgentTool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(
        &self,
        call_id: &str,
        arguments: &Value,
        _cancel: CancellationToken,
        _on_update: ToolUpdateFn,
    ) -> Result<AgentToolResult, AgentToolError> {
        (self.handler)(call_id, arguments)
    }
}

fn weather_tool(executed: Arc<AtomicBool>) -> Arc<dyn AgentTool> {
    Arc::new(FnTool {
        name: "get_weather".into(),
        description: "Get the weather for a city".into(),
        schema: json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"],
        }),
        handler: Arc::new(move |_call_id, args| {
            executed.store(true, Ordering::SeqCst);
            assert_eq!(args["city"], "Tokyo");
            Ok(AgentToolResult::text("sunny, 22C"))
        }),
    })
}

fn collect_events(agent: &Agent) -> Arc<Mutex<Vec<AgentEvent>>> {
    let events: Arc<Mutex<Vec<AgentEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    agent.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

#[tokio::test]
async fn echo_provider_round_trip_through_the_registry() {
    register_api_provider(
        ApiProvider {
            api: "echo-e2e".into(),
            stream: Arc::new(|_model, context, _options| Ok(echo_stream(&context))),
            stream_simple: Arc::new(|_model, context, _options| Ok(echo_stream(&context))),
        },
        Some("agent-e2e"),
    );

    let agent = Agent::new();
    agent.set_model(test_model("echo-e2e"));
    agent.prompt("hello world").await.unwrap();

    let messages = agent.messages();
    assert_eq!(messages.len(), 2);
    match &messages[1] {
        Message::Assistant(assistant) => {
            assert_eq!(assistant.text(), "Echo: hello world");
            assert!(assistant.usage.output > 0);
            assert_eq!(assistant.stop_reason, StopReason::Stop);
        }
        other => panic!("expected assistant, got {other:?}"),
    }

    unregister_api_providers("agent-e2e");
}

fn echo_stream(context: &unillm_core::Context) -> AssistantMessageStream {
    let last_user = context
        .messages
        .iter()
        .rev()
        .find_map(|m| match m {
            Message::User(u) => Some(u.content.to_text()),
            _ => None,
        })
        .unwrap_or_default();
    let mut message = assistant_text(&format!("Echo: {last_user}"));
    message.usage.input = 3;
    message.usage.output = 5;
    play_scripted(message)
}

#[tokio::test]
async fn tool_call_round_trip() {
    let executed = Arc::new(AtomicBool::new(false));
    let agent = Agent::new().with_stream_fn(scripted_stream_fn(vec![
        assistant_tool_calls(vec![ToolCall::new(
            "call_1",
            "get_weather",
            json!({"city": "Tokyo"}),
        )]),
        assistant_text("Sunny, 22°C."),
    ]));
    agent.set_model(test_model("scripted"));
    agent.set_tools(vec![weather_tool(executed.clone())]).unwrap();

    agent.prompt("what's the weather in Tokyo?").await.unwrap();

    assert!(executed.load(Ordering::SeqCst));
    let messages = agent.messages();
    assert_eq!(messages.len(), 4, "user, assistant, tool result, assistant");
    assert!(matches!(messages[0], Message::User(_)));
    match &messages[1] {
        Message::Assistant(a) => assert_eq!(a.tool_calls().len(), 1),
        other => panic!("expected assistant, got {other:?}"),
    }
    match &messages[2] {
        Message::ToolResult(tr) => {
            assert_eq!(tr.text(), "sunny, 22C");
            assert!(!tr.is_error);
            assert_eq!(tr.tool_call_id, "call_1");
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    match &messages[3] {
        Message::Assistant(a) => assert_eq!(a.text(), "Sunny, 22°C."),
        other => panic!("expected assistant, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_tool_args_become_error_result_without_executing() {
    let executed = Arc::new(AtomicBool::new(false));
    let executed_clone = executed.clone();
    let search: Arc<dyn AgentTool> = Arc::new(FnTool {
        name: "search".into(),
        description: "Search".into(),
        schema: json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"],
        }),
        handler: Arc::new(move |_id, _args| {
            executed_clone.store(true, Ordering::SeqCst);
            Ok(AgentToolResult::text("should never run"))
        }),
    });

    let agent = Agent::new().with_stream_fn(scripted_stream_fn(vec![
        assistant_tool_calls(vec![ToolCall::new("call_bad", "search", json!({"query": 42}))]),
        assistant_text("recovered"),
    ]));
    agent.set_model(test_model("scripted"));
    agent.set_tools(vec![search]).unwrap();

    agent.prompt("search something").await.unwrap();

    assert!(!executed.load(Ordering::SeqCst), "execute must not run");
    let messages = agent.messages();
    let tool_results: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult(tr) => Some(tr),
            _ => None,
        })
        .collect();
    assert_eq!(tool_results.len(), 1);
    assert!(tool_results[0].is_error);
    assert!(tool_results[0].text().contains("Invalid arguments"));
    // The loop continued for one more turn.
    match messages.last().unwrap() {
        Message::Assistant(a) => assert_eq!(a.text(), "recovered"),
        other => panic!("expected assistant, got {other:?}"),
    }
}

#[tokio::test]
async fn steering_skips_remaining_tool_calls() {
    let agent = Arc::new(
        Agent::new().with_stream_fn(scripted_stream_fn(vec![
            assistant_tool_calls(vec![
                ToolCall::new("call_1", "get_weather", json!({"city": "Tokyo"})),
                ToolCall::new("call_2", "get_weather", json!({"city": "Osaka"})),
            ]),
            assistant_text("stopping as asked"),
        ])),
    );
    agent.set_model(test_model("scripted"));

    // Call 1 steers the agent mid-execution.
    let steer_agent = agent.clone();
    let tool: Arc<dyn AgentTool> = Arc::new(FnTool {
        name: "get_weather".into(),
        description: "Get the weather".into(),
        schema: json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"],
        }),
        handler: Arc::new(move |call_id, _args| {
            if call_id == "call_1" {
                steer_agent.steer(Message::user("stop"));
            }
            Ok(AgentToolResult::text("sunny, 22C"))
        }),
    });
    agent.set_tools(vec![tool]).unwrap();

    agent.prompt("weather in two cities").await.unwrap();

    let messages = agent.messages();
    let tool_results: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult(tr) => Some(tr),
            _ => None,
        })
        .collect();
    assert_eq!(tool_results.len(), 2);
    assert_eq!(tool_results[0].text(), "sunny, 22C");
    assert!(!tool_results[0].is_error);
    assert_eq!(tool_results[1].text(), SKIPPED_BY_STEERING);
    assert!(tool_results[1].is_error);

    // The steering message entered the context and drove the next turn.
    let steer_index = messages
        .iter()
        .position(|m| matches!(m, Message::User(u) if u.content.to_text() == "stop"))
        .expect("steering message in history");
    match &messages[steer_index + 1] {
        Message::Assistant(a) => assert_eq!(a.text(), "stopping as asked"),
        other => panic!("expected assistant after steering, got {other:?}"),
    }
}

#[tokio::test]
async fn abort_mid_stream_finalizes_with_aborted() {
    // A provider that streams a little text, then hangs until cancelled.
    let stream_fn: AgentStreamFn = Arc::new(|_model, _context, options| {
        let cancel = options.cancel.clone().unwrap_or_default();
        let (sink, stream) = assistant_message_channel();
        let task = tokio::spawn(async move {
            let mut partial = AssistantMessage::default();
            sink.push(AssistantMessageEvent::Start {
                partial: partial.clone(),
            });
            partial.content.push(AssistantContent::Text(TextContent::new("")));
            sink.push(AssistantMessageEvent::TextStart {
                content_index: 0,
                partial: partial.clone(),
            });
            if let Some(AssistantContent::Text(b)) = partial.content.get_mut(0) {
                b.text = "long story".into();
            }
            sink.push(AssistantMessageEvent::TextDelta {
                content_index: 0,
                delta: "long story".into(),
                partial: partial.clone(),
            });

            cancel.cancelled().await;
            partial.stop_reason = StopReason::Aborted;
            sink.push(AssistantMessageEvent::Error {
                reason: StopReason::Aborted,
                error: partial,
            });
            sink.end();
        });
        Ok(stream.with_task(task))
    });

    let agent = Arc::new(Agent::new().with_stream_fn(stream_fn));
    agent.set_model(test_model("scripted"));
    let events = collect_events(&agent);

    // Abort as soon as the first delta arrives.
    let abort_agent = agent.clone();
    agent.subscribe(move |event| {
        if matches!(event, AgentEvent::MessageUpdate { .. }) {
            abort_agent.abort();
        }
    });

    agent.prompt("tell me a long story").await.unwrap();

    let events = events.lock().unwrap();
    // Exactly one aborted error event was forwarded.
    let aborted_updates = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                AgentEvent::MessageUpdate {
                    event: AssistantMessageEvent::Error {
                        reason: StopReason::Aborted,
                        ..
                    },
                    ..
                }
            )
        })
        .count();
    // Error events terminate the forwarding, so they surface via
    // MessageEnd rather than MessageUpdate.
    assert_eq!(aborted_updates, 0);

    // The last event of the run is AgentEnd.
    assert!(matches!(events.last(), Some(AgentEvent::AgentEnd { .. })));

    match agent.messages().last().unwrap() {
        Message::Assistant(a) => {
            assert_eq!(a.stop_reason, StopReason::Aborted);
            assert_eq!(a.text(), "long story");
        }
        other => panic!("expected assistant, got {other:?}"),
    }
    assert!(!agent.is_streaming());
}

#[tokio::test]
async fn follow_up_runs_after_the_current_run() {
    let agent = Agent::new().with_stream_fn(scripted_stream_fn(vec![
        assistant_text("first answer"),
        assistant_text("follow-up answer"),
    ]));
    agent.set_model(test_model("scripted"));
    agent.follow_up(Message::user("and then?"));

    agent.prompt("first question").await.unwrap();

    let messages = agent.messages();
    let texts: Vec<String> = messages
        .iter()
        .map(|m| match m {
            Message::User(u) => format!("user:{}", u.content.to_text()),
            Message::Assistant(a) => format!("assistant:{}", a.text()),
            Message::ToolResult(tr) => format!("tool:{}", tr.text()),
        })
        .collect();
    assert_eq!(
        texts,
        vec![
            "user:first question",
            "assistant:first answer",
            "user:and then?",
            "assistant:follow-up answer",
        ]
    );
}

#[tokio::test]
async fn prompt_rejected_while_running() {
    // Provider that waits long enough for a second prompt attempt.
    let stream_fn: AgentStreamFn = Arc::new(|_model, _context, _options| {
        let (sink, stream) = assistant_message_channel();
        let task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            let message = assistant_text("slow answer");
            sink.push(AssistantMessageEvent::Done {
                reason: StopReason::Stop,
                message,
            });
            sink.end();
        });
        Ok(stream.with_task(task))
    });

    let agent = Arc::new(Agent::new().with_stream_fn(stream_fn));
    agent.set_model(test_model("scripted"));

    let racing = agent.clone();
    let first = tokio::spawn(async move { racing.prompt("one").await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let second = agent.prompt("two").await;
    assert!(second.is_err());
    assert!(second.unwrap_err().to_string().contains("already processing"));

    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn tools_cannot_change_mid_run() {
    let stream_fn: AgentStreamFn = Arc::new(|_model, _context, _options| {
        let (sink, stream) = assistant_message_channel();
        let task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            sink.push(AssistantMessageEvent::Done {
                reason: StopReason::Stop,
                message: assistant_text("done"),
            });
            sink.end();
        });
        Ok(stream.with_task(task))
    });

    let agent = Arc::new(Agent::new().with_stream_fn(stream_fn));
    agent.set_model(test_model("scripted"));

    let racing = agent.clone();
    let run = tokio::spawn(async move { racing.prompt("go").await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(agent.set_tools(Vec::new()).is_err());
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn continue_processes_queued_follow_ups() {
    let agent = Agent::new().with_stream_fn(scripted_stream_fn(vec![
        assistant_text("first"),
        assistant_text("second"),
    ]));
    agent.set_model(test_model("scripted"));

    agent.prompt("start").await.unwrap();
    assert_eq!(agent.messages().len(), 2);

    agent.follow_up(Message::user("more"));
    agent.continue_run().await.unwrap();

    let messages = agent.messages();
    assert_eq!(messages.len(), 4);
    match messages.last().unwrap() {
        Message::Assistant(a) => assert_eq!(a.text(), "second"),
        other => panic!("expected assistant, got {other:?}"),
    }

    // Nothing queued and assistant last: nothing to continue from.
    assert!(agent.continue_run().await.is_err());
}

#[tokio::test]
async fn agent_events_arrive_in_order() {
    let agent = Agent::new().with_stream_fn(scripted_stream_fn(vec![assistant_text("hi")]));
    agent.set_model(test_model("scripted"));
    let events = collect_events(&agent);

    agent.prompt("hello").await.unwrap();

    let kinds: Vec<&'static str> = events
        .lock()
        .unwrap()
        .iter()
        .map(|event| match event {
            AgentEvent::AgentStart => "agent_start",
            AgentEvent::TurnStart => "turn_start",
            AgentEvent::MessageStart { .. } => "message_start",
            AgentEvent::MessageUpdate { .. } => "message_update",
            AgentEvent::MessageEnd { .. } => "message_end",
            AgentEvent::TurnEnd { .. } => "turn_end",
            AgentEvent::AgentEnd { .. } => "agent_end",
            _ => "tool",
        })
        .collect();

    assert_eq!(kinds.first(), Some(&"agent_start"));
    assert_eq!(kinds.get(1), Some(&"turn_start"));
    // Prompt echo, then the streamed assistant message.
    assert_eq!(kinds.last(), Some(&"agent_end"));
    assert!(kinds.contains(&"message_update"));
    let turn_end = kinds.iter().position(|k| *k == "turn_end").unwrap();
    let agent_end = kinds.iter().position(|k| *k == "agent_end").unwrap();
    assert!(turn_end < agent_end);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let agent = Agent::new().with_stream_fn(scripted_stream_fn(vec![assistant_text("hi")]));
    agent.set_model(test_model("scripted"));

    let count = Arc::new(Mutex::new(0usize));
    let counter = count.clone();
    let subscription = agent.subscribe(move |_| *counter.lock().unwrap() += 1);
    agent.unsubscribe(subscription);

    agent.prompt("hello").await.unwrap();
    assert_eq!(*count.lock().unwrap(), 0);
}

#[tokio::test]
async fn prompt_with_images_builds_block_content() {
    let agent = Agent::new().with_stream_fn(scripted_stream_fn(vec![assistant_text("nice photo")]));
    agent.set_model(test_model("scripted"));

    agent
        .prompt_with_images(
            "what is this?",
            vec![unillm_core::message::ImageContent {
                data: "aGVsbG8=".into(),
                mime_type: "image/png".into(),
            }],
        )
        .await
        .unwrap();

    match &agent.messages()[0] {
        Message::User(user) => match &user.content {
            unillm_core::message::UserContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert_eq!(user.content.to_text(), "what is this?");
            }
            other => panic!("expected blocks, got {other:?}"),
        },
        other => panic!("expected user message, got {other:?}"),
    }
}

#[tokio::test]
async fn stream_failure_surfaces_on_the_agent() {
    let stream_fn: AgentStreamFn = Arc::new(|_model, _context, _options| {
        let (sink, stream) = assistant_message_channel();
        sink.push(AssistantMessageEvent::Error {
            reason: StopReason::Error,
            error: AssistantMessage {
                stop_reason: StopReason::Error,
                error_message: Some("overloaded".into()),
                ..AssistantMessage::default()
            },
        });
        sink.end();
        Ok(stream)
    });

    let agent = Agent::new().with_stream_fn(stream_fn);
    agent.set_model(test_model("scripted"));
    agent.prompt("hi").await.unwrap();

    assert_eq!(agent.error().as_deref(), Some("overloaded"));
    assert!(agent.stream_message().is_none());
    assert!(agent.pending_tool_calls().is_empty());
    match agent.messages().last().unwrap() {
        Message::Assistant(a) => assert_eq!(a.stop_reason, StopReason::Error),
        other => panic!("expected assistant, got {other:?}"),
    }
}

#[tokio::test]
async fn all_mode_drains_the_whole_queue_at_once() {
    use unillm_agent::QueueMode;

    let agent = Agent::new()
        .with_follow_up_mode(QueueMode::All)
        .with_stream_fn(scripted_stream_fn(vec![
            assistant_text("first"),
            assistant_text("second"),
        ]));
    agent.set_model(test_model("scripted"));
    agent.follow_up(Message::user("a"));
    agent.follow_up(Message::user("b"));
    assert!(agent.has_queued_messages());

    agent.prompt("start").await.unwrap();

    let texts: Vec<String> = agent
        .messages()
        .iter()
        .map(|m| match m {
            Message::User(u) => format!("user:{}", u.content.to_text()),
            Message::Assistant(a) => format!("assistant:{}", a.text()),
            Message::ToolResult(tr) => format!("tool:{}", tr.text()),
        })
        .collect();
    // Both follow-ups entered one turn.
    assert_eq!(
        texts,
        vec![
            "user:start",
            "assistant:first",
            "user:a",
            "user:b",
            "assistant:second",
        ]
    );
    assert!(!agent.has_queued_messages());

    agent.reset();
    assert!(agent.messages().is_empty());
}

#[tokio::test]
async fn listener_panic_does_not_abort_the_run() {
    let agent = Agent::new().with_stream_fn(scripted_stream_fn(vec![assistant_text("hi")]));
    agent.set_model(test_model("scripted"));
    agent.subscribe(|_| panic!("listener bug"));

    agent.prompt("hello").await.unwrap();
    assert_eq!(agent.messages().len(), 2);
}
