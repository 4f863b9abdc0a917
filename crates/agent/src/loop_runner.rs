//! The agent loop: multi-turn tool-calling conversations with mid-run
//! steering, queued follow-ups, and cooperative cancellation.
//!
//! Agent messages convert to LLM messages only at the call boundary.
//! Tool calls execute sequentially in content order so histories stay
//! deterministic and steering can preempt the remaining calls.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use unillm_core::event::AssistantMessageEvent;
use unillm_core::message::{AssistantMessage, Message, StopReason, Tool, ToolCall, ToolResultMessage};
use unillm_core::provider::{stream_simple, SimpleStreamOptions};
use unillm_core::validation::validate_tool_arguments;
use unillm_core::{Context, Error, Result};

use crate::types::{
    agent_event_channel, AgentContext, AgentEvent, AgentEventSink, AgentEventStream,
    AgentLoopConfig, AgentMessage, AgentTool, AgentToolResult, ToolUpdateFn,
};

/// Text of the error result given to tool calls preempted by steering.
pub const SKIPPED_BY_STEERING: &str = "Skipped due to queued user message";

/// Start an agent loop with new prompt messages.
pub fn agent_loop(
    prompts: Vec<AgentMessage>,
    context: AgentContext,
    config: AgentLoopConfig,
    cancel: CancellationToken,
) -> AgentEventStream {
    let (sink, stream) = agent_event_channel();

    let task = tokio::spawn(async move {
        let mut current = AgentContext {
            system_prompt: context.system_prompt.clone(),
            messages: context
                .messages
                .iter()
                .cloned()
                .chain(prompts.iter().cloned())
                .collect(),
            tools: context.tools.clone(),
        };
        let mut new_messages: Vec<AgentMessage> = prompts.clone();

        sink.push(AgentEvent::AgentStart);
        sink.push(AgentEvent::TurnStart);
        for prompt in &prompts {
            sink.push(AgentEvent::MessageStart {
                message: prompt.clone(),
            });
            sink.push(AgentEvent::MessageEnd {
                message: prompt.clone(),
            });
        }

        run_loop(&mut current, &mut new_messages, &config, &cancel, &sink).await;
        sink.end();
    });

    stream.with_task(task)
}

/// Continue an agent loop from existing context without new prompts.
/// Fails when there is nothing to continue from.
pub fn agent_loop_continue(
    context: AgentContext,
    config: AgentLoopConfig,
    cancel: CancellationToken,
) -> Result<AgentEventStream> {
    let Some(last) = context.messages.last() else {
        return Err(Error::InvalidInput("Cannot continue: no messages in context".into()));
    };
    if matches!(last, Message::Assistant(_)) {
        return Err(Error::InvalidInput(
            "Cannot continue from message role: assistant".into(),
        ));
    }

    let (sink, stream) = agent_event_channel();

    let task = tokio::spawn(async move {
        let mut current = context;
        let mut new_messages: Vec<AgentMessage> = Vec::new();

        sink.push(AgentEvent::AgentStart);
        sink.push(AgentEvent::TurnStart);

        run_loop(&mut current, &mut new_messages, &config, &cancel, &sink).await;
        sink.end();
    });

    Ok(stream.with_task(task))
}

fn drain_queue(queue: &Option<crate::types::QueueFn>) -> Vec<AgentMessage> {
    queue.as_ref().map(|f| f()).unwrap_or_default()
}

async fn run_loop(
    context: &mut AgentContext,
    new_messages: &mut Vec<AgentMessage>,
    config: &AgentLoopConfig,
    cancel: &CancellationToken,
    sink: &AgentEventSink,
) {
    let mut first_turn = true;
    let mut pending = drain_queue(&config.get_steering_messages);

    loop {
        let mut has_more_tool_calls = true;

        while has_more_tool_calls || !pending.is_empty() {
            if !first_turn {
                sink.push(AgentEvent::TurnStart);
            } else {
                first_turn = false;
            }

            for message in pending.drain(..) {
                sink.push(AgentEvent::MessageStart {
                    message: message.clone(),
                });
                sink.push(AgentEvent::MessageEnd {
                    message: message.clone(),
                });
                context.messages.push(message.clone());
                new_messages.push(message);
            }

            let message = stream_assistant_response(context, config, cancel, sink).await;
            new_messages.push(Message::Assistant(message.clone()));

            if message.stop_reason.is_terminal_failure() {
                sink.push(AgentEvent::TurnEnd {
                    message: Message::Assistant(message),
                    tool_results: Vec::new(),
                });
                sink.push(AgentEvent::AgentEnd {
                    messages: new_messages.clone(),
                });
                return;
            }

            let tool_calls: Vec<ToolCall> =
                message.tool_calls().into_iter().cloned().collect();
            has_more_tool_calls = !tool_calls.is_empty();

            let mut tool_results: Vec<ToolResultMessage> = Vec::new();
            let mut steering_after_tools: Option<Vec<AgentMessage>> = None;

            if has_more_tool_calls {
                let execution =
                    execute_tool_calls(&context.tools, &tool_calls, config, cancel, sink).await;
                steering_after_tools = execution.steering;
                tool_results = execution.results;

                for result in &tool_results {
                    context.messages.push(Message::ToolResult(result.clone()));
                    new_messages.push(Message::ToolResult(result.clone()));
                }
            }

            sink.push(AgentEvent::TurnEnd {
                message: Message::Assistant(message),
                tool_results,
            });

            if cancel.is_cancelled() {
                sink.push(AgentEvent::AgentEnd {
                    messages: new_messages.clone(),
                });
                return;
            }

            pending = match steering_after_tools {
                Some(steering) => steering,
                None => drain_queue(&config.get_steering_messages),
            };
        }

        let follow_up = drain_queue(&config.get_follow_up_messages);
        if !follow_up.is_empty() {
            pending = follow_up;
            continue;
        }
        break;
    }

    sink.push(AgentEvent::AgentEnd {
        messages: new_messages.clone(),
    });
}

/// Call the LLM and forward its events, keeping the in-progress message
/// visible as the last context entry. Returns the final assistant
/// message, which carries `error`/`aborted` stop reasons instead of
/// failing the loop.
async fn stream_assistant_response(
    context: &mut AgentContext,
    config: &AgentLoopConfig,
    cancel: &CancellationToken,
    sink: &AgentEventSink,
) -> AssistantMessage {
    let llm_messages = match &config.convert_to_llm {
        Some(convert) => convert(&context.messages),
        None => context.messages.clone(),
    };

    let llm_context = Context {
        system_prompt: if context.system_prompt.is_empty() {
            None
        } else {
            Some(context.system_prompt.clone())
        },
        messages: llm_messages,
        tools: context
            .tools
            .iter()
            .map(|tool| Tool {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect(),
    };

    let options = SimpleStreamOptions {
        reasoning: config.reasoning,
        session_id: config.session_id.clone(),
        thinking_budgets: config.thinking_budgets,
        api_key: config.api_key.clone(),
        cancel: Some(cancel.clone()),
        ..SimpleStreamOptions::default()
    };

    debug!(model = %config.model.id, messages = llm_context.messages.len(), "Requesting assistant turn");

    let stream = match &config.stream_fn {
        Some(stream_fn) => stream_fn(&config.model, &llm_context, options),
        None => stream_simple(&config.model, &llm_context, options),
    };
    let mut stream = match stream {
        Ok(stream) => stream,
        Err(error) => {
            // Construction failures (unknown api, missing key) become an
            // errored message so the caller sees a normal terminal turn.
            let message = failure_message(config, cancel, &error.to_string());
            context.messages.push(Message::Assistant(message.clone()));
            sink.push(AgentEvent::MessageStart {
                message: Message::Assistant(message.clone()),
            });
            sink.push(AgentEvent::MessageEnd {
                message: Message::Assistant(message.clone()),
            });
            return message;
        }
    };

    let mut added_partial = false;

    while let Some(event) = stream.next().await {
        match &event {
            AssistantMessageEvent::Start { partial } => {
                context.messages.push(Message::Assistant(partial.clone()));
                added_partial = true;
                sink.push(AgentEvent::MessageStart {
                    message: Message::Assistant(partial.clone()),
                });
            }

            AssistantMessageEvent::Done { message, .. }
            | AssistantMessageEvent::Error {
                error: message, ..
            } => {
                let message = message.clone();
                if added_partial {
                    if let Some(last) = context.messages.last_mut() {
                        *last = Message::Assistant(message.clone());
                    }
                } else {
                    context.messages.push(Message::Assistant(message.clone()));
                    sink.push(AgentEvent::MessageStart {
                        message: Message::Assistant(message.clone()),
                    });
                }
                sink.push(AgentEvent::MessageEnd {
                    message: Message::Assistant(message.clone()),
                });
                return message;
            }

            _ => {
                if added_partial {
                    let partial = event.partial().clone();
                    if let Some(last) = context.messages.last_mut() {
                        *last = Message::Assistant(partial.clone());
                    }
                    sink.push(AgentEvent::MessageUpdate {
                        message: Message::Assistant(partial),
                        event: event.clone(),
                    });
                }
            }
        }
    }

    // The stream went away without a terminal event.
    let message = failure_message(config, cancel, "stream ended without a terminal event");
    if added_partial {
        if let Some(last) = context.messages.last_mut() {
            *last = Message::Assistant(message.clone());
        }
    } else {
        context.messages.push(Message::Assistant(message.clone()));
        sink.push(AgentEvent::MessageStart {
            message: Message::Assistant(message.clone()),
        });
    }
    sink.push(AgentEvent::MessageEnd {
        message: Message::Assistant(message.clone()),
    });
    message
}

fn failure_message(config: &AgentLoopConfig, cancel: &CancellationToken, error: &str) -> AssistantMessage {
    AssistantMessage {
        api: config.model.api.clone(),
        provider: config.model.provider.clone(),
        model: config.model.id.clone(),
        stop_reason: if cancel.is_cancelled() {
            StopReason::Aborted
        } else {
            StopReason::Error
        },
        error_message: Some(error.to_string()),
        ..AssistantMessage::default()
    }
}

struct ToolExecution {
    results: Vec<ToolResultMessage>,
    steering: Option<Vec<AgentMessage>>,
}

/// Execute tool calls sequentially in content order.
///
/// Before each call the cancel signal and the steering queue are
/// checked; queued steering skips the remaining calls with error results
/// so every call still gets a result message.
async fn execute_tool_calls(
    tools: &[Arc<dyn AgentTool>],
    tool_calls: &[ToolCall],
    config: &AgentLoopConfig,
    cancel: &CancellationToken,
    sink: &AgentEventSink,
) -> ToolExecution {
    let mut results: Vec<ToolResultMessage> = Vec::new();
    let mut steering: Option<Vec<AgentMessage>> = None;

    for (index, tool_call) in tool_calls.iter().enumerate() {
        if cancel.is_cancelled() {
            for remaining in &tool_calls[index..] {
                results.push(skip_tool_call(remaining, "Request aborted", sink));
            }
            break;
        }

        let queued = drain_queue(&config.get_steering_messages);
        if !queued.is_empty() {
            steering = Some(queued);
            for remaining in &tool_calls[index..] {
                results.push(skip_tool_call(remaining, SKIPPED_BY_STEERING, sink));
            }
            break;
        }

        sink.push(AgentEvent::ToolExecutionStart {
            tool_call_id: tool_call.id.clone(),
            tool_name: tool_call.name.clone(),
            args: tool_call.arguments.clone(),
        });

        let (result, is_error) = run_single_tool(tools, tool_call, cancel, sink).await;

        sink.push(AgentEvent::ToolExecutionEnd {
            tool_call_id: tool_call.id.clone(),
            tool_name: tool_call.name.clone(),
            result: result.clone(),
            is_error,
        });

        let message = ToolResultMessage {
            tool_call_id: tool_call.id.clone(),
            tool_name: tool_call.name.clone(),
            content: result.content,
            details: result.details,
            is_error,
            timestamp: chrono::Utc::now(),
        };
        sink.push(AgentEvent::MessageStart {
            message: Message::ToolResult(message.clone()),
        });
        sink.push(AgentEvent::MessageEnd {
            message: Message::ToolResult(message.clone()),
        });
        results.push(message);
    }

    ToolExecution { results, steering }
}

/// Validate and run one tool call. Failures become error results; they
/// never fail the run.
async fn run_single_tool(
    tools: &[Arc<dyn AgentTool>],
    tool_call: &ToolCall,
    cancel: &CancellationToken,
    sink: &AgentEventSink,
) -> (AgentToolResult, bool) {
    let Some(tool) = tools.iter().find(|t| t.name() == tool_call.name) else {
        return (
            AgentToolResult::text(format!("Tool {} not found", tool_call.name)),
            true,
        );
    };

    let errors = validate_tool_arguments(&tool.parameters_schema(), &tool_call.arguments);
    if !errors.is_empty() {
        warn!(tool = %tool_call.name, "Tool call arguments failed validation");
        return (
            AgentToolResult::text(format!("Invalid arguments: {}", errors.join("; "))),
            true,
        );
    }

    let update_sink = sink_update_fn(tool_call, sink);
    match tool
        .execute(&tool_call.id, &tool_call.arguments, cancel.clone(), update_sink)
        .await
    {
        Ok(result) => (result, false),
        Err(error) => {
            warn!(tool = %tool_call.name, error = %error, "Tool execution failed");
            (AgentToolResult::text(error.to_string()), true)
        }
    }
}

fn sink_update_fn(tool_call: &ToolCall, sink: &AgentEventSink) -> ToolUpdateFn {
    // The sink side is cheap to clone through the shared channel; the
    // callback owns its own copies of the call coordinates.
    let tool_call_id = tool_call.id.clone();
    let tool_name = tool_call.name.clone();
    let args = tool_call.arguments.clone();
    let sink = sink.clone();
    Arc::new(move |partial| {
        sink.push(AgentEvent::ToolExecutionUpdate {
            tool_call_id: tool_call_id.clone(),
            tool_name: tool_name.clone(),
            args: args.clone(),
            partial_result: partial,
        });
    })
}

fn skip_tool_call(tool_call: &ToolCall, reason: &str, sink: &AgentEventSink) -> ToolResultMessage {
    let result = AgentToolResult::text(reason);

    sink.push(AgentEvent::ToolExecutionStart {
        tool_call_id: tool_call.id.clone(),
        tool_name: tool_call.name.clone(),
        args: tool_call.arguments.clone(),
    });
    sink.push(AgentEvent::ToolExecutionEnd {
        tool_call_id: tool_call.id.clone(),
        tool_name: tool_call.name.clone(),
        result: result.clone(),
        is_error: true,
    });

    let message = ToolResultMessage {
        tool_call_id: tool_call.id.clone(),
        tool_name: tool_call.name.clone(),
        content: result.content,
        details: None,
        is_error: true,
        timestamp: chrono::Utc::now(),
    };
    sink.push(AgentEvent::MessageStart {
        message: Message::ToolResult(message.clone()),
    });
    sink.push(AgentEvent::MessageEnd {
        message: Message::ToolResult(message.clone()),
    });
    message
}
