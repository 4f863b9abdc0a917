//! The normalized assistant-message event vocabulary and the push/pull
//! event stream primitive.
//!
//! Every provider adapter translates its wire protocol into the same set
//! of events. Each event carries a `partial` snapshot of the in-progress
//! `AssistantMessage` with all deltas so far applied, so consumers can
//! render live output without replaying deltas themselves.
//!
//! The stream is one-producer/one-consumer: the producer runs as a
//! background task owned by the stream, `push` never blocks, events are
//! delivered in push order, and the first `Done`/`Error` event latches the
//! final result. Dropping the stream aborts the producer task.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::{AssistantMessage, StopReason, ToolCall};

/// Events emitted while streaming one assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantMessageEvent {
    /// The request is in flight; `partial` is the empty message shell.
    Start { partial: AssistantMessage },

    TextStart {
        content_index: usize,
        partial: AssistantMessage,
    },
    TextDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    TextEnd {
        content_index: usize,
        content: String,
        partial: AssistantMessage,
    },

    ThinkingStart {
        content_index: usize,
        partial: AssistantMessage,
    },
    ThinkingDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    ThinkingEnd {
        content_index: usize,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        partial: AssistantMessage,
    },

    ToolCallStart {
        content_index: usize,
        partial: AssistantMessage,
    },
    /// `delta` is the raw argument-string fragment; concatenating all
    /// deltas of a block reproduces the final argument JSON exactly.
    ToolCallDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    ToolCallEnd {
        content_index: usize,
        tool_call: ToolCall,
        partial: AssistantMessage,
    },

    Done {
        reason: StopReason,
        message: AssistantMessage,
    },
    Error {
        reason: StopReason,
        error: AssistantMessage,
    },
}

impl AssistantMessageEvent {
    /// The partial (or final) message carried by this event.
    pub fn partial(&self) -> &AssistantMessage {
        match self {
            Self::Start { partial }
            | Self::TextStart { partial, .. }
            | Self::TextDelta { partial, .. }
            | Self::TextEnd { partial, .. }
            | Self::ThinkingStart { partial, .. }
            | Self::ThinkingDelta { partial, .. }
            | Self::ThinkingEnd { partial, .. }
            | Self::ToolCallStart { partial, .. }
            | Self::ToolCallDelta { partial, .. }
            | Self::ToolCallEnd { partial, .. } => partial,
            Self::Done { message, .. } => message,
            Self::Error { error, .. } => error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Producer half of an event stream.
///
/// `push` enqueues without blocking; the first terminal event (as judged
/// by the extractor passed at construction) latches the stream result and
/// later pushes are dropped. `end` closes the stream and is idempotent.
pub struct EventSink<T, R> {
    inner: std::sync::Arc<SinkInner<T, R>>,
}

struct SinkInner<T, R> {
    state: std::sync::Mutex<SinkState<T, R>>,
    extract: Box<dyn Fn(&T) -> Option<R> + Send + Sync>,
}

struct SinkState<T, R> {
    tx: Option<mpsc::UnboundedSender<T>>,
    result_tx: Option<oneshot::Sender<R>>,
    done: bool,
}

impl<T, R> Clone for EventSink<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, R> EventSink<T, R> {
    /// Push an event into the stream. No-op once the stream is done.
    pub fn push(&self, event: T) {
        let mut state = self.inner.state.lock().unwrap();
        if state.done {
            return;
        }
        if let Some(result) = (self.inner.extract)(&event) {
            state.done = true;
            if let Some(tx) = state.result_tx.take() {
                let _ = tx.send(result);
            }
        }
        if let Some(tx) = &state.tx {
            let _ = tx.send(event);
        }
    }

    /// Close the stream. Idempotent. Events already queued are still
    /// delivered; iteration terminates after them.
    pub fn end(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.done = true;
        state.tx = None;
    }
}

/// Consumer half of an event stream.
#[derive(Debug)]
pub struct EventStream<T, R> {
    rx: mpsc::UnboundedReceiver<T>,
    result_rx: oneshot::Receiver<R>,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static, R: Send + 'static> EventStream<T, R> {
    /// Create a connected sink/stream pair. `extract` returns `Some(result)`
    /// for the terminal event that latches the stream result.
    pub fn channel<F>(extract: F) -> (EventSink<T, R>, EventStream<T, R>)
    where
        F: Fn(&T) -> Option<R> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let sink = EventSink {
            inner: std::sync::Arc::new(SinkInner {
                state: std::sync::Mutex::new(SinkState {
                    tx: Some(tx),
                    result_tx: Some(result_tx),
                    done: false,
                }),
                extract: Box::new(extract),
            }),
        };
        let stream = EventStream {
            rx,
            result_rx,
            task: None,
        };
        (sink, stream)
    }

    /// Attach the background producer task so its lifetime matches the
    /// stream's. The task is aborted when the stream is dropped.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Await the next event, or `None` once the stream has ended and all
    /// queued events were delivered.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Await the latched result of the terminal event. Fails if the
    /// producer went away without pushing one.
    pub async fn await_result(mut self) -> Result<R> {
        // Polled by reference: the `Drop` impl keeps the field in place.
        (&mut self.result_rx)
            .await
            .map_err(|_| Error::Internal("stream ended without a terminal event".into()))
    }
}

impl<T, R> Drop for EventStream<T, R> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Stream of normalized assistant-message events with a latched final
/// message. `result()` fails when the stream terminated in an error event.
pub type AssistantMessageStream =
    EventStream<AssistantMessageEvent, std::result::Result<AssistantMessage, Error>>;

/// Producer half for assistant-message streams.
pub type AssistantMessageSink =
    EventSink<AssistantMessageEvent, std::result::Result<AssistantMessage, Error>>;

/// Create a connected sink/stream pair for assistant-message events.
pub fn assistant_message_channel() -> (AssistantMessageSink, AssistantMessageStream) {
    EventStream::channel(|event| match event {
        AssistantMessageEvent::Done { message, .. } => Some(Ok(message.clone())),
        AssistantMessageEvent::Error { error, .. } => {
            Some(Err(Error::Stream(Box::new(error.clone()))))
        }
        _ => None,
    })
}

impl AssistantMessageStream {
    /// Await the final `AssistantMessage`, failing on an error event.
    pub async fn result(self) -> Result<AssistantMessage> {
        self.await_result().await?
    }
}
