//! Line-wise Server-Sent-Events parsing over a reqwest byte stream.
//!
//! Responses are parsed as `event:` / `data:` pairs; comment lines and
//! anything malformed are skipped. Providers differ in whether they name
//! events (`event: content_block_delta`) or send bare `data:` lines, so
//! an event is emitted on each `data:` line, carrying the most recent
//! `event:` name if one was seen.

use tokio_util::sync::CancellationToken;

/// One server-sent event: the event name (empty when the server sent only
/// `data:` lines) and the data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Reads SSE events from a streaming HTTP response body.
pub struct SseReader {
    response: reqwest::Response,
    buffer: String,
    pending_event: String,
    cancel: CancellationToken,
}

impl SseReader {
    pub fn new(response: reqwest::Response, cancel: CancellationToken) -> Self {
        Self {
            response,
            buffer: String::new(),
            pending_event: String::new(),
            cancel,
        }
    }

    /// The next event, `None` at end of stream.
    ///
    /// Errors on transport failure or when the cancel signal fires while
    /// awaiting the next chunk.
    pub async fn next(&mut self) -> Result<Option<SseEvent>, SseError> {
        loop {
            if let Some(event) = self.next_buffered() {
                return Ok(Some(event));
            }

            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SseError::Aborted),
                chunk = self.response.chunk() => chunk,
            };

            match chunk {
                Ok(Some(bytes)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Ok(None) => return Ok(self.flush_tail()),
                Err(e) => return Err(SseError::Transport(e.to_string())),
            }
        }
    }

    /// Drain one complete event from the buffered lines, if any.
    fn next_buffered(&mut self) -> Option<SseEvent> {
        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);

            if let Some(event) = self.consume_line(&line) {
                return Some(event);
            }
        }
        None
    }

    /// A final `data:` line without a trailing newline still counts.
    fn flush_tail(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        let line = line.trim_end_matches('\r').to_string();
        self.consume_line(&line)
    }

    fn consume_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() || line.starts_with(':') {
            return None;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.pending_event = name.trim().to_string();
            return None;
        }
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                return None;
            }
            return Some(SseEvent {
                event: std::mem::take(&mut self.pending_event),
                data: data.to_string(),
            });
        }
        // Malformed line; skip.
        None
    }
}

/// Failure while reading an SSE stream.
#[derive(Debug)]
pub enum SseError {
    Transport(String),
    Aborted,
}

impl std::fmt::Display for SseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Stream interrupted: {msg}"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl std::error::Error for SseError {}

impl SseError {
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
