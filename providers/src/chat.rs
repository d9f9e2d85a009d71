//! Provider-neutral streaming turn driver.
//!
//! One call to [`run_turn`] consumes one HTTP response body: it frames
//! `data:` lines as bytes arrive, hands each record to the backend's parser,
//! forwards text deltas to the caller, and accumulates tool calls and usage
//! until the response completes. The tool-call loop that resubmits results
//! lives in each backend because the follow-up request shape differs.

use std::{mem, str};
use std::time::Duration;

use crag_types::Usage;
use futures_util::StreamExt;
use tokio::time::timeout;

use crate::{
    MAX_SSE_BUFFER_BYTES, ProviderError, SseParser, StreamEvent, StreamHandlers, ToolCall,
    drain_next_sse_line, extract_sse_data,
};

/// Granularity at which cancellation is checked while waiting for bytes.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Accumulated state of one completed response.
#[derive(Debug, Default)]
pub(crate) struct TurnState {
    pub response_id: Option<String>,
    pub usage: Usage,
    pub tool_calls: Vec<ToolCall>,
    current_call: Option<(String, String)>,
    args: String,
}

#[derive(Debug)]
pub(crate) enum TurnOutcome {
    Completed(TurnState),
    Cancelled,
}

enum Flow {
    Continue,
    Done,
}

impl TurnState {
    fn apply(
        &mut self,
        event: StreamEvent,
        on_text: &mut (dyn FnMut(&str) + Send),
    ) -> Result<Flow, ProviderError> {
        match event {
            StreamEvent::Created { id } => {
                if !id.is_empty() {
                    self.response_id = Some(id);
                }
            }
            StreamEvent::TextDelta(text) => {
                if !text.is_empty() {
                    on_text(&text);
                }
            }
            StreamEvent::ToolCallStarted { call_id, name } => {
                self.current_call = Some((call_id, name));
                self.args.clear();
            }
            StreamEvent::ToolCallArgsDelta(delta) => self.args.push_str(&delta),
            StreamEvent::ToolCallDone {
                call_id,
                name,
                arguments,
            } => {
                let accumulated = mem::take(&mut self.args);
                let raw = if arguments.is_empty() {
                    accumulated
                } else {
                    arguments
                };
                let (started_id, started_name) = self.current_call.take().unwrap_or_default();
                let call_id = if call_id.is_empty() { started_id } else { call_id };
                let name = if name.is_empty() { started_name } else { name };
                tracing::debug!(%call_id, %name, "Tool call finalized");
                self.tool_calls
                    .push(ToolCall::from_raw_arguments(call_id, name, &raw));
            }
            StreamEvent::Usage(usage) => self.usage = usage,
            StreamEvent::Error(message) => return Err(ProviderError::Remote(message)),
            StreamEvent::Completed => return Ok(Flow::Done),
        }
        Ok(Flow::Continue)
    }
}

/// Consume one streaming response until it completes, fails, or is cancelled.
///
/// Malformed individual records are skipped with a warning. Buffer overflow,
/// invalid UTF-8, an idle stream, and end of stream without a completion
/// record are terminal.
pub(crate) async fn run_turn<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    handlers: &mut StreamHandlers<'_>,
    idle_timeout: Duration,
) -> Result<TurnOutcome, ProviderError> {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut state = TurnState::default();
    let mut idle = Duration::ZERO;

    loop {
        if handlers.is_cancelled() {
            tracing::debug!(provider = parser.provider_name(), "Stream cancelled");
            return Ok(TurnOutcome::Cancelled);
        }

        let next = match timeout(CANCEL_POLL_INTERVAL, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                idle += CANCEL_POLL_INTERVAL;
                if idle >= idle_timeout {
                    return Err(ProviderError::Transport(format!(
                        "stream idle for {}s",
                        idle_timeout.as_secs()
                    )));
                }
                continue;
            }
        };
        idle = Duration::ZERO;

        let Some(chunk) = next else { break };
        buffer.extend_from_slice(&chunk?);

        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            return Err(ProviderError::Protocol(
                "stream buffer exceeded maximum size (4 MiB)".to_string(),
            ));
        }

        while let Some(line) = drain_next_sse_line(&mut buffer) {
            if let Some(outcome) = process_line(&line, parser, handlers, &mut state)? {
                return Ok(match outcome {
                    LineOutcome::Done => TurnOutcome::Completed(state),
                    LineOutcome::Cancelled => TurnOutcome::Cancelled,
                });
            }
        }
    }

    // A final record may arrive without a trailing newline.
    if !buffer.is_empty() {
        let line = mem::take(&mut buffer);
        if let Some(outcome) = process_line(&line, parser, handlers, &mut state)? {
            return Ok(match outcome {
                LineOutcome::Done => TurnOutcome::Completed(state),
                LineOutcome::Cancelled => TurnOutcome::Cancelled,
            });
        }
    }

    Err(ProviderError::Protocol(
        "connection closed before the response completed".to_string(),
    ))
}

enum LineOutcome {
    Done,
    Cancelled,
}

fn process_line<P: SseParser>(
    line: &[u8],
    parser: &mut P,
    handlers: &mut StreamHandlers<'_>,
    state: &mut TurnState,
) -> Result<Option<LineOutcome>, ProviderError> {
    let Ok(line) = str::from_utf8(line) else {
        return Err(ProviderError::Protocol(
            "received invalid UTF-8 from stream".to_string(),
        ));
    };
    let Some(data) = extract_sse_data(line) else {
        return Ok(None);
    };
    if data.is_empty() {
        return Ok(None);
    }
    if data == "[DONE]" {
        return Ok(Some(LineOutcome::Done));
    }

    let json = match serde_json::from_str::<serde_json::Value>(data) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(
                %e,
                payload_bytes = data.len(),
                provider = parser.provider_name(),
                "Skipping malformed stream record"
            );
            return Ok(None);
        }
    };

    for event in parser.parse(&json) {
        if handlers.is_cancelled() {
            return Ok(Some(LineOutcome::Cancelled));
        }
        if let Flow::Done = state.apply(event, &mut *handlers.on_text)? {
            return Ok(Some(LineOutcome::Done));
        }
    }
    Ok(None)
}
