//! Server-sent events framing.
//!
//! The agent service writes one `data: {json}` event per chunk, separated by
//! blank lines. [`SseDecoder`] buffers raw bytes, so a UTF-8 sequence or a
//! line split across network reads is reassembled before it is interpreted.

use std::collections::VecDeque;
use std::fmt::Display;

use futures_util::{Stream, StreamExt, stream};

use super::transport::EventStream;
use crate::error::StreamError;

/// Sentinel some backends send after the last real event.
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every event payload completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(event) = self.line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush an event left unterminated when the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest);
        let text = text.trim_end_matches('\r');
        if !text.is_empty() {
            self.line(text);
        }
        self.dispatch()
    }

    /// Interpret one line; a blank line completes the pending event.
    fn line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_owned());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        if payload.trim() == DONE_SENTINEL {
            return None;
        }
        Some(payload)
    }
}

struct SseState<S> {
    inner: std::pin::Pin<Box<S>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    finished: bool,
}

/// Turn a byte stream into a stream of SSE event payloads.
///
/// A read error is yielded once and ends the stream.
pub fn sse_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        inner: Box::pin(bytes),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.push(bytes.as_ref());
                    state.ready.extend(events);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(StreamError::Transport(e.to_string())), state));
                }
                None => {
                    state.finished = true;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    }))
}

#[cfg(test)]
#[path = "sse_test.rs"]
mod tests;
