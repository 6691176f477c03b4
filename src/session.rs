//! Chat session: the boundary the UI talks to.
//!
//! DESIGN
//! ======
//! A session owns one conversation and publishes it on a `watch` channel
//! after every mutation. `submit` takes `&mut self` and runs the whole stream
//! before returning, so two live streams against one session cannot exist.
//! Cancellation comes from outside through a [`CancellationToken`] handed out
//! by [`ChatSession::cancel_handle`].
//!
//! Outcomes
//! --------
//! Opening the stream can fail outright (`Err`). Once open, every ending is
//! an `Ok(StreamOutcome)`; failures and timeouts also raise a [`Notice`]. The
//! partially built message is never rolled back.

use std::sync::Arc;
use std::time::Duration;

use chunks::{ChunkKind, FlowType, decode_chunk};
use futures_util::StreamExt;
use phases::Transition;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{HistoryError, Notice, StreamError};
use crate::mentions::extract_mentions;
use crate::net::history::{HistoryRecord, HistorySource};
use crate::net::transport::{ChatRequest, ChunkTransport, EventStream};
use crate::state::conversation::{ApplyOutcome, Conversation, ProcessedMessage};
use crate::state::reconcile::{SkipLatch, dedup_messages, merge_history};
use crate::state::replay::replay;

/// How a submitted stream ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The flow's terminal phase completed.
    Completed,
    /// The stream ended before the terminal phase completed.
    Ended,
    /// The caller cancelled the stream.
    Cancelled,
    /// The stream did not open, or no event arrived, within the idle window.
    TimedOut,
    /// The transport broke or the agent reported an error.
    Failed(StreamError),
}

/// Result of a history load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryLoad {
    /// The skip latch was armed; nothing was applied.
    Skipped,
    /// The session moved to another chat while the fetch was in flight.
    Stale,
    /// History was applied; the conversation now holds this many messages.
    Loaded { messages: usize },
}

/// Fetched history tagged with the chat it was fetched for.
#[derive(Debug)]
pub struct HistoryBatch {
    pub chat_id: String,
    pub result: Result<Vec<HistoryRecord>, HistoryError>,
}

pub struct ChatSession {
    transport: Arc<dyn ChunkTransport>,
    history: Arc<dyn HistorySource>,
    user_id: String,
    idle_timeout: Duration,
    state: watch::Sender<Conversation>,
    latch: SkipLatch,
    cancel: CancellationToken,
    notices: Vec<Notice>,
}

impl ChatSession {
    #[must_use]
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        history: Arc<dyn HistorySource>,
        user_id: impl Into<String>,
        chat_id: impl Into<String>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            history,
            user_id: user_id.into(),
            idle_timeout,
            state: watch::Sender::new(Conversation::new(chat_id)),
            latch: SkipLatch::default(),
            cancel: CancellationToken::new(),
            notices: Vec::new(),
        }
    }

    #[must_use]
    pub fn chat_id(&self) -> String {
        self.state.borrow().chat_id().to_owned()
    }

    /// Current messages, cloned out of the published snapshot.
    #[must_use]
    pub fn messages(&self) -> Vec<ProcessedMessage> {
        self.state.borrow().messages().to_vec()
    }

    #[must_use]
    pub fn snapshot(&self) -> Conversation {
        self.state.borrow().clone()
    }

    /// Receiver that sees a new snapshot after every mutation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Conversation> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn latch(&self) -> &SkipLatch {
        &self.latch
    }

    #[must_use]
    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Token that cancels the next (or current) stream of this session.
    #[must_use]
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Replace the message list from the UI side.
    pub fn set_messages(&mut self, messages: Vec<ProcessedMessage>) {
        self.latch.arm();
        let messages = dedup_messages(messages);
        self.state.send_modify(|conv| conv.replace(messages));
    }

    /// Drop the current conversation and any stream tied to it.
    pub fn switch_chat(&mut self, chat_id: impl Into<String>) {
        let chat_id = chat_id.into();
        tracing::info!(chat_id = %chat_id, "switching chat");
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.latch.disarm();
        self.notices.clear();
        self.state.send_modify(|conv| conv.reset(chat_id));
    }

    /// Submit a query and let the agent's router pick the flow.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError`] when the stream cannot be opened.
    pub async fn submit(&mut self, query: &str) -> Result<StreamOutcome, StreamError> {
        self.submit_with_flow(query, None).await
    }

    /// Submit a query, stream the answer into the conversation, and report
    /// how the stream ended.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError`] when the stream cannot be opened.
    pub async fn submit_with_flow(
        &mut self,
        query: &str,
        flow: Option<FlowType>,
    ) -> Result<StreamOutcome, StreamError> {
        // A token cancelled before this stream began belongs to an earlier one.
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        let cancel = self.cancel.clone();

        let request = ChatRequest {
            user_id: self.user_id.clone(),
            chat_id: self.chat_id(),
            query: query.to_owned(),
            flow_type: flow,
            context_files: extract_mentions(query),
        };

        self.latch.arm();
        self.state.send_modify(|conv| {
            conv.push_user(query);
            conv.begin_assistant(flow);
        });

        let result = self.run_stream(&request, &cancel).await;
        self.cancel = CancellationToken::new();

        match &result {
            Ok(StreamOutcome::Failed(e)) | Err(e) => {
                let reason = e.to_string();
                self.state.send_modify(|conv| {
                    conv.fail_streaming(&reason);
                });
                self.raise(e);
            }
            Ok(StreamOutcome::TimedOut) => {
                self.state.send_modify(|conv| {
                    conv.finish_streaming();
                });
                self.raise(&StreamError::IdleTimeout { secs: self.idle_timeout.as_secs() });
            }
            Ok(outcome) => {
                tracing::info!(chat_id = %request.chat_id, ?outcome, "stream finished");
                self.state.send_modify(|conv| {
                    conv.finish_streaming();
                });
            }
        }
        result
    }

    async fn run_stream(
        &mut self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, StreamError> {
        let mut events: EventStream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            opened = tokio::time::timeout(self.idle_timeout, self.transport.open(request)) => match opened {
                Err(_elapsed) => return Ok(StreamOutcome::TimedOut),
                Ok(opened) => opened?,
            },
        };

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
                next = tokio::time::timeout(self.idle_timeout, events.next()) => next,
            };
            let raw = match next {
                Err(_elapsed) => return Ok(StreamOutcome::TimedOut),
                Ok(None) => return Ok(StreamOutcome::Ended),
                Ok(Some(Err(e))) => return Ok(StreamOutcome::Failed(e)),
                Ok(Some(Ok(raw))) => raw,
            };

            let chunk = match decode_chunk(&raw) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed chunk");
                    continue;
                }
            };
            let server_error = match &chunk.kind {
                ChunkKind::Error { message } => Some(message.clone()),
                _ => None,
            };
            let finished = matches!(chunk.kind, ChunkKind::Finish);

            let mut applied = None;
            self.state.send_modify(|conv| applied = Some(conv.apply_chunk(chunk)));

            if let Some(message) = server_error {
                return Ok(StreamOutcome::Failed(StreamError::Server(message)));
            }
            if matches!(applied, Some(ApplyOutcome::Applied { transition: Transition::Completed, .. })) {
                return Ok(StreamOutcome::Completed);
            }
            if finished {
                return Ok(StreamOutcome::Ended);
            }
        }
    }

    /// Fetch history for the current chat without touching session state.
    pub async fn fetch_history(&self) -> HistoryBatch {
        let chat_id = self.chat_id();
        let result = self.history.fetch(&self.user_id, &chat_id).await;
        HistoryBatch { chat_id, result }
    }

    /// Apply a fetched batch: skipped once after a local mutation, discarded
    /// if the session moved to another chat, emptied on failure.
    ///
    /// # Errors
    ///
    /// Returns the batch's [`HistoryError`] after the conversation has been
    /// emptied and a notice raised.
    pub fn apply_history(&mut self, batch: HistoryBatch) -> Result<HistoryLoad, HistoryError> {
        if batch.chat_id != self.chat_id() {
            tracing::debug!(fetched = %batch.chat_id, "discarding history for previous chat");
            return Ok(HistoryLoad::Stale);
        }
        if self.latch.consume() {
            tracing::debug!(chat_id = %batch.chat_id, "history fetch skipped after local change");
            return Ok(HistoryLoad::Skipped);
        }

        match batch.result {
            Ok(records) => {
                let fetched = replay(&records);
                let mut messages = 0;
                self.state.send_modify(|conv| {
                    let merged = merge_history(conv.messages(), fetched);
                    messages = merged.len();
                    conv.replace(merged);
                });
                tracing::info!(chat_id = %batch.chat_id, messages, "history loaded");
                Ok(HistoryLoad::Loaded { messages })
            }
            Err(e) => {
                self.raise(&e);
                self.state.send_modify(|conv| conv.replace(Vec::new()));
                Err(e)
            }
        }
    }

    /// Fetch and apply history, unless a local change armed the skip latch.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] when the fetch fails.
    pub async fn load_history(&mut self) -> Result<HistoryLoad, HistoryError> {
        if self.latch.consume() {
            tracing::debug!("history fetch skipped after local change");
            return Ok(HistoryLoad::Skipped);
        }
        let batch = self.fetch_history().await;
        self.apply_history(batch)
    }

    fn raise(&mut self, err: &(impl crate::error::ErrorCode + ?Sized)) {
        let notice = Notice::from_error(err);
        tracing::warn!(code = notice.code, retryable = notice.retryable, error = %notice.message, "chat notice");
        self.notices.push(notice);
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
