//! Conversation state: the ordered message list for one chat.
//!
//! DESIGN
//! ======
//! Live chunks and replayed history steps both enter a message through
//! [`ProcessedMessage::absorb`], so the two paths cannot drift apart. The
//! conversation only decides *which* message a live chunk belongs to.

use chunks::{Chunk, ChunkKind, FlowType};
use phases::{PhaseTracker, Transition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Chat titles longer than this are truncated with a trailing `...`.
pub const TITLE_MAX_CHARS: usize = 50;

// =============================================================================
// MESSAGE IDENTITY
// =============================================================================

/// Message identity, remembering whether the server issued it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "origin", content = "id", rename_all = "lowercase")]
pub enum MessageId {
    Server(String),
    Local(String),
}

impl MessageId {
    /// Fresh locally generated id.
    #[must_use]
    pub fn local() -> Self {
        Self::Local(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Server(id) | Self::Local(id) => id,
        }
    }

    /// The server-issued id, if this is one.
    #[must_use]
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::Server(id) => Some(id),
            Self::Local(_) => None,
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// How the UI should render a message's progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    /// Chunks are still arriving.
    Streaming,
    /// Terminal phase completed, or a user message.
    Complete,
    /// Stream stopped before completion without a server error.
    Interrupted,
    /// Stream stopped after the server reported an error.
    Failed,
}

// =============================================================================
// MESSAGE
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMessage {
    pub role: Role,
    /// Literal query for users, concatenated text deltas for the assistant.
    pub content: String,
    pub message_id: MessageId,
    /// Raw ordered chunks, assistant only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Chunk>,
    /// Execution summary attached when the terminal phase completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phases: Option<PhaseTracker>,
    /// Last error text reported by the server for this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessedMessage {
    #[must_use]
    pub fn user(message_id: MessageId, content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            message_id,
            steps: Vec::new(),
            metadata: None,
            phases: None,
            error: None,
        }
    }

    #[must_use]
    pub fn assistant(message_id: MessageId, tracker: PhaseTracker) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            message_id,
            steps: Vec::new(),
            metadata: None,
            phases: Some(tracker),
            error: None,
        }
    }

    /// True once the flow's terminal phase has completed.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.phases.as_ref().is_some_and(PhaseTracker::is_complete)
    }

    #[must_use]
    pub fn flow(&self) -> Option<FlowType> {
        self.phases.as_ref().map(PhaseTracker::flow)
    }

    /// Append one chunk and fold it into the derived state.
    ///
    /// Only the new chunk is folded; its position in `steps` is the sequence
    /// number handed to the reducer.
    pub fn absorb(&mut self, chunk: Chunk) -> Transition {
        let seq = self.steps.len() as u64;
        let tracker = self
            .phases
            .get_or_insert_with(|| PhaseTracker::new(FlowType::default()));
        if tracker.is_complete() {
            return Transition::Ignored;
        }

        match &chunk.kind {
            ChunkKind::TextDelta { delta } => self.content.push_str(delta),
            ChunkKind::Error { message } => self.error = Some(message.clone()),
            _ => {}
        }

        let transition = tracker.apply(&chunk, seq);
        if transition == Transition::Completed {
            if let ChunkKind::PhaseComplete(summary) = &chunk.kind {
                if let Some(summary) = &summary.execution_summary {
                    self.metadata = Some(summary.clone());
                }
            }
        }
        self.steps.push(chunk);
        transition
    }
}

// =============================================================================
// CONVERSATION
// =============================================================================

/// Result of routing one live chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The chunk was appended to the message at `index`.
    Applied { index: usize, transition: Transition, created: bool },
    /// The target message is frozen; the chunk was dropped.
    Ignored { index: usize },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    chat_id: String,
    messages: Vec<ProcessedMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    streaming: Option<MessageId>,
}

impl Conversation {
    #[must_use]
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self { chat_id: chat_id.into(), messages: Vec::new(), streaming: None }
    }

    #[must_use]
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    #[must_use]
    pub fn messages(&self) -> &[ProcessedMessage] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Id of the assistant message currently receiving live chunks.
    #[must_use]
    pub fn streaming_id(&self) -> Option<&MessageId> {
        self.streaming.as_ref()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ProcessedMessage> {
        self.position(id).map(|index| &self.messages[index])
    }

    #[must_use]
    pub fn status(&self, message: &ProcessedMessage) -> MessageStatus {
        if message.role == Role::User || message.is_frozen() {
            return MessageStatus::Complete;
        }
        if self.streaming.as_ref() == Some(&message.message_id) {
            return MessageStatus::Streaming;
        }
        if message.error.is_some() {
            MessageStatus::Failed
        } else {
            MessageStatus::Interrupted
        }
    }

    /// Title derived from the first user message.
    #[must_use]
    pub fn title(&self) -> Option<String> {
        let first = self.messages.iter().find(|m| m.role == Role::User)?;
        let text = first.content.trim();
        if text.chars().count() <= TITLE_MAX_CHARS {
            return Some(text.to_owned());
        }
        let mut title: String = text.chars().take(TITLE_MAX_CHARS).collect();
        title.push_str("...");
        Some(title)
    }

    /// Append an optimistic user message.
    pub fn push_user(&mut self, content: impl Into<String>) -> MessageId {
        let id = MessageId::local();
        self.messages.push(ProcessedMessage::user(id.clone(), content));
        id
    }

    /// Append an empty assistant message and make it the streaming target.
    ///
    /// A declared flow is pinned; without one the stream's `start` chunk
    /// picks the flow.
    pub fn begin_assistant(&mut self, declared: Option<FlowType>) -> MessageId {
        let id = MessageId::local();
        let tracker = match declared {
            Some(flow) => PhaseTracker::pinned(flow),
            None => PhaseTracker::new(FlowType::default()),
        };
        self.messages.push(ProcessedMessage::assistant(id.clone(), tracker));
        self.streaming = Some(id.clone());
        id
    }

    /// Stop routing untargeted chunks to the streaming message.
    pub fn finish_streaming(&mut self) -> Option<MessageId> {
        self.streaming.take()
    }

    /// Stop streaming and record `error` on the message that was streaming.
    pub fn fail_streaming(&mut self, error: &str) -> Option<MessageId> {
        let id = self.streaming.take()?;
        if let Some(index) = self.position(id.as_str()) {
            self.messages[index].error.get_or_insert_with(|| error.to_owned());
        }
        Some(id)
    }

    /// Swap in a whole message list, e.g. after a history load.
    pub fn replace(&mut self, messages: Vec<ProcessedMessage>) {
        self.messages = messages;
        self.streaming = None;
    }

    /// Discard everything and start over for `chat_id`.
    pub fn reset(&mut self, chat_id: impl Into<String>) {
        *self = Self::new(chat_id);
    }

    /// Route one live chunk to its message and fold it.
    pub fn apply_chunk(&mut self, chunk: Chunk) -> ApplyOutcome {
        let (index, created) = self.target_for(&chunk);
        let message = &mut self.messages[index];
        if message.is_frozen() {
            tracing::warn!(
                message_id = message.message_id.as_str(),
                kind = chunk.kind.tag(),
                "chunk for completed message dropped"
            );
            return ApplyOutcome::Ignored { index };
        }
        let transition = message.absorb(chunk);
        ApplyOutcome::Applied { index, transition, created }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.message_id.as_str() == id)
    }

    fn target_for(&mut self, chunk: &Chunk) -> (usize, bool) {
        let named = chunk.message_id.as_deref();
        let existing = named.and_then(|id| self.position(id));
        if let Some(index) = existing {
            if self.messages[index].role == Role::Assistant {
                return (index, false);
            }
            tracing::warn!(
                message_id = self.messages[index].message_id.as_str(),
                "chunk names a user message; routing by stream instead"
            );
        }
        // An id already taken by a user message is never adopted or reused.
        let named = named.filter(|_| existing.is_none());

        let streaming = self.streaming.as_ref().and_then(|id| self.position(id.as_str()));
        if let Some(index) = streaming {
            if let Some(server_id) = named {
                let message = &mut self.messages[index];
                if message.message_id.is_local() {
                    message.message_id = MessageId::Server(server_id.to_owned());
                    self.streaming = Some(message.message_id.clone());
                }
            }
            return (index, false);
        }

        let id = match named {
            Some(server_id) => MessageId::Server(server_id.to_owned()),
            None => MessageId::local(),
        };
        tracing::warn!(message_id = id.as_str(), "chunk without a target message; creating placeholder");
        self.messages
            .push(ProcessedMessage::assistant(id.clone(), PhaseTracker::new(FlowType::default())));
        self.streaming = Some(id);
        (self.messages.len() - 1, true)
    }
}

#[cfg(test)]
#[path = "conversation_test.rs"]
mod tests;
