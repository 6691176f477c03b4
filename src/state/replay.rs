//! Rebuild processed messages from stored history records.
//!
//! Stored steps are normalized into chunks and fed through
//! [`ProcessedMessage::absorb`], the same path live chunks take, so a replayed
//! message matches what the live session showed.

use chunks::{Chunk, ChunkKind, FlowType, normalize_step, step_index};
use phases::PhaseTracker;
use serde_json::Value;

use super::conversation::{MessageId, ProcessedMessage, Role};
use crate::net::history::HistoryRecord;

/// Replay a whole stored conversation. Pure; unusable records are skipped.
#[must_use]
pub fn replay(records: &[HistoryRecord]) -> Vec<ProcessedMessage> {
    records.iter().filter_map(replay_record).collect()
}

/// Replay one stored record, or `None` if it carries no message.
#[must_use]
pub fn replay_record(record: &HistoryRecord) -> Option<ProcessedMessage> {
    let message_id = match &record.message_id {
        Some(id) if !id.is_empty() => MessageId::Server(id.clone()),
        _ => MessageId::local(),
    };

    match record_role(record) {
        Some(Role::User) => {
            let query = record.user_message.as_ref().map(|m| m.query.clone()).unwrap_or_default();
            Some(ProcessedMessage::user(message_id, query))
        }
        Some(Role::Assistant) => {
            let agent = record.agent_message.clone().unwrap_or_default();
            let declared = agent.flow_type.as_deref().and_then(FlowType::parse);
            Some(replay_steps(message_id, declared, &agent.steps))
        }
        None => {
            tracing::warn!(
                message_id = message_id.as_str(),
                message_type = record.message_type.as_deref().unwrap_or(""),
                "skipping history record without a message"
            );
            None
        }
    }
}

/// Fold stored steps into a fresh assistant message.
///
/// The flow is the declared one when known, else the one announced by the
/// first `start` chunk, else worksheet.
#[must_use]
pub fn replay_steps(message_id: MessageId, declared: Option<FlowType>, steps: &[Value]) -> ProcessedMessage {
    let chunks = normalize_steps(steps);
    let tracker = match declared {
        Some(flow) => PhaseTracker::pinned(flow),
        None => PhaseTracker::new(announced_flow(&chunks).unwrap_or_default()),
    };

    let mut message = ProcessedMessage::assistant(message_id, tracker);
    for chunk in chunks {
        message.absorb(chunk);
    }
    message
}

/// Decode stored steps in step order, dropping the ones that do not decode.
#[must_use]
pub fn normalize_steps(steps: &[Value]) -> Vec<Chunk> {
    let mut ordered: Vec<&Value> = steps.iter().collect();
    if ordered.iter().all(|step| step_index(step).is_some()) {
        ordered.sort_by_key(|step| step_index(step));
    }

    ordered
        .into_iter()
        .filter_map(|step| match normalize_step(step) {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                tracing::warn!(step = ?step_index(step), error = %e, "dropping unparseable history step");
                None
            }
        })
        .collect()
}

fn announced_flow(chunks: &[Chunk]) -> Option<FlowType> {
    chunks.iter().find_map(|chunk| match chunk.kind {
        ChunkKind::Start { flow_type } => flow_type,
        _ => None,
    })
}

fn record_role(record: &HistoryRecord) -> Option<Role> {
    if record.agent_message.is_some() {
        return Some(Role::Assistant);
    }
    if record.user_message.is_some() {
        return Some(Role::User);
    }
    match record.message_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("user" | "human") => Some(Role::User),
        Some("agent" | "assistant" | "ai") => Some(Role::Assistant),
        _ => None,
    }
}

#[cfg(test)]
#[path = "replay_test.rs"]
mod tests;
