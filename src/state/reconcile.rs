//! Reconciliation of optimistic local messages with fetched history.

use std::collections::{HashMap, HashSet};

use super::conversation::{MessageId, ProcessedMessage, Role};

/// Characters of content compared when matching a local message to history.
pub const CONTENT_KEY_CHARS: usize = 100;

/// One-shot "skip the next history fetch" latch.
///
/// Armed by every local mutation; the next fetch consumes it and is skipped,
/// so a stale snapshot cannot overwrite an in-flight message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkipLatch {
    armed: bool,
}

impl SkipLatch {
    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Returns whether the latch was armed, leaving it disarmed.
    pub fn consume(&mut self) -> bool {
        std::mem::take(&mut self.armed)
    }
}

/// Cross-source identity for a local message the server has not named yet.
fn content_key(message: &ProcessedMessage) -> (Role, String) {
    (message.role, message.content.chars().take(CONTENT_KEY_CHARS).collect())
}

/// Drop later duplicates of the same message id, keeping each first
/// occurrence in place. Distinct messages with equal text are all kept.
#[must_use]
pub fn dedup_messages(messages: Vec<ProcessedMessage>) -> Vec<ProcessedMessage> {
    let mut seen: HashSet<MessageId> = HashSet::new();
    let before = messages.len();
    let kept: Vec<_> = messages
        .into_iter()
        .filter(|message| seen.insert(message.message_id.clone()))
        .collect();
    if kept.len() < before {
        tracing::debug!(dropped = before - kept.len(), "duplicate messages removed");
    }
    kept
}

/// Fetched history first, then local messages the server has not confirmed yet.
///
/// A local message is confirmed by its server id, or, while it only has a
/// local id, by one fetched message with the same role and content prefix.
/// Each fetched message confirms at most one local message.
#[must_use]
pub fn merge_history(local: &[ProcessedMessage], fetched: Vec<ProcessedMessage>) -> Vec<ProcessedMessage> {
    let pending = unconfirmed(local, &fetched);
    dedup_messages(fetched.into_iter().chain(pending).collect())
}

fn unconfirmed(local: &[ProcessedMessage], fetched: &[ProcessedMessage]) -> Vec<ProcessedMessage> {
    let fetched_ids: HashSet<&str> = fetched.iter().filter_map(|m| m.message_id.server()).collect();
    let claimed: HashSet<&str> = local
        .iter()
        .filter_map(|m| m.message_id.server())
        .filter(|id| fetched_ids.contains(id))
        .collect();

    let mut open: HashMap<(Role, String), usize> = HashMap::new();
    for message in fetched {
        if message.message_id.server().is_some_and(|id| claimed.contains(id)) {
            continue;
        }
        *open.entry(content_key(message)).or_default() += 1;
    }

    local
        .iter()
        .filter(|message| match &message.message_id {
            MessageId::Server(id) => !fetched_ids.contains(id.as_str()),
            MessageId::Local(_) => match open.get_mut(&content_key(message)) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    false
                }
                _ => true,
            },
        })
        .cloned()
        .collect()
}

#[cfg(test)]
#[path = "reconcile_test.rs"]
mod tests;
