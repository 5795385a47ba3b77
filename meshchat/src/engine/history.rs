//! Append-only record of chat messages seen during the session.
//!
//! The log doubles as the deduplication index for flooded traffic: a
//! message is "seen" when a message with the same [`DedupKey`] was recorded
//! earlier. Nothing is ever evicted; sessions are short-lived.

use std::collections::HashSet;

use meshchat_proto::message::{DedupKey, Message};

/// Arrival-ordered message history with an O(1) dedup index.
#[derive(Debug, Default)]
pub struct MessageLog {
    /// Every recorded message, duplicates included.
    messages: Vec<Message>,
    /// Keys of every recorded message.
    seen: HashSet<DedupKey>,
}

impl MessageLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message` unconditionally.
    ///
    /// Callers normally check [`contains`](Self::contains) first; recording a
    /// duplicate is allowed and keeps it in the history for audit.
    pub fn record(&mut self, message: Message) {
        self.seen.insert(message.dedup_key());
        self.messages.push(message);
    }

    /// Returns `true` if an equal message (by dedup key) was recorded.
    #[must_use]
    pub fn contains(&self, message: &Message) -> bool {
        self.seen.contains(&message.dedup_key())
    }

    /// Recorded messages in arrival order.
    ///
    /// The returned iterator is `Clone`, so it can be restarted.
    pub fn all(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Number of recorded entries, duplicates included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if nothing was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
