use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::message::Message;
use crate::{Mode, Tier};

/// Which kind of compression action produced a history entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    Normal,
    Emergency,
    Rollover,
}

/// One entry in the monotonic compression history: one per compression or
/// rollover pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: CompressionKind,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Per-mode history entry recorded whenever `set_mode` changes the active
/// mode, kept in `Metadata` for the session file's `modeHistory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeChange {
    pub timestamp: DateTime<Utc>,
    pub mode: Mode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metadata {
    pub token_count: usize,
    pub compression_count: usize,
    pub mode_history: Vec<ModeChange>,
    pub compression_history: Vec<CompressionHistoryEntry>,
}

/// The in-memory working set sent to the LLM each turn. Owned exclusively by
/// ContextManager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub model_id: String,
    /// The current system prompt; one message, regenerated on mode/tier
    /// change and always occupying position 0 when a prompt is built.
    pub system_message: Message,
    /// Checkpoints, oldest first. Ranges are disjoint, contiguous, and
    /// precede the oldest preserved non-checkpointed message (I4).
    pub checkpoints: Vec<Checkpoint>,
    /// Full ordered in-memory messages, including user messages, which are
    /// always retained (I2).
    pub messages: Vec<Message>,
    /// Stable historical index for each entry in `messages`, parallel to it.
    /// Assigned once by `push_message` and never renumbered, so a
    /// checkpoint's `[range_start, range_end)` keeps meaning even after the
    /// messages it covers are spliced out of `messages`.
    pub message_indices: Vec<usize>,
    pub mode: Mode,
    pub tier: Tier,
    /// The context size frozen for the session (`ollama_context_size`).
    pub limit: usize,
    pub metadata: Metadata,
    /// Streaming tokens not yet finalized into a message; counted against
    /// the budget only for overflow detection (report_in_flight_tokens).
    pub in_flight: usize,
    /// Running count of messages ever appended, including ones now only
    /// covered by a checkpoint. Used to assign stable message-index
    /// endpoints to checkpoint ranges.
    pub next_message_index: usize,
}

impl ConversationContext {
    pub fn new(session_id: String, model_id: String, system_message: Message, mode: Mode, tier: Tier, limit: usize) -> Self {
        Self {
            session_id,
            model_id,
            system_message,
            checkpoints: Vec::new(),
            messages: Vec::new(),
            message_indices: Vec::new(),
            mode,
            tier,
            limit,
            metadata: Metadata::default(),
            in_flight: 0,
            next_message_index: 0,
        }
    }

    /// All user messages still present in the working set, in order.
    pub fn user_messages(&self) -> Vec<&Message> {
        self.messages.iter().filter(|m| m.role.is_user()).collect()
    }

    pub fn push_message(&mut self, message: Message) -> usize {
        let index = self.next_message_index;
        self.messages.push(message);
        self.message_indices.push(index);
        self.next_message_index += 1;
        index
    }

    /// Removes the messages at historical indices `[range_start, range_end)`
    /// and returns them in order, for splicing into a checkpoint.
    pub fn drain_range(&mut self, range_start: usize, range_end: usize) -> Vec<Message> {
        let mut drained = Vec::new();
        let mut kept_messages = Vec::with_capacity(self.messages.len());
        let mut kept_indices = Vec::with_capacity(self.message_indices.len());
        for (message, &origin) in self.messages.drain(..).zip(self.message_indices.iter()) {
            if origin >= range_start && origin < range_end {
                drained.push(message);
            } else {
                kept_messages.push(message);
                kept_indices.push(origin);
            }
        }
        self.messages = kept_messages;
        self.message_indices = kept_indices;
        drained
    }

    /// Removes only the non-user messages at historical indices
    /// `[range_start, range_end)`, returning them in order. User messages
    /// whose index falls inside the same span are left in place untouched:
    /// a checkpoint's numeric range may bracket user turns without ever
    /// covering them, since user messages are never eligible for
    /// compression.
    pub fn drain_non_user_range(&mut self, range_start: usize, range_end: usize) -> Vec<Message> {
        let mut drained = Vec::new();
        let mut kept_messages = Vec::with_capacity(self.messages.len());
        let mut kept_indices = Vec::with_capacity(self.message_indices.len());
        for (message, &origin) in self.messages.drain(..).zip(self.message_indices.iter()) {
            if origin >= range_start && origin < range_end && !message.role.is_user() {
                drained.push(message);
            } else {
                kept_messages.push(message);
                kept_indices.push(origin);
            }
        }
        self.messages = kept_messages;
        self.message_indices = kept_indices;
        drained
    }

    /// Inserts `message` at the position of the first retained message whose
    /// historical index is `>= at_index`, preserving overall ordering. Used
    /// to splice a checkpoint summary in where its covered range used to be.
    pub fn insert_at_historical_position(&mut self, at_index: usize, message: Message) {
        let position = self.message_indices.iter().position(|&i| i >= at_index).unwrap_or(self.messages.len());
        self.messages.insert(position, message);
        self.message_indices.insert(position, at_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;

    #[test]
    fn user_messages_filters_by_role() {
        let mut ctx = ConversationContext::new(
            "s1".into(),
            "m1".into(),
            Message::system("sys"),
            Mode::Assistant,
            3,
            8192,
        );
        ctx.push_message(Message::user("hi"));
        ctx.push_message(Message::new(Role::Assistant, "hello"));
        ctx.push_message(Message::user("again"));

        assert_eq!(ctx.user_messages().len(), 2);
    }

    #[test]
    fn drain_range_removes_only_messages_in_range_and_preserves_order() {
        let mut ctx = ConversationContext::new("s1".into(), "m1".into(), Message::system("sys"), Mode::Assistant, 3, 8192);
        for i in 0..5 {
            ctx.push_message(Message::user(format!("m{i}")));
        }

        let drained = ctx.drain_range(1, 3);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].text(), "m1");
        assert_eq!(drained[1].text(), "m2");

        assert_eq!(ctx.messages.len(), 3);
        assert_eq!(ctx.messages[0].text(), "m0");
        assert_eq!(ctx.messages[1].text(), "m3");
        assert_eq!(ctx.messages[2].text(), "m4");
    }

    #[test]
    fn drain_non_user_range_skips_interleaved_user_messages() {
        let mut ctx = ConversationContext::new("s1".into(), "m1".into(), Message::system("sys"), Mode::Assistant, 3, 8192);
        ctx.push_message(Message::user("u0"));
        ctx.push_message(Message::new(Role::Assistant, "a1"));
        ctx.push_message(Message::user("u2"));
        ctx.push_message(Message::new(Role::Assistant, "a3"));
        ctx.push_message(Message::new(Role::Assistant, "a4"));

        let drained = ctx.drain_non_user_range(0, 5);
        let drained_texts: Vec<String> = drained.iter().map(|m| m.text()).collect();
        assert_eq!(drained_texts, vec!["a1", "a3", "a4"]);

        let remaining_texts: Vec<String> = ctx.messages.iter().map(|m| m.text()).collect();
        assert_eq!(remaining_texts, vec!["u0", "u2"]);
        assert_eq!(ctx.message_indices, vec![0, 2]);
    }

    #[test]
    fn insert_at_historical_position_splices_checkpoint_in_place() {
        let mut ctx = ConversationContext::new("s1".into(), "m1".into(), Message::system("sys"), Mode::Assistant, 3, 8192);
        for i in 0..5 {
            ctx.push_message(Message::user(format!("m{i}")));
        }
        ctx.drain_range(1, 3);
        ctx.insert_at_historical_position(1, Message::system("[checkpoint summary]"));

        let texts: Vec<String> = ctx.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["m0", "[checkpoint summary]", "m3", "m4"]);
    }
}
