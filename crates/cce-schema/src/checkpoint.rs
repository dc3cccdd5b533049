use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;

/// Detail level of a checkpoint summary. The ladder is one-way and
/// irreversible: Three -> Two -> One -> Merged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointLevel {
    /// Merged sorts lowest: it is the most compact, terminal state.
    Merged,
    One,
    Two,
    Three,
}

impl CheckpointLevel {
    /// Approximate design-target token budget for a checkpoint at this level.
    /// Numeric targets are design targets, not exact sizes.
    pub fn target_tokens(&self) -> usize {
        match self {
            CheckpointLevel::Three => 2000,
            CheckpointLevel::Two => 1200,
            CheckpointLevel::One => 800,
            CheckpointLevel::Merged => 400,
        }
    }
}

/// A mutable, lossy summary of a contiguous range of older assistant/tool/
/// system messages (never user messages). Replaces the messages it covers in
/// the working prompt; the originals remain on disk in the session file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: Uuid,
    pub level: CheckpointLevel,
    /// Message-index endpoints of the range this checkpoint covers, in the
    /// ConversationContext's historical message numbering. [start, end).
    pub range_start: usize,
    pub range_end: usize,
    /// The single synthesized system-role summary message.
    pub summary: Message,
    /// Sum of token counts over the originally compressed messages.
    pub original_tokens: usize,
    /// Token count of `summary` after the most recent aging pass.
    pub current_tokens: usize,
    /// How many times this checkpoint has been re-summarized (aged or
    /// merged). Monotonically non-decreasing.
    pub compression_count: u32,
    /// Which compression pass (by position in the compression history)
    /// created this checkpoint.
    pub compression_number: usize,
    /// Bounded list of up to 10 extracted phrases.
    pub key_decisions: Vec<String>,
    /// Bounded list of up to 20 extracted file paths.
    pub files_modified: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_aged_at: DateTime<Utc>,
}

pub const MAX_KEY_DECISIONS: usize = 10;
pub const MAX_FILES_MODIFIED: usize = 20;

impl Checkpoint {
    /// Number of messages originally covered by this checkpoint's range.
    pub fn span(&self) -> usize {
        self.range_end.saturating_sub(self.range_start)
    }

    /// Push a key decision, respecting the bounded-list cap.
    pub fn push_key_decision(&mut self, decision: String) {
        if self.key_decisions.len() < MAX_KEY_DECISIONS && !self.key_decisions.contains(&decision) {
            self.key_decisions.push(decision);
        }
    }

    /// Push a modified file path, respecting the bounded-list cap.
    pub fn push_file_modified(&mut self, path: String) {
        if self.files_modified.len() < MAX_FILES_MODIFIED && !self.files_modified.contains(&path) {
            self.files_modified.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering_is_monotone_ladder() {
        assert!(CheckpointLevel::Merged < CheckpointLevel::One);
        assert!(CheckpointLevel::One < CheckpointLevel::Two);
        assert!(CheckpointLevel::Two < CheckpointLevel::Three);
    }

    #[test]
    fn bounded_lists_cap_at_limits() {
        let mut cp = Checkpoint {
            id: Uuid::new_v4(),
            level: CheckpointLevel::Three,
            range_start: 0,
            range_end: 10,
            summary: Message::system("summary"),
            original_tokens: 1000,
            current_tokens: 500,
            compression_count: 1,
            compression_number: 0,
            key_decisions: vec![],
            files_modified: vec![],
            created_at: Utc::now(),
            last_aged_at: Utc::now(),
        };
        for i in 0..15 {
            cp.push_key_decision(format!("decision {i}"));
        }
        assert_eq!(cp.key_decisions.len(), MAX_KEY_DECISIONS);

        for i in 0..25 {
            cp.push_file_modified(format!("src/file_{i}.rs"));
        }
        assert_eq!(cp.files_modified.len(), MAX_FILES_MODIFIED);
    }
}
