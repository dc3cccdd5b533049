pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod message;

pub use checkpoint::{Checkpoint, CheckpointLevel};
pub use config::CceConfig;
pub use context::{CompressionHistoryEntry, CompressionKind, ConversationContext, Metadata};
pub use error::CceError;
pub use events::CceEvent;
pub use message::{ContentPart, Message, MessageId, Role};

/// Operating mode of a session; selects the base system-prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Assistant,
    Developer,
    Planning,
    Debugger,
    User,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Assistant
    }
}

/// Context tier (1-5), derived from the selected context size; used only by
/// the prompt system to choose a base template.
pub type Tier = u8;

pub const MIN_TIER: Tier = 1;
pub const MAX_TIER: Tier = 5;

/// Clamp an arbitrary tier value into the valid [MIN_TIER, MAX_TIER] range.
pub fn clamp_tier(tier: Tier) -> Tier {
    tier.clamp(MIN_TIER, MAX_TIER)
}
