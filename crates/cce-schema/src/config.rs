use serde::{Deserialize, Serialize};

/// Config surface read at session start (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CceConfig {
    /// User-pinned context size, if any. Wins outright over auto-sizing.
    pub target_size: Option<usize>,
    pub auto_size: bool,
    pub vram_buffer_mb: u64,
    pub warning_threshold: f64,
    pub checkpoint_threshold: f64,
    pub emergency_threshold: f64,
    pub rollover_threshold: f64,
    pub moderate_age: u32,
    pub compact_age: u32,
    pub checkpoint_timeout_ms: u64,
    pub max_sessions: usize,
    pub snapshot_max_count: usize,
    pub snapshot_auto_threshold: f64,
    pub preprocess_enabled: bool,
    /// Minimum messages in a compression range before it's worth summarizing.
    pub min_compression_messages: usize,
    /// Minimum tokens in a compression range before it's worth summarizing.
    pub min_compression_tokens: usize,
    /// Size of the preserved-recent window, in tokens.
    pub preserved_recent_tokens: usize,
    /// Size of the preserved-recent window, in message count (the floor;
    /// the window is the larger of the two).
    pub preserved_recent_messages: usize,
    /// Number of most-recent user messages kept verbatim through rollover.
    pub rollover_keep_user_messages: usize,
    pub file_write_timeout_ms: u64,
}

impl Default for CceConfig {
    fn default() -> Self {
        Self {
            target_size: None,
            auto_size: true,
            vram_buffer_mb: 1024,
            warning_threshold: 0.70,
            checkpoint_threshold: 0.80,
            emergency_threshold: 0.95,
            rollover_threshold: 1.00,
            moderate_age: 3,
            compact_age: 6,
            checkpoint_timeout_ms: 30_000,
            max_sessions: 100,
            snapshot_max_count: 5,
            snapshot_auto_threshold: 0.85,
            preprocess_enabled: true,
            min_compression_messages: 4,
            min_compression_tokens: 500,
            preserved_recent_tokens: 2048,
            preserved_recent_messages: 10,
            rollover_keep_user_messages: 10,
            file_write_timeout_ms: 10_000,
        }
    }
}

/// Per-tier maximum checkpoint counts, tiers 1..=5.
pub const TIER_CHECKPOINT_CAPS: [usize; 5] = [4, 4, 10, 6, 4];

pub fn checkpoint_cap_for_tier(tier: u8) -> usize {
    let idx = tier.clamp(1, 5) as usize - 1;
    TIER_CHECKPOINT_CAPS[idx]
}
