use serde::{Deserialize, Serialize};

/// Events emitted for external observers (UI, logging sinks, metrics).
/// Delivered through a broadcast channel; see `cce_core::events::EventBus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CceEvent {
    CheckpointStarted { session_id: String },
    CheckpointCompleted { session_id: String, checkpoint_id: String },
    CheckpointFailed { session_id: String, reason: String },
    CheckpointAged { session_id: String, checkpoint_id: String },
    ContextWarning { session_id: String, usage: f64 },
    ContextCompressionWarning { session_id: String, usage: f64 },
    EmergencyCompressionStarted { session_id: String },
    EmergencyCompressionCompleted { session_id: String, tokens_before: usize, tokens_after: usize },
    EmergencyRolloverStarted { session_id: String },
    EmergencyRolloverCompleted { session_id: String, snapshot_id: String },
    PromptValidationFailed { session_id: String, reason: String },
    StreamOverflowEmergency { session_id: String, tokens_over: usize },
    SessionSaved { session_id: String },
    SnapshotCreated { session_id: String, snapshot_id: String },
    SnapshotRestored { session_id: String, snapshot_id: String },
    CompressionSkipped { session_id: String, reason: String },
}

impl CceEvent {
    pub fn session_id(&self) -> &str {
        match self {
            CceEvent::CheckpointStarted { session_id }
            | CceEvent::CheckpointCompleted { session_id, .. }
            | CceEvent::CheckpointFailed { session_id, .. }
            | CceEvent::CheckpointAged { session_id, .. }
            | CceEvent::ContextWarning { session_id, .. }
            | CceEvent::ContextCompressionWarning { session_id, .. }
            | CceEvent::EmergencyCompressionStarted { session_id }
            | CceEvent::EmergencyCompressionCompleted { session_id, .. }
            | CceEvent::EmergencyRolloverStarted { session_id }
            | CceEvent::EmergencyRolloverCompleted { session_id, .. }
            | CceEvent::PromptValidationFailed { session_id, .. }
            | CceEvent::StreamOverflowEmergency { session_id, .. }
            | CceEvent::SessionSaved { session_id }
            | CceEvent::SnapshotCreated { session_id, .. }
            | CceEvent::SnapshotRestored { session_id, .. }
            | CceEvent::CompressionSkipped { session_id, .. } => session_id,
        }
    }
}
