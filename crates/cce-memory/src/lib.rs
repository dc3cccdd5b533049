pub mod profile_store;
pub mod session_recorder;
pub mod snapshot_store;

pub use profile_store::{unknown_model_profile, ContextProfile, ModelProfile, ProfileStore};
pub use session_recorder::{RecordedMessage, RecordedToolCall, SessionFile, SessionMetadata, SessionRecorder};
pub use snapshot_store::{Snapshot, SnapshotReason, SnapshotStore};
