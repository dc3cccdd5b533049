//! The four-threshold budget state machine that owns a session's working
//! context end to end: starting a session, appending turns, validating the
//! budget before every prompt is built, and recovering through compression,
//! emergency compression, and rollover in that order. Grounded in the
//! teacher's router module, which is the one place upstream owns a whole
//! request lifecycle (lock, call, record, recover) rather than a single
//! step of it.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use tracing::{info, warn};

use uuid::Uuid;

use cce_memory::{unknown_model_profile, ModelProfile, ProfileStore, SessionFile, SessionRecorder, SnapshotReason, SnapshotStore};
use cce_provider::{Provider, ProviderMessage};
use cce_schema::{CceConfig, CceError, CceEvent, Checkpoint, CheckpointLevel, ConversationContext, Message, Mode, Role, Tier};

use crate::checkpoint_manager::CheckpointManager;
use crate::compression_coordinator::{CompressionCoordinator, CompressionCoordinatorConfig, CompressionOutcome};
use crate::events::EventBus;
use crate::preprocessing::{PreprocessConfig, Preprocessor};
use crate::templates::build_system_prompt;
use crate::token_counter::TokenCounter;
use crate::vram_monitor::{select_auto_sized_context, VramInfo, VramMonitor};

/// Fraction of `limit` at which each band starts, per spec §4.1.
struct Thresholds {
    warn: f64,
    compress: f64,
    emergency: f64,
    rollover: f64,
}

impl From<&CceConfig> for Thresholds {
    fn from(config: &CceConfig) -> Self {
        Self {
            warn: config.warning_threshold,
            compress: config.checkpoint_threshold,
            emergency: config.emergency_threshold,
            rollover: config.rollover_threshold,
        }
    }
}

/// Ceiling on the synthetic checkpoint rollover writes in place of the
/// state it just archived (spec §4.1 Rollover, Scenario C(ii)).
const ROLLOVER_CHECKPOINT_MAX_TOKENS: usize = 400;

/// Derives a 1-5 prompt tier from the chosen context size. Tiers are a
/// prompt-selection detail only; they have no bearing on the budget math.
fn tier_for_context_size(size: usize) -> Tier {
    match size {
        0..=4095 => 1,
        4096..=6962 => 2,
        6963..=8191 => 3,
        8192..=16383 => 4,
        _ => 5,
    }
}

/// Owns one session's `ConversationContext` plus every collaborator needed
/// to keep it within budget and durable. One instance per active session.
pub struct ContextManager {
    provider: Arc<dyn Provider>,
    token_counter: Arc<TokenCounter>,
    config: CceConfig,
    profile_store: ProfileStore,
    session_recorder: SessionRecorder,
    snapshot_store: SnapshotStore,
    compression: CompressionCoordinator,
    events: Arc<EventBus>,
    preprocessor: Preprocessor,
    model_profile: ModelProfile,
    context: ConversationContext,
    session_file: SessionFile,
    /// Set once the session's usage first crosses `snapshot_auto_threshold`
    /// (spec §4.6(b)); the auto-snapshot then never fires again this session.
    auto_snapshot_taken: bool,
}

impl ContextManager {
    /// Starts a new session: resolves the model's profile (falling back to
    /// `unknown_model_profile` if the model id isn't recognized), picks the
    /// effective context size (a pinned `target_size` wins outright, else
    /// VRAM auto-sizing, else the model's `default_context`), and opens a
    /// session file.
    pub async fn start(
        home: impl AsRef<std::path::Path>,
        session_id: impl Into<String>,
        model_id: impl Into<String>,
        provider_name: impl Into<String>,
        mode: Mode,
        provider: Arc<dyn Provider>,
        config: CceConfig,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let session_id = session_id.into();
        let model_id = model_id.into();
        let provider_name = provider_name.into();

        let profile_store = ProfileStore::new(home.as_ref());
        let model_profile = match profile_store.find(&model_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                warn!(%model_id, "model profile not found, using fallback profile");
                unknown_model_profile(&model_id)
            }
            Err(error) => {
                warn!(%model_id, %error, "profile file unreadable, using fallback profile");
                unknown_model_profile(&model_id)
            }
        };

        let limit = Self::resolve_context_size(&model_profile, &config);
        let tier = tier_for_context_size(limit);
        let system_message = build_system_prompt(mode, tier, model_profile.tool_support);

        let session_recorder = SessionRecorder::new(home.as_ref(), config.max_sessions);
        let session_file = session_recorder.start_session(&session_id, &model_id, &provider_name).await?;

        let snapshot_store = SnapshotStore::new(home.as_ref(), config.snapshot_max_count);
        let token_counter = Arc::new(TokenCounter::default());

        let compression = CompressionCoordinator::new(
            provider.clone(),
            token_counter.clone(),
            CompressionCoordinatorConfig {
                min_compression_messages: config.min_compression_messages,
                min_compression_tokens: config.min_compression_tokens,
                preserved_recent_tokens: config.preserved_recent_tokens,
                preserved_recent_messages: config.preserved_recent_messages,
                lock_timeout: std::time::Duration::from_millis(config.checkpoint_timeout_ms),
            },
        );

        let preprocessor = Preprocessor::new(
            if config.preprocess_enabled { Some(provider.clone()) } else { None },
            token_counter.clone(),
            PreprocessConfig::default(),
            limit,
        );

        let context = ConversationContext::new(session_id, model_id, system_message, mode, tier, limit);

        Ok(Self {
            provider,
            token_counter,
            config,
            profile_store,
            session_recorder,
            snapshot_store,
            compression,
            events,
            preprocessor,
            model_profile,
            context,
            session_file,
            auto_snapshot_taken: false,
        })
    }

    /// A user-pinned `target_size` always wins. Otherwise, auto-size against
    /// detected free VRAM if enabled and the probe succeeds; the model's
    /// `default_context` is the fallback in every other case.
    fn resolve_context_size(profile: &ModelProfile, config: &CceConfig) -> usize {
        if let Some(target) = config.target_size {
            return target;
        }
        if config.auto_size {
            if let VramInfo::Known(free_mb) = VramMonitor::detect() {
                let profiles = profile.profiles_by_vram();
                if let Some(chosen) = select_auto_sized_context(&profiles, free_mb, config.vram_buffer_mb) {
                    return chosen.ollama_context_size;
                }
            }
        }
        profile.default_context
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn usage_fraction(&self) -> f64 {
        self.current_usage_tokens() as f64 / self.context.limit as f64
    }

    pub fn model_profile(&self) -> &ModelProfile {
        &self.model_profile
    }

    /// Assembles the full prompt to send to the Provider: the system
    /// message, then checkpoint summaries and surviving messages merged by
    /// historical position. A checkpoint's summary occupies the slot of the
    /// range it replaced, so the result reads in original conversation
    /// order even though most of it is now compacted.
    pub fn build_prompt(&self) -> Vec<ProviderMessage> {
        let mut entries: Vec<(usize, &Message)> =
            self.context.checkpoints.iter().map(|c| (c.range_start, &c.summary)).collect();
        entries.extend(self.context.message_indices.iter().copied().zip(self.context.messages.iter()));
        entries.sort_by_key(|(idx, _)| *idx);

        let mut prompt = vec![ProviderMessage::from_message(&self.context.system_message)];
        prompt.extend(entries.into_iter().map(|(_, message)| ProviderMessage::from_message(message)));
        prompt
    }

    /// Runs a raw user turn through preprocessing, records the original
    /// verbatim, inserts the cleaned (or intent-reduced) text into the
    /// working context, then validates the budget. Returns the id of the
    /// inserted message.
    pub async fn append_user_message(&mut self, raw_text: &str) -> Result<cce_schema::MessageId> {
        let outcome = self.preprocessor.process(raw_text).await;

        self.session_recorder
            .record_message(&mut self.session_file, Role::User, outcome.original.as_str(), false)
            .await
            .context("recording user message")?;

        let message = Message::user(outcome.for_context().to_string());
        let message_id = message.id;
        self.context.push_message(message);

        self.validate_and_build_prompt().await?;
        Ok(message_id)
    }

    pub async fn record_assistant_message(&mut self, text: &str, truncated: bool) -> Result<()> {
        self.session_recorder
            .record_message(&mut self.session_file, Role::Assistant, text, truncated)
            .await
            .context("recording assistant message")?;
        self.context.push_message(Message::assistant(text.to_string()));
        Ok(())
    }

    pub async fn record_tool_call(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
        output: Option<serde_json::Value>,
    ) -> Result<()> {
        self.session_recorder
            .record_tool_call(&mut self.session_file, id, name, input, output)
            .await
            .context("recording tool call")
    }

    pub fn report_in_flight_tokens(&mut self, delta: usize) {
        self.context.in_flight += delta;
        let used = self.current_usage_tokens();
        let fraction = used as f64 / self.context.limit as f64;
        if fraction >= 1.0 {
            self.events.publish(CceEvent::StreamOverflowEmergency {
                session_id: self.context.session_id.clone(),
                tokens_over: used.saturating_sub(self.context.limit),
            });
        }
    }

    pub fn clear_in_flight_tokens(&mut self) {
        self.context.in_flight = 0;
    }

    fn current_usage_tokens(&self) -> usize {
        self.token_counter.count_message(&self.context.system_message)
            + self.token_counter.count_messages(&self.context.messages)
            + self.context.checkpoints.iter().map(|c| c.current_tokens).sum::<usize>()
            + self.context.in_flight
    }

    /// Regenerates the system prompt for a new mode and splices it in at
    /// position 0, recording the change in `mode_history`.
    pub fn set_mode(&mut self, mode: Mode) {
        self.context.mode = mode;
        self.context.system_message = build_system_prompt(mode, self.context.tier, self.model_profile.tool_support);
        self.context.metadata.mode_history.push(cce_schema::context::ModeChange {
            timestamp: chrono::Utc::now(),
            mode,
        });
    }

    /// Implements the four-threshold state machine (spec §4.1). Recursion is
    /// bounded to depth 1 per band: a failed compress recheck escalates to
    /// emergency exactly once, a failed emergency recheck escalates to
    /// rollover exactly once, and a failed rollover recheck is terminal.
    pub async fn validate_and_build_prompt(&mut self) -> Result<()> {
        let thresholds = Thresholds::from(&self.config);
        let fraction = self.current_usage_tokens() as f64 / self.context.limit as f64;

        if !self.auto_snapshot_taken && fraction >= self.config.snapshot_auto_threshold {
            self.auto_snapshot_taken = true;
            if let Err(error) = self.snapshot(SnapshotReason::AutoThresholdCrossed).await {
                warn!(session_id = %self.context.session_id, %error, "auto snapshot at usage threshold failed");
            }
        }

        if fraction < thresholds.warn {
            return Ok(());
        }
        if fraction < thresholds.compress {
            self.events.publish(CceEvent::ContextWarning {
                session_id: self.context.session_id.clone(),
                usage: fraction,
            });
            return Ok(());
        }
        if fraction < thresholds.emergency {
            return self.handle_compress_band(fraction).await;
        }
        if fraction < thresholds.rollover {
            return self.handle_emergency_band().await;
        }
        self.handle_rollover_band().await
    }

    async fn handle_compress_band(&mut self, fraction: f64) -> Result<()> {
        self.events.publish(CceEvent::ContextCompressionWarning {
            session_id: self.context.session_id.clone(),
            usage: fraction,
        });

        match self.compression.run_normal_compression(&mut self.context).await {
            Ok(CompressionOutcome::Compressed { .. }) => {
                self.events.publish(CceEvent::CheckpointCompleted {
                    session_id: self.context.session_id.clone(),
                    checkpoint_id: self.context.checkpoints.last().map(|c| c.id.to_string()).unwrap_or_default(),
                });
            }
            Ok(CompressionOutcome::Skipped { reason }) => {
                self.events.publish(CceEvent::CompressionSkipped {
                    session_id: self.context.session_id.clone(),
                    reason,
                });
            }
            Err(error) => {
                self.events.publish(CceEvent::CheckpointFailed {
                    session_id: self.context.session_id.clone(),
                    reason: error.to_string(),
                });
            }
        }

        self.enforce_tier_cap();

        let recheck = self.current_usage_tokens() as f64 / self.context.limit as f64;
        if recheck >= self.config.emergency_threshold {
            return self.handle_emergency_band().await;
        }
        Ok(())
    }

    async fn handle_emergency_band(&mut self) -> Result<()> {
        self.events.publish(CceEvent::EmergencyCompressionStarted {
            session_id: self.context.session_id.clone(),
        });

        let outcome = self.compression.run_emergency_compression(&mut self.context);
        if let CompressionOutcome::Compressed { tokens_before, tokens_after } = outcome {
            self.events.publish(CceEvent::EmergencyCompressionCompleted {
                session_id: self.context.session_id.clone(),
                tokens_before,
                tokens_after,
            });
        }

        let recheck = self.current_usage_tokens() as f64 / self.context.limit as f64;
        if recheck >= self.config.rollover_threshold {
            return self.handle_rollover_band().await;
        }
        Ok(())
    }

    async fn handle_rollover_band(&mut self) -> Result<()> {
        self.events.publish(CceEvent::EmergencyRolloverStarted {
            session_id: self.context.session_id.clone(),
        });

        let tokens_archived = self.current_usage_tokens();
        let archived_range_end = self.context.next_message_index;

        let snapshot = self
            .snapshot_store
            .create(
                &self.context.session_id,
                tokens_archived,
                self.context.user_messages().into_iter().cloned().collect(),
                self.non_user_messages(),
                self.context.checkpoints.clone(),
                self.context.mode,
                self.context.tier,
                SnapshotReason::PreRollover,
            )
            .await
            .context("writing pre-rollover snapshot")?;

        let snapshot_id = snapshot.id.clone();
        self.events.publish(CceEvent::SnapshotCreated {
            session_id: self.context.session_id.clone(),
            snapshot_id: snapshot_id.clone(),
        });

        let keep = self.config.rollover_keep_user_messages;
        let kept_user_messages: Vec<Message> = self
            .context
            .user_messages()
            .into_iter()
            .rev()
            .take(keep)
            .rev()
            .cloned()
            .collect();

        let rollover_checkpoint = self.build_rollover_checkpoint(&snapshot_id, tokens_archived, archived_range_end);

        let mut fresh = ConversationContext::new(
            self.context.session_id.clone(),
            self.context.model_id.clone(),
            self.context.system_message.clone(),
            self.context.mode,
            self.context.tier,
            self.context.limit,
        );
        fresh.next_message_index = archived_range_end;
        fresh.checkpoints.push(rollover_checkpoint);
        for message in kept_user_messages {
            fresh.push_message(message);
        }
        self.context = fresh;

        self.events.publish(CceEvent::EmergencyRolloverCompleted {
            session_id: self.context.session_id.clone(),
            snapshot_id: snapshot_id.clone(),
        });

        let recheck = self.current_usage_tokens() as f64 / self.context.limit as f64;
        if recheck >= self.config.rollover_threshold {
            bail!(CceError::BudgetUnrecoverable { snapshot_id });
        }
        Ok(())
    }

    /// Builds the ultra-compact `Merged`-level checkpoint that stands in for
    /// everything a rollover just archived: it names the snapshot id so the
    /// prior state is recoverable, and is trimmed to
    /// `ROLLOVER_CHECKPOINT_MAX_TOKENS` regardless of how much it summarizes.
    fn build_rollover_checkpoint(&self, snapshot_id: &str, tokens_archived: usize, range_end: usize) -> Checkpoint {
        let text = format!(
            "[Rollover checkpoint] Prior conversation state ({tokens_archived} tokens, \
             {compression_count} prior compression pass(es)) was archived to snapshot {snapshot_id}. \
             Restore that snapshot to inspect the full prior state.",
            compression_count = self.context.metadata.compression_count,
        );

        let mut summary = Message::system(text);
        while self.token_counter.count_message(&summary) > ROLLOVER_CHECKPOINT_MAX_TOKENS {
            let body = summary.text();
            let trimmed_len = body.chars().count().saturating_sub(64).max(1);
            summary = Message::system(body.chars().take(trimmed_len).collect::<String>());
        }
        let current_tokens = self.token_counter.count_message(&summary);

        Checkpoint {
            id: Uuid::new_v4(),
            level: CheckpointLevel::Merged,
            range_start: 0,
            range_end,
            summary,
            original_tokens: tokens_archived,
            current_tokens,
            compression_count: self.context.metadata.compression_count as u32,
            compression_number: self.context.metadata.compression_history.len(),
            key_decisions: Vec::new(),
            files_modified: Vec::new(),
            created_at: chrono::Utc::now(),
            last_aged_at: chrono::Utc::now(),
        }
    }

    fn non_user_messages(&self) -> Vec<Message> {
        self.context.messages.iter().filter(|m| !m.role.is_user()).cloned().collect()
    }

    fn enforce_tier_cap(&mut self) {
        let manager = CheckpointManager::new(&self.token_counter);
        let cap = cce_schema::config::checkpoint_cap_for_tier(self.context.tier);
        manager.enforce_tier_cap(&mut self.context.checkpoints, cap);
    }

    pub fn is_summarization_in_progress(&self) -> bool {
        self.compression.is_summarization_in_progress()
    }

    pub async fn wait_for_summarization(&self, timeout: std::time::Duration) -> Result<()> {
        self.compression.wait_for_summarization(timeout).await
    }

    /// Takes a manual point-in-time snapshot without mutating the working
    /// context.
    pub async fn snapshot(&mut self, reason: SnapshotReason) -> Result<String> {
        let snapshot = self
            .snapshot_store
            .create(
                &self.context.session_id,
                self.current_usage_tokens(),
                self.context.user_messages().into_iter().cloned().collect(),
                self.non_user_messages(),
                self.context.checkpoints.clone(),
                self.context.mode,
                self.context.tier,
                reason,
            )
            .await?;
        self.events.publish(CceEvent::SnapshotCreated {
            session_id: self.context.session_id.clone(),
            snapshot_id: snapshot.id.clone(),
        });
        Ok(snapshot.id)
    }

    /// Restores a prior snapshot, replacing the working context wholesale.
    pub async fn restore(&mut self, snapshot_id: &str) -> Result<()> {
        let snapshot = self.snapshot_store.restore(&self.context.session_id, snapshot_id).await?;

        let mut restored = ConversationContext::new(
            self.context.session_id.clone(),
            self.context.model_id.clone(),
            self.context.system_message.clone(),
            snapshot.mode,
            snapshot.tier,
            self.context.limit,
        );

        // Checkpoint ranges are restored verbatim (P6: identical ordered
        // checkpoint ranges survive a restore). Surviving messages resume
        // numbering from the highest restored range_end, keeping
        // select_compression_range's last-checkpoint-range_end convention
        // intact without overlapping any restored range.
        let checkpoints = snapshot.checkpoints;
        let next_index = checkpoints.iter().map(|c| c.range_end).max().unwrap_or(0);
        restored.checkpoints = checkpoints;
        restored.next_message_index = next_index;

        let mut merged: Vec<Message> = snapshot.other_messages;
        merged.extend(snapshot.user_messages);
        merged.sort_by_key(|m| m.created_at);
        for message in merged {
            restored.push_message(message);
        }
        self.context = restored;

        self.events.publish(CceEvent::SnapshotRestored {
            session_id: self.context.session_id.clone(),
            snapshot_id: snapshot_id.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cce_provider::mock::MockProvider;
    use tempfile::TempDir;

    async fn write_profiles(home: &std::path::Path) {
        let dir = home.join(".ollm");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let json = r#"{
            "version": 1,
            "models": [
                {
                    "id": "llama3:8b",
                    "display_name": "Llama 3 8B",
                    "tool_support": true,
                    "max_context_window": 8192,
                    "default_context": 2048,
                    "context_profiles": [
                        {"size": 2048, "size_label": "small", "ollama_context_size": 2048, "vram_estimate_gb": 4.0}
                    ]
                }
            ]
        }"#;
        tokio::fs::write(dir.join("LLM_profiles.json"), json).await.unwrap();
    }

    async fn make_manager(home: &std::path::Path, provider: Arc<dyn Provider>) -> ContextManager {
        write_profiles(home).await;
        let mut config = CceConfig::default();
        config.auto_size = false;
        config.target_size = Some(2048);
        ContextManager::start(
            home,
            "s1",
            "llama3:8b",
            "ollama",
            Mode::Assistant,
            provider,
            config,
            Arc::new(EventBus::default()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn start_falls_back_to_unknown_profile_for_unrecognized_model() {
        let tmp = TempDir::new().unwrap();
        write_profiles(tmp.path()).await;
        let provider = Arc::new(MockProvider::with_reply("hi"));
        let manager = ContextManager::start(
            tmp.path(),
            "s1",
            "mystery-model",
            "ollama",
            Mode::Assistant,
            provider,
            CceConfig::default(),
            Arc::new(EventBus::default()),
        )
        .await
        .unwrap();
        assert!(!manager.model_profile.tool_support);
    }

    #[tokio::test]
    async fn appending_below_warn_threshold_does_nothing_special() {
        let tmp = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::with_reply("ok"));
        let mut manager = make_manager(tmp.path(), provider).await;
        manager.append_user_message("hello there").await.unwrap();
        assert_eq!(manager.context().user_messages().len(), 1);
        assert_eq!(manager.context().checkpoints.len(), 0);
    }

    #[tokio::test]
    async fn crossing_compress_threshold_produces_a_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::with_summary("condensed summary of the filler turns"));
        let mut manager = make_manager(tmp.path(), provider).await;

        for i in 0..40 {
            manager
                .record_assistant_message(
                    &format!("filler assistant turn number {i} with a good amount of padding text to burn tokens quickly here"),
                    false,
                )
                .await
                .unwrap();
        }
        manager.validate_and_build_prompt().await.unwrap();

        assert!(!manager.context().checkpoints.is_empty() || manager.is_summarization_in_progress() == false);
    }

    #[tokio::test]
    async fn crossing_auto_snapshot_threshold_takes_exactly_one_snapshot() {
        let tmp = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::with_summary("condensed summary of the filler turns"));
        let mut manager = make_manager(tmp.path(), provider).await;
        manager.config.snapshot_auto_threshold = 0.3;
        manager.config.checkpoint_threshold = 0.99;
        manager.config.emergency_threshold = 0.995;
        manager.config.rollover_threshold = 1.0;

        for i in 0..5 {
            manager
                .record_assistant_message(&format!("filler turn {i} with some padding text to burn tokens"), false)
                .await
                .unwrap();
        }
        manager.validate_and_build_prompt().await.unwrap();
        assert!(manager.usage_fraction() >= 0.3);

        let snapshot_ids = manager.snapshot_store.list(&manager.context().session_id).await.unwrap();
        assert_eq!(snapshot_ids.len(), 1);

        // A second pass above the same threshold must not take another snapshot.
        manager.validate_and_build_prompt().await.unwrap();
        let snapshot_ids_after = manager.snapshot_store.list(&manager.context().session_id).await.unwrap();
        assert_eq!(snapshot_ids_after.len(), 1);
    }

    #[tokio::test]
    async fn rollover_inserts_synthetic_checkpoint_referencing_snapshot() {
        let tmp = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::with_reply("ok"));
        let mut manager = make_manager(tmp.path(), provider).await;
        manager.append_user_message("keep me").await.unwrap();

        manager.handle_rollover_band().await.unwrap();

        assert_eq!(manager.context().checkpoints.len(), 1);
        let checkpoint = &manager.context().checkpoints[0];
        assert_eq!(checkpoint.level, CheckpointLevel::Merged);
        assert!(checkpoint.current_tokens <= ROLLOVER_CHECKPOINT_MAX_TOKENS);

        let snapshot_ids = manager.snapshot_store.list(&manager.context().session_id).await.unwrap();
        assert_eq!(snapshot_ids.len(), 1);
        assert!(checkpoint.summary.text().contains(&snapshot_ids[0]));

        assert_eq!(manager.context().user_messages().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_then_restore_round_trips_user_messages() {
        let tmp = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::with_reply("ok"));
        let mut manager = make_manager(tmp.path(), provider).await;
        manager.append_user_message("remember this").await.unwrap();

        let snapshot_id = manager.snapshot(SnapshotReason::Manual).await.unwrap();
        manager.append_user_message("and this too").await.unwrap();
        assert_eq!(manager.context().user_messages().len(), 2);

        manager.restore(&snapshot_id).await.unwrap();
        assert_eq!(manager.context().user_messages().len(), 1);
    }

    #[tokio::test]
    async fn restore_preserves_checkpoint_ranges_identically() {
        let tmp = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::with_reply("ok"));
        let mut manager = make_manager(tmp.path(), provider).await;

        manager.context.checkpoints.push(Checkpoint {
            id: Uuid::new_v4(),
            level: CheckpointLevel::Two,
            range_start: 3,
            range_end: 11,
            summary: Message::system("earlier turns"),
            original_tokens: 900,
            current_tokens: 300,
            compression_count: 2,
            compression_number: 0,
            key_decisions: vec!["used postgres".to_string()],
            files_modified: vec!["src/main.rs".to_string()],
            created_at: chrono::Utc::now(),
            last_aged_at: chrono::Utc::now(),
        });
        manager.context.next_message_index = 11;
        manager.append_user_message("remember this").await.unwrap();

        let original_checkpoints = manager.context().checkpoints.clone();
        let snapshot_id = manager.snapshot(SnapshotReason::Manual).await.unwrap();
        manager.restore(&snapshot_id).await.unwrap();

        assert_eq!(manager.context().checkpoints, original_checkpoints);
    }

    #[tokio::test]
    async fn build_prompt_starts_with_system_message() {
        let tmp = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::with_reply("ok"));
        let mut manager = make_manager(tmp.path(), provider).await;
        manager.append_user_message("hello").await.unwrap();

        let prompt = manager.build_prompt();
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[0].role, Role::System);
        assert_eq!(prompt[1].role, Role::User);
    }

    #[tokio::test]
    async fn set_mode_regenerates_system_prompt() {
        let tmp = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::with_reply("ok"));
        let mut manager = make_manager(tmp.path(), provider).await;
        let before = manager.context().system_message.text();
        manager.set_mode(Mode::Debugger);
        assert_ne!(before, manager.context().system_message.text());
        assert_eq!(manager.context().metadata.mode_history.len(), 1);
    }
}
