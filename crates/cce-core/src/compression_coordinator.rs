//! Drives a single compression pass end-to-end with mutual exclusion.
//!
//! The summarization lock is a `tokio::sync::Mutex<()>` guarded by a
//! `tokio::time::timeout`, the same pairing the teacher's router module uses
//! to bound a provider call's lifetime rather than let it hold resources
//! indefinitely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use cce_provider::{ChatOptions, Provider, ProviderMessage};
use cce_schema::{Checkpoint, CheckpointLevel, CompressionHistoryEntry, CompressionKind, ConversationContext, Message, Role};

use crate::checkpoint_manager::CheckpointManager;
use crate::token_counter::TokenCounter;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const SUMMARIZATION_SYSTEM_PROMPT: &str = "You summarize a slice of an ongoing conversation. \
Preserve key decisions, file edits, and next steps. Output a clear, structured summary without \
pleasantries or filler.";

/// What a compression pass accomplished, surfaced to ContextManager for
/// warnings and compression-history bookkeeping.
#[derive(Debug)]
pub enum CompressionOutcome {
    Compressed { tokens_before: usize, tokens_after: usize },
    Skipped { reason: String },
}

pub struct CompressionCoordinatorConfig {
    pub min_compression_messages: usize,
    pub min_compression_tokens: usize,
    pub preserved_recent_tokens: usize,
    pub preserved_recent_messages: usize,
    pub lock_timeout: Duration,
}

impl Default for CompressionCoordinatorConfig {
    fn default() -> Self {
        Self {
            min_compression_messages: 4,
            min_compression_tokens: 500,
            preserved_recent_tokens: 2048,
            preserved_recent_messages: 10,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Exclusive across the whole process: exactly one compression pass may be
/// in flight. `in_progress` is readable without blocking for
/// `is_summarization_in_progress`; the `Mutex` itself enforces exclusion for
/// callers that actually need to wait.
pub struct CompressionCoordinator {
    provider: Arc<dyn Provider>,
    token_counter: Arc<TokenCounter>,
    config: CompressionCoordinatorConfig,
    lock: Mutex<()>,
    in_progress: AtomicBool,
}

impl CompressionCoordinator {
    pub fn new(provider: Arc<dyn Provider>, token_counter: Arc<TokenCounter>, config: CompressionCoordinatorConfig) -> Self {
        Self {
            provider,
            token_counter,
            config,
            lock: Mutex::new(()),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn is_summarization_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Blocks until the lock is free or `timeout` elapses, returning a busy
    /// error in the latter case (P8).
    pub async fn wait_for_summarization(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.lock.lock()).await {
            Ok(guard) => {
                drop(guard);
                Ok(())
            }
            Err(_) => Err(anyhow!(cce_schema::CceError::SummarizationBusy)),
        }
    }

    /// Normal compression pass (spec §4.2 steps 1-10).
    pub async fn run_normal_compression(&self, context: &mut ConversationContext) -> Result<CompressionOutcome> {
        let guard = match tokio::time::timeout(self.config.lock_timeout, self.lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => return Err(anyhow!(cce_schema::CceError::SummarizationTimeout(self.config.lock_timeout))),
        };
        self.in_progress.store(true, Ordering::SeqCst);
        info!(session_id = %context.session_id, "checkpoint_started");

        let result = self.run_normal_compression_locked(context).await;

        self.in_progress.store(false, Ordering::SeqCst);
        match &result {
            Ok(CompressionOutcome::Compressed { .. }) => info!(session_id = %context.session_id, "checkpoint_completed"),
            Ok(CompressionOutcome::Skipped { reason }) => info!(session_id = %context.session_id, %reason, "compression_skipped"),
            Err(error) => warn!(session_id = %context.session_id, %error, "checkpoint_failed"),
        }
        drop(guard);
        result
    }

    async fn run_normal_compression_locked(&self, context: &mut ConversationContext) -> Result<CompressionOutcome> {
        let Some((range_start, range_end)) = self.select_compression_range(context) else {
            return Ok(CompressionOutcome::Skipped { reason: "no eligible range".to_string() });
        };

        let to_compress = self.peek_range(context, range_start, range_end);
        let compress_tokens: usize = to_compress.iter().map(|m| self.token_counter.count_message(m)).sum();

        if to_compress.len() < self.config.min_compression_messages || compress_tokens < self.config.min_compression_tokens {
            return Ok(CompressionOutcome::Skipped { reason: "range too small".to_string() });
        }

        let tokens_before = self.token_counter.count_messages(&context.messages)
            + context.checkpoints.iter().map(|c| c.current_tokens).sum::<usize>();

        let prompt = self.build_summarization_prompt(&to_compress);
        let options = ChatOptions { think: false, num_ctx: context.limit, ..ChatOptions::default() };
        let messages = vec![ProviderMessage::text(Role::User, prompt)];
        let summary_text = self.provider.summarize(&messages, &options).await?;

        let drained = context.drain_non_user_range(range_start, range_end);
        let (key_decisions, files_modified) = extract_key_decisions_and_files(&drained);

        let summary = Message::system(summary_text);
        let current_tokens = self.token_counter.count_message(&summary);
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            level: CheckpointLevel::Three,
            range_start,
            range_end,
            summary,
            original_tokens: compress_tokens,
            current_tokens,
            compression_count: 1,
            compression_number: context.metadata.compression_history.len(),
            key_decisions,
            files_modified,
            created_at: chrono::Utc::now(),
            last_aged_at: chrono::Utc::now(),
        };

        let insertion_point = checkpoint.range_start;
        let position = context
            .checkpoints
            .iter()
            .position(|c| c.range_start > insertion_point)
            .unwrap_or(context.checkpoints.len());
        context.checkpoints.insert(position, checkpoint);

        let manager = CheckpointManager::new(&self.token_counter);
        manager.age_all(&mut context.checkpoints, context.metadata.compression_history.len() + 1);

        let tokens_after = self.token_counter.count_messages(&context.messages)
            + context.checkpoints.iter().map(|c| c.current_tokens).sum::<usize>();

        context.metadata.compression_history.push(CompressionHistoryEntry {
            timestamp: chrono::Utc::now(),
            kind: CompressionKind::Normal,
            tokens_before,
            tokens_after,
        });
        context.metadata.compression_count += 1;

        Ok(CompressionOutcome::Compressed { tokens_before, tokens_after })
    }

    /// Emergency compression: purely deterministic, never calls the
    /// Provider (spec §4.2 "Emergency compression pass").
    pub fn run_emergency_compression(&self, context: &mut ConversationContext) -> CompressionOutcome {
        let tokens_before = self.token_counter.count_messages(&context.messages)
            + context.checkpoints.iter().map(|c| c.current_tokens).sum::<usize>();

        let manager = CheckpointManager::new(&self.token_counter);
        for checkpoint in context.checkpoints.iter_mut() {
            if checkpoint.level > CheckpointLevel::One {
                manager.compact_one_level(checkpoint);
            }
        }
        manager.merge_all_level_1_checkpoints(&mut context.checkpoints);

        let tokens_after = self.token_counter.count_messages(&context.messages)
            + context.checkpoints.iter().map(|c| c.current_tokens).sum::<usize>();

        context.metadata.compression_history.push(CompressionHistoryEntry {
            timestamp: chrono::Utc::now(),
            kind: CompressionKind::Emergency,
            tokens_before,
            tokens_after,
        });
        context.metadata.compression_count += 1;

        CompressionOutcome::Compressed { tokens_before, tokens_after }
    }

    /// The contiguous prefix of non-user messages that follows the last
    /// existing checkpoint and precedes the preserved-recent window.
    fn select_compression_range(&self, context: &ConversationContext) -> Option<(usize, usize)> {
        let preserved_start_index = self.preserved_window_start(context)?;
        let range_start = context
            .checkpoints
            .last()
            .map(|c| c.range_end)
            .unwrap_or(0);

        let eligible_indices: Vec<usize> = context
            .message_indices
            .iter()
            .copied()
            .zip(context.messages.iter())
            .filter(|(idx, m)| *idx >= range_start && *idx < preserved_start_index && !m.role.is_user())
            .map(|(idx, _)| idx)
            .collect();

        let first = *eligible_indices.first()?;
        let last = *eligible_indices.last()?;
        Some((first, last + 1))
    }

    /// Historical index of the first message in the preserved-recent window:
    /// the tail of the message list reaching back far enough to contain a
    /// configured amount of recent non-user content (default: last 2048
    /// tokens' worth or last 10 non-user messages, whichever is larger).
    /// User messages inside that tail ride along for free; user messages
    /// further back remain outside the window but are still never eligible
    /// for compression (P3), since the range selector only considers
    /// non-user messages in the first place.
    fn preserved_window_start(&self, context: &ConversationContext) -> Option<usize> {
        if context.messages.is_empty() {
            return None;
        }
        let mut running_tokens = 0usize;
        let mut kept = 0usize;
        let mut position = context.messages.len() - 1;

        for i in (0..context.messages.len()).rev() {
            position = i;
            let message = &context.messages[i];
            if !message.role.is_user() {
                running_tokens += self.token_counter.count_message(message);
                kept += 1;
                if running_tokens >= self.config.preserved_recent_tokens || kept >= self.config.preserved_recent_messages {
                    break;
                }
            }
        }
        Some(context.message_indices[position])
    }

    /// Previews what `drain_non_user_range` would remove, without mutating
    /// `context`: only the non-user messages in the span.
    fn peek_range(&self, context: &ConversationContext, range_start: usize, range_end: usize) -> Vec<Message> {
        context
            .message_indices
            .iter()
            .zip(context.messages.iter())
            .filter(|(idx, m)| **idx >= range_start && **idx < range_end && !m.role.is_user())
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn build_summarization_prompt(&self, messages: &[Message]) -> String {
        let mut prompt = String::from(SUMMARIZATION_SYSTEM_PROMPT);
        prompt.push_str("\n\nConversation slice:\n\n");
        for message in messages {
            prompt.push_str(&format!("{}: {}\n\n", message.role, message.text()));
        }
        prompt
    }
}

static DECISION_PATTERN: &str = r"(?i)\b(decided|chose|selected|agreed) (?:to|on) ([^.\n]{1,120})";
static FILE_PATTERN: &str = r"(?i)\b(created|modified|edited|updated|wrote|deleted) ([\w./\\-]+\.[\w]{1,8})";

fn extract_key_decisions_and_files(messages: &[Message]) -> (Vec<String>, Vec<String>) {
    let decision_re = Regex::new(DECISION_PATTERN).expect("valid decision regex");
    let file_re = Regex::new(FILE_PATTERN).expect("valid file regex");

    let mut decisions = Vec::new();
    let mut files = Vec::new();

    for message in messages {
        let text = message.text();
        for capture in decision_re.captures_iter(&text) {
            let decision = format!("{} {}", &capture[1], &capture[2]).trim().to_string();
            if decisions.len() < cce_schema::checkpoint::MAX_KEY_DECISIONS && !decisions.contains(&decision) {
                decisions.push(decision);
            }
        }
        for capture in file_re.captures_iter(&text) {
            let file = capture[2].to_string();
            if files.len() < cce_schema::checkpoint::MAX_FILES_MODIFIED && !files.contains(&file) {
                files.push(file);
            }
        }
    }

    (decisions, files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cce_provider::mock::MockProvider;
    use cce_schema::Mode;

    fn build_context_with_messages(n: usize) -> ConversationContext {
        let mut ctx = ConversationContext::new("s1".into(), "m1".into(), Message::system("sys"), Mode::Assistant, 3, 8192);
        for i in 0..n {
            ctx.push_message(Message::assistant(format!("assistant turn {i} with enough text to count as real content here")));
        }
        ctx
    }

    #[test]
    fn extraction_finds_decisions_and_files() {
        let messages = vec![Message::assistant(
            "We decided to use postgres for storage. I modified src/main.rs and created docs/plan.md.",
        )];
        let (decisions, files) = extract_key_decisions_and_files(&messages);
        assert!(decisions.iter().any(|d| d.contains("postgres")));
        assert!(files.contains(&"src/main.rs".to_string()));
        assert!(files.contains(&"docs/plan.md".to_string()));
    }

    #[tokio::test]
    async fn run_normal_compression_skips_small_ranges() {
        let provider = Arc::new(MockProvider::with_summary("summary"));
        let counter = Arc::new(TokenCounter::default());
        let coordinator = CompressionCoordinator::new(provider, counter, CompressionCoordinatorConfig::default());

        let mut ctx = build_context_with_messages(1);
        let outcome = coordinator.run_normal_compression(&mut ctx).await.unwrap();
        assert!(matches!(outcome, CompressionOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn run_normal_compression_replaces_range_with_checkpoint() {
        let provider = Arc::new(MockProvider::with_summary("concise summary of the middle turns"));
        let counter = Arc::new(TokenCounter::default());
        let mut config = CompressionCoordinatorConfig::default();
        config.preserved_recent_messages = 2;
        let coordinator = CompressionCoordinator::new(provider, counter, config);

        let mut ctx = build_context_with_messages(10);
        let before_len = ctx.messages.len();
        let outcome = coordinator.run_normal_compression(&mut ctx).await.unwrap();

        assert!(matches!(outcome, CompressionOutcome::Compressed { .. }));
        assert_eq!(ctx.checkpoints.len(), 1);
        assert_eq!(ctx.checkpoints[0].level, CheckpointLevel::Three);
        assert!(ctx.messages.len() < before_len);
    }

    #[tokio::test]
    async fn run_normal_compression_never_folds_interleaved_user_messages() {
        let provider = Arc::new(MockProvider::with_summary("concise summary of the middle turns"));
        let counter = Arc::new(TokenCounter::default());
        let mut config = CompressionCoordinatorConfig::default();
        config.preserved_recent_messages = 2;
        config.min_compression_messages = 1;
        config.min_compression_tokens = 1;
        let coordinator = CompressionCoordinator::new(provider, counter, config);

        let mut ctx = ConversationContext::new("s1".into(), "m1".into(), Message::system("sys"), Mode::Assistant, 3, 8192);
        let mut user_texts = Vec::new();
        for i in 0..10 {
            let user_text = format!("user turn {i} asking a long question with plenty of padding text to burn tokens");
            user_texts.push(user_text.clone());
            ctx.push_message(Message::user(user_text));
            ctx.push_message(Message::assistant(format!(
                "assistant turn {i} replying with plenty of padding text to burn tokens quickly here"
            )));
        }

        let before_user_count = ctx.user_messages().len();
        let outcome = coordinator.run_normal_compression(&mut ctx).await.unwrap();
        assert!(matches!(outcome, CompressionOutcome::Compressed { .. }));

        // Every user message must still be present, verbatim, in the working set.
        assert_eq!(ctx.user_messages().len(), before_user_count);
        let remaining_user_texts: Vec<String> = ctx.user_messages().iter().map(|m| m.text()).collect();
        assert_eq!(remaining_user_texts, user_texts);

        // The checkpoint's key-decision/file extraction never saw user text either.
        let checkpoint = &ctx.checkpoints[0];
        assert!(checkpoint.range_end > checkpoint.range_start + 1, "range should span interleaved user turns");
    }

    #[test]
    fn emergency_compression_merges_level_one_checkpoints() {
        let provider = Arc::new(MockProvider::with_summary("unused"));
        let counter = Arc::new(TokenCounter::default());
        let coordinator = CompressionCoordinator::new(provider, counter, CompressionCoordinatorConfig::default());

        let mut ctx = build_context_with_messages(0);
        ctx.checkpoints.push(Checkpoint {
            id: Uuid::new_v4(),
            level: CheckpointLevel::One,
            range_start: 0,
            range_end: 5,
            summary: Message::system("first"),
            original_tokens: 100,
            current_tokens: 50,
            compression_count: 1,
            compression_number: 0,
            key_decisions: vec![],
            files_modified: vec![],
            created_at: chrono::Utc::now(),
            last_aged_at: chrono::Utc::now(),
        });
        ctx.checkpoints.push(Checkpoint {
            id: Uuid::new_v4(),
            level: CheckpointLevel::One,
            range_start: 5,
            range_end: 10,
            summary: Message::system("second"),
            original_tokens: 100,
            current_tokens: 50,
            compression_count: 1,
            compression_number: 1,
            key_decisions: vec![],
            files_modified: vec![],
            created_at: chrono::Utc::now(),
            last_aged_at: chrono::Utc::now(),
        });

        let outcome = coordinator.run_emergency_compression(&mut ctx);
        assert!(matches!(outcome, CompressionOutcome::Compressed { .. }));
        assert_eq!(ctx.checkpoints.len(), 1);
        assert_eq!(ctx.checkpoints[0].level, CheckpointLevel::Merged);
    }

    #[tokio::test]
    async fn lock_reports_in_progress_during_a_slow_pass() {
        let provider = Arc::new(MockProvider::with_summary("slow summary").with_summarize_delay(Duration::from_millis(150)));
        let counter = Arc::new(TokenCounter::default());
        let coordinator = Arc::new(CompressionCoordinator::new(provider, counter, CompressionCoordinatorConfig::default()));

        let mut ctx = build_context_with_messages(10);
        let coordinator_clone = coordinator.clone();
        let handle = tokio::spawn(async move {
            let mut ctx = build_context_with_messages(10);
            let _ = coordinator_clone.run_normal_compression(&mut ctx).await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(coordinator.is_summarization_in_progress());
        let _ = coordinator.run_normal_compression(&mut ctx).await;
        handle.await.unwrap();
    }
}
