//! Deterministic, Provider-free transformations on the checkpoint list:
//! aging, textual re-summarization, and merging. Mirrors the teacher's
//! `prune_tool_results` style of pure, synchronous string surgery rather
//! than anything that calls out to a model.

use chrono::Utc;
use uuid::Uuid;

use cce_schema::{Checkpoint, CheckpointLevel, Message};

const AGE_TO_MERGED: u32 = 6;
const AGE_TO_MODERATE: u32 = 3;

fn header(range_start: usize, range_end: usize) -> String {
    format!("[Checkpoint {range_start}..{range_end}]")
}

/// Keeps the first 5 lines of the existing summary plus up to 3 key
/// decisions, reformatted under a `[Checkpoint <range>]` header.
pub fn moderate_summary(checkpoint: &Checkpoint) -> String {
    let body = checkpoint.summary.text();
    let kept_lines: Vec<&str> = body.lines().take(5).collect();
    let mut out = format!("{}\n{}", header(checkpoint.range_start, checkpoint.range_end), kept_lines.join("\n"));
    for decision in checkpoint.key_decisions.iter().take(3) {
        out.push_str("\n- ");
        out.push_str(decision);
    }
    out
}

/// Keeps only the first line of the existing summary, truncated to 100
/// characters, with the `[Checkpoint <range>]` header.
pub fn compact_summary(checkpoint: &Checkpoint) -> String {
    let body = checkpoint.summary.text();
    let first_line = body.lines().next().unwrap_or("");
    let truncated: String = first_line.chars().take(100).collect();
    format!("{}\n{}", header(checkpoint.range_start, checkpoint.range_end), truncated)
}

pub struct CheckpointManager<'a> {
    token_counter: &'a crate::token_counter::TokenCounter,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(token_counter: &'a crate::token_counter::TokenCounter) -> Self {
        Self { token_counter }
    }

    /// Ages every checkpoint in place against the current total compression
    /// count. Monotone: level never increases, compression_count never
    /// decreases (I5/P4).
    pub fn age_all(&self, checkpoints: &mut [Checkpoint], total_compressions: usize) {
        for checkpoint in checkpoints.iter_mut() {
            let age = total_compressions.saturating_sub(checkpoint.compression_number) as u32;

            if age >= AGE_TO_MERGED && checkpoint.level >= CheckpointLevel::Two {
                self.apply_level(checkpoint, CheckpointLevel::One, compact_summary(checkpoint));
            } else if age >= AGE_TO_MODERATE && checkpoint.level == CheckpointLevel::Three {
                self.apply_level(checkpoint, CheckpointLevel::Two, moderate_summary(checkpoint));
            }
        }
    }

    fn apply_level(&self, checkpoint: &mut Checkpoint, level: CheckpointLevel, new_text: String) {
        checkpoint.level = level;
        checkpoint.summary = Message::system(new_text);
        checkpoint.current_tokens = self.token_counter.count_message(&checkpoint.summary);
        checkpoint.compression_count += 1;
        checkpoint.last_aged_at = Utc::now();
    }

    /// Deterministic one-level-down compaction used by emergency
    /// compression: every checkpoint with level > 1 drops one level via the
    /// textual rules above, without consulting `total_compressions`.
    pub fn compact_one_level(&self, checkpoint: &mut Checkpoint) {
        let next = match checkpoint.level {
            CheckpointLevel::Three => Some((CheckpointLevel::Two, moderate_summary(checkpoint))),
            CheckpointLevel::Two => Some((CheckpointLevel::One, compact_summary(checkpoint))),
            CheckpointLevel::One | CheckpointLevel::Merged => None,
        };
        if let Some((level, text)) = next {
            self.apply_level(checkpoint, level, text);
        }
    }

    /// Replaces every level-1 checkpoint with a single merged checkpoint,
    /// preserving list order: the merged checkpoint occupies the position of
    /// the oldest contributor.
    pub fn merge_all_level_1_checkpoints(&self, checkpoints: &mut Vec<Checkpoint>) {
        let level_one_indices: Vec<usize> = checkpoints
            .iter()
            .enumerate()
            .filter(|(_, c)| c.level == CheckpointLevel::One)
            .map(|(i, _)| i)
            .collect();

        if level_one_indices.len() < 2 {
            return;
        }

        let merged = self.merge(checkpoints, &level_one_indices);
        let insert_at = level_one_indices[0];

        for &idx in level_one_indices.iter().rev() {
            checkpoints.remove(idx);
        }
        checkpoints.insert(insert_at, merged);
    }

    fn merge(&self, checkpoints: &[Checkpoint], indices: &[usize]) -> Checkpoint {
        let contributors: Vec<&Checkpoint> = indices.iter().map(|&i| &checkpoints[i]).collect();
        let first = contributors.first().expect("at least one contributor");
        let last = contributors.last().expect("at least one contributor");

        let combined_summary = contributors
            .iter()
            .map(|c| c.summary.text())
            .collect::<Vec<_>>()
            .join("\n---\n");
        let combined_text = format!(
            "{}\n{}",
            header(first.range_start, last.range_end),
            combined_summary
        );

        let mut key_decisions = Vec::new();
        let mut files_modified = Vec::new();
        for c in &contributors {
            for d in &c.key_decisions {
                if key_decisions.len() < cce_schema::checkpoint::MAX_KEY_DECISIONS && !key_decisions.contains(d) {
                    key_decisions.push(d.clone());
                }
            }
            for f in &c.files_modified {
                if files_modified.len() < cce_schema::checkpoint::MAX_FILES_MODIFIED && !files_modified.contains(f) {
                    files_modified.push(f.clone());
                }
            }
        }

        let original_tokens: usize = contributors.iter().map(|c| c.original_tokens).sum();
        let max_compression_count = contributors.iter().map(|c| c.compression_count).max().unwrap_or(0);
        let summary = Message::system(combined_text);
        let current_tokens = self.token_counter.count_message(&summary);

        Checkpoint {
            id: Uuid::new_v4(),
            level: CheckpointLevel::Merged,
            range_start: first.range_start,
            range_end: last.range_end,
            summary,
            original_tokens,
            current_tokens,
            compression_count: max_compression_count + 1,
            compression_number: first.compression_number,
            key_decisions,
            files_modified,
            created_at: Utc::now(),
            last_aged_at: Utc::now(),
        }
    }

    /// Enforces the per-tier checkpoint cap by merging the oldest
    /// checkpoints pairwise, in order, until the count fits.
    pub fn enforce_tier_cap(&self, checkpoints: &mut Vec<Checkpoint>, cap: usize) {
        while checkpoints.len() > cap && checkpoints.len() >= 2 {
            let a = checkpoints.remove(0);
            let b = checkpoints.remove(0);
            let merged = self.merge_pair(&a, &b);
            checkpoints.insert(0, merged);
        }
    }

    fn merge_pair(&self, a: &Checkpoint, b: &Checkpoint) -> Checkpoint {
        let (first, second) = if a.range_start <= b.range_start { (a, b) } else { (b, a) };
        let combined_text = format!(
            "{}\n{}\n---\n{}",
            header(first.range_start, second.range_end),
            first.summary.text(),
            second.summary.text()
        );

        let mut key_decisions = first.key_decisions.clone();
        for d in &second.key_decisions {
            if key_decisions.len() < cce_schema::checkpoint::MAX_KEY_DECISIONS && !key_decisions.contains(d) {
                key_decisions.push(d.clone());
            }
        }
        let mut files_modified = first.files_modified.clone();
        for f in &second.files_modified {
            if files_modified.len() < cce_schema::checkpoint::MAX_FILES_MODIFIED && !files_modified.contains(f) {
                files_modified.push(f.clone());
            }
        }

        let summary = Message::system(combined_text);
        let current_tokens = self.token_counter.count_message(&summary);

        Checkpoint {
            id: Uuid::new_v4(),
            level: first.level.min(second.level),
            range_start: first.range_start,
            range_end: second.range_end,
            summary,
            original_tokens: first.original_tokens + second.original_tokens,
            current_tokens,
            compression_count: first.compression_count.max(second.compression_count) + 1,
            compression_number: first.compression_number.min(second.compression_number),
            key_decisions,
            files_modified,
            created_at: Utc::now(),
            last_aged_at: Utc::now(),
        }
    }
}
