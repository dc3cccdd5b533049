//! Input preprocessing pipeline run on every user turn before it enters the
//! working context: normalize whitespace, strip noisy blobs a model gains
//! nothing from seeing verbatim, and extract a short intent statement for
//! turns too long to keep whole. None of these steps may block a turn; a
//! failure anywhere just falls back to the original text.

use std::sync::Arc;

use regex::Regex;

use cce_provider::{ChatOptions, Provider, ProviderMessage};
use cce_schema::Role;

use crate::token_counter::TokenCounter;

const INTENT_SYSTEM_PROMPT: &str =
    "Restate the user's request as a single short sentence capturing only their intent. No preamble.";

#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Off by default: a dictionary-based typo fixer is a precision trap for
    /// code and paths, so it only runs when explicitly enabled.
    pub typo_fix_enabled: bool,
    pub max_intent_tokens: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            typo_fix_enabled: false,
            max_intent_tokens: 256,
        }
    }
}

/// Result of running one user turn through the pipeline. `original` is what
/// gets recorded to the session file; `cleaned` (or `intent`, if present) is
/// what gets inserted into the working context.
#[derive(Debug, Clone)]
pub struct PreprocessOutcome {
    pub original: String,
    pub cleaned: String,
    pub intent: Option<String>,
}

impl PreprocessOutcome {
    /// The text that should actually enter the working context: the intent
    /// statement if one was extracted, otherwise the cleaned text.
    pub fn for_context(&self) -> &str {
        self.intent.as_deref().unwrap_or(&self.cleaned)
    }
}

pub struct Preprocessor {
    provider: Option<Arc<dyn Provider>>,
    token_counter: Arc<TokenCounter>,
    config: PreprocessConfig,
    /// The session's frozen `ollama_context_size`, passed through verbatim as
    /// `num_ctx` on the intent-extraction call.
    context_limit: usize,
}

impl Preprocessor {
    pub fn new(
        provider: Option<Arc<dyn Provider>>,
        token_counter: Arc<TokenCounter>,
        config: PreprocessConfig,
        context_limit: usize,
    ) -> Self {
        Self {
            provider,
            token_counter,
            config,
            context_limit,
        }
    }

    pub async fn process(&self, raw: &str) -> PreprocessOutcome {
        let original = raw.to_string();
        let mut cleaned = normalize_whitespace(raw);
        cleaned = strip_noise(&cleaned);
        if self.config.typo_fix_enabled {
            cleaned = fix_common_typos(&cleaned);
        }

        let intent = if self.token_counter.count_text(&cleaned) > self.config.max_intent_tokens {
            Some(self.extract_intent(&cleaned).await)
        } else {
            None
        };

        PreprocessOutcome { original, cleaned, intent }
    }

    /// Tries a lightweight Provider call first; any error (timeout,
    /// malformed response, no provider configured) falls back to a
    /// heuristic extraction of the trimmed original so this step can never
    /// fail the turn.
    async fn extract_intent(&self, cleaned: &str) -> String {
        if let Some(provider) = &self.provider {
            let options = ChatOptions { think: false, num_ctx: self.context_limit, ..ChatOptions::default() };
            let prompt = format!("{INTENT_SYSTEM_PROMPT}\n\n{cleaned}");
            let messages = vec![ProviderMessage::text(Role::User, prompt)];
            if let Ok(intent) = provider.summarize(&messages, &options).await {
                return truncate_to_tokens(&intent, &self.token_counter, self.config.max_intent_tokens);
            }
        }
        heuristic_intent(cleaned, &self.token_counter, self.config.max_intent_tokens)
    }
}

fn normalize_whitespace(text: &str) -> String {
    let trimmed_lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let mut out = Vec::with_capacity(trimmed_lines.len());
    let mut blank_run = 0;
    for line in trimmed_lines {
        if line.is_empty() {
            blank_run += 1;
            if blank_run <= 1 {
                out.push(line);
            }
        } else {
            blank_run = 0;
            out.push(line);
        }
    }
    out.join("\n").trim().to_string()
}

fn base64_blob_pattern() -> Regex {
    Regex::new(r"[A-Za-z0-9+/]{40,}={0,2}").expect("valid base64 pattern")
}

fn hex_blob_pattern() -> Regex {
    Regex::new(r"\b[0-9a-fA-F]{32,}\b").expect("valid hex pattern")
}

fn is_log_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.len() >= 10
        && trimmed.as_bytes()[4] == b'-'
        && trimmed.as_bytes()[7] == b'-'
        && trimmed.chars().take(4).all(|c| c.is_ascii_digit())
}

fn is_stack_trace_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("at ")
        || trimmed.starts_with("File \"")
        || trimmed.starts_with("Traceback (most recent call last)")
        || trimmed.starts_with("panicked at")
}

/// Collapses runs of log-dump and stack-trace lines into a single marker,
/// and masks long base64/hex blobs inline. A model gains nothing from
/// seeing either verbatim, and both burn tokens out of proportion to their
/// information content.
fn strip_noise(text: &str) -> String {
    let base64_re = base64_blob_pattern();
    let hex_re = hex_blob_pattern();

    let mut out: Vec<String> = Vec::new();
    let mut noisy_run = 0usize;
    for line in text.lines() {
        if is_log_line(line) || is_stack_trace_line(line) {
            noisy_run += 1;
            continue;
        }
        if noisy_run > 0 {
            out.push(format!("[omitted: {noisy_run} line log/stack-trace block]"));
            noisy_run = 0;
        }
        let masked = hex_re.replace_all(line, "[omitted: hex blob]");
        let masked = base64_re.replace_all(&masked, "[omitted: base64 blob]");
        out.push(masked.into_owned());
    }
    if noisy_run > 0 {
        out.push(format!("[omitted: {noisy_run} line log/stack-trace block]"));
    }
    out.join("\n")
}

/// Placeholder correction pass for a small set of frequent coding-chat
/// typos. Disabled by default (`PreprocessConfig::typo_fix_enabled`); a
/// dictionary would need real evaluation before going on by default.
fn fix_common_typos(text: &str) -> String {
    text.replace("teh ", "the ").replace("recieve", "receive").replace("seperate", "separate")
}

fn truncate_to_tokens(text: &str, counter: &TokenCounter, max_tokens: usize) -> String {
    if counter.count_text(text) <= max_tokens {
        return text.trim().to_string();
    }
    let approx_chars = max_tokens.saturating_mul(4);
    text.chars().take(approx_chars).collect::<String>().trim().to_string()
}

/// First sentence (or first `max_tokens`-worth of characters, whichever is
/// shorter) of the cleaned text, used when no Provider is configured or the
/// Provider call failed.
fn heuristic_intent(cleaned: &str, counter: &TokenCounter, max_tokens: usize) -> String {
    let first_sentence = cleaned
        .split_inclusive(['.', '?', '!', '\n'])
        .next()
        .unwrap_or(cleaned)
        .trim();
    truncate_to_tokens(first_sentence, counter, max_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cce_provider::mock::MockProvider;

    #[tokio::test]
    async fn short_message_passes_through_unchanged() {
        let counter = Arc::new(TokenCounter::default());
        let preprocessor = Preprocessor::new(None, counter, PreprocessConfig::default(), 8192);
        let outcome = preprocessor.process("fix the login bug").await;
        assert_eq!(outcome.cleaned, "fix the login bug");
        assert!(outcome.intent.is_none());
        assert_eq!(outcome.for_context(), "fix the login bug");
    }

    #[tokio::test]
    async fn strips_stack_trace_block() {
        let counter = Arc::new(TokenCounter::default());
        let preprocessor = Preprocessor::new(None, counter, PreprocessConfig::default(), 8192);
        let raw = "it crashed:\nTraceback (most recent call last):\n  File \"app.py\", line 3\n  at foo.bar()\nplease fix";
        let outcome = preprocessor.process(raw).await;
        assert!(outcome.cleaned.contains("[omitted:"));
        assert!(!outcome.cleaned.contains("File \"app.py\""));
        assert!(outcome.cleaned.contains("please fix"));
    }

    #[tokio::test]
    async fn masks_long_base64_blob() {
        let counter = Arc::new(TokenCounter::default());
        let preprocessor = Preprocessor::new(None, counter, PreprocessConfig::default(), 8192);
        let blob = "Z".repeat(60);
        let raw = format!("here is the payload: {blob} does it work?");
        let outcome = preprocessor.process(&raw).await;
        assert!(outcome.cleaned.contains("[omitted: base64 blob]"));
        assert!(!outcome.cleaned.contains(&blob));
    }

    #[tokio::test]
    async fn long_message_gets_intent_extracted_via_provider() {
        let counter = Arc::new(TokenCounter::default());
        let provider = Arc::new(MockProvider::with_summary("user wants the login bug fixed"));
        let config = PreprocessConfig { max_intent_tokens: 5, ..Default::default() };
        let preprocessor = Preprocessor::new(Some(provider), counter, config, 8192);
        let raw = "please look into this thing ".repeat(30);
        let outcome = preprocessor.process(&raw).await;
        assert_eq!(outcome.intent.as_deref(), Some("user wants the login bug fixed"));
        assert_eq!(outcome.for_context(), "user wants the login bug fixed");
    }

    #[tokio::test]
    async fn long_message_falls_back_to_heuristic_without_provider() {
        let counter = Arc::new(TokenCounter::default());
        let config = PreprocessConfig { max_intent_tokens: 5, ..Default::default() };
        let preprocessor = Preprocessor::new(None, counter, config, 8192);
        let raw = format!("{} trailing content that would otherwise be kept", "word ".repeat(100));
        let outcome = preprocessor.process(&raw).await;
        assert!(outcome.intent.is_some());
    }

    #[tokio::test]
    async fn original_is_preserved_verbatim_regardless_of_cleaning() {
        let counter = Arc::new(TokenCounter::default());
        let preprocessor = Preprocessor::new(None, counter, PreprocessConfig::default(), 8192);
        let raw = "  messy   whitespace  \n\n\n\nhere  ";
        let outcome = preprocessor.process(raw).await;
        assert_eq!(outcome.original, raw);
        assert_ne!(outcome.original, outcome.cleaned);
    }
}
