//! Approximate token counting for messages and raw text.
//!
//! Estimation is character-based (chars / 3.5), matching the rough heuristic
//! real tokenizers converge on for English text; exact tokenization varies
//! by model and is not available to a CLI that talks to an arbitrary local
//! backend. Results are cached by content hash since the same message text
//! is re-measured on every prompt rebuild.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use cce_schema::Message;

/// Calibrated characters-per-token ratio (~3.5), expressed as a fraction so
/// the division stays integer: `chars * CHARS_PER_TOKEN_DEN / CHARS_PER_TOKEN_NUM`.
const CHARS_PER_TOKEN_NUM: usize = 7;
const CHARS_PER_TOKEN_DEN: usize = 2;

/// Minimum token cost attributed to any single message, covering role
/// markers and message framing overhead in the wire format.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Character-based estimate: UTF-8 character count divided by ~3.5,
/// clamped to at least 1 for non-empty input.
fn estimate_text_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    (chars * CHARS_PER_TOKEN_DEN).div_ceil(CHARS_PER_TOKEN_NUM).max(1)
}

fn content_hash(text: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

struct LruCache {
    capacity: usize,
    map: HashMap<[u8; 32], usize>,
    order: Vec<[u8; 32]>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn get(&mut self, key: &[u8; 32]) -> Option<usize> {
        if let Some(&value) = self.map.get(key) {
            self.touch(key);
            Some(value)
        } else {
            None
        }
    }

    fn put(&mut self, key: [u8; 32], value: usize) {
        if self.map.insert(key, value).is_some() {
            self.touch(&key);
            return;
        }
        self.order.push(key);
        if self.order.len() > self.capacity {
            let evicted = self.order.remove(0);
            self.map.remove(&evicted);
        }
    }

    fn touch(&mut self, key: &[u8; 32]) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(pos);
            self.order.push(key);
        }
    }
}

/// Counts tokens for messages and raw strings, caching by content hash so a
/// checkpoint's summary or an unchanged message is never re-measured twice.
pub struct TokenCounter {
    cache: Mutex<LruCache>,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl TokenCounter {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(cache_capacity)),
        }
    }

    pub fn count_text(&self, text: &str) -> usize {
        let key = content_hash(text);
        let mut cache = self.cache.lock().expect("token counter cache poisoned");
        if let Some(cached) = cache.get(&key) {
            return cached;
        }
        let tokens = estimate_text_tokens(text);
        cache.put(key, tokens);
        tokens
    }

    pub fn count_message(&self, message: &Message) -> usize {
        if let Some(cached) = message.cached_tokens {
            return cached;
        }
        let text_tokens: usize = message.content.iter().map(|part| self.count_text(&part.as_text())).sum();
        text_tokens.max(MESSAGE_OVERHEAD_TOKENS)
    }

    pub fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cce_schema::Role;

    #[test]
    fn empty_text_counts_zero() {
        let counter = TokenCounter::default();
        assert_eq!(counter.count_text(""), 0);
    }

    #[test]
    fn text_tokens_round_up() {
        let counter = TokenCounter::default();
        assert_eq!(counter.count_text("hello"), 2); // 5 chars / 3.5 -> ceil = 2
        assert_eq!(counter.count_text("hello world test"), 5); // 16 chars / 3.5 -> ceil = 5
    }

    #[test]
    fn message_has_minimum_overhead() {
        let counter = TokenCounter::default();
        let msg = Message::new(Role::User, "hi");
        assert!(counter.count_message(&msg) >= MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn cached_tokens_field_short_circuits_recount() {
        let counter = TokenCounter::default();
        let mut msg = Message::new(Role::User, "a".repeat(4000));
        msg.cached_tokens = Some(7);
        assert_eq!(counter.count_message(&msg), 7);
    }

    #[test]
    fn repeated_text_hits_cache_with_same_result() {
        let counter = TokenCounter::new(4);
        let text = "the quick brown fox jumps over the lazy dog";
        let first = counter.count_text(text);
        let second = counter.count_text(text);
        assert_eq!(first, second);
    }

    #[test]
    fn cache_eviction_does_not_corrupt_results() {
        let counter = TokenCounter::new(2);
        let texts: Vec<String> = (0..10).map(|i| format!("message number {i}")).collect();
        for text in &texts {
            let first = counter.count_text(text);
            let second = counter.count_text(text);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn count_messages_sums_all() {
        let counter = TokenCounter::default();
        let messages = vec![Message::user("hello"), Message::assistant("world, how are you")];
        let total = counter.count_messages(&messages);
        assert_eq!(total, counter.count_message(&messages[0]) + counter.count_message(&messages[1]));
    }
}
