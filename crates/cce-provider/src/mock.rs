use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;

use crate::types::{ChatOptions, DoneMetadata, ProviderMessage, StreamEvent};
use crate::Provider;

/// Canned-response provider for tests and offline demos, grounded in the
/// word-by-word streaming idiom of a stub provider. Never touches the
/// network.
pub struct MockProvider {
    reply: String,
    summary: String,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn with_reply(text: impl Into<String>) -> Self {
        Self {
            reply: text.into(),
            summary: String::new(),
            delay: Duration::from_millis(0),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_summary(text: impl Into<String>) -> Self {
        Self {
            reply: String::new(),
            summary: text.into(),
            delay: Duration::from_millis(0),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Adds an artificial delay to `summarize`, used to exercise the
    /// summarization lock and its timeout.
    pub fn with_summarize_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn chat_stream(
        &self,
        _messages: &[ProviderMessage],
        _options: &ChatOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let words: Vec<String> = self.reply.split(' ').map(|w| w.to_string()).collect();
        let stream = async_stream::stream! {
            for (i, word) in words.iter().enumerate() {
                let text = if i == 0 { word.clone() } else { format!(" {word}") };
                yield Ok(StreamEvent::TextDelta { text });
            }
            yield Ok(StreamEvent::Done {
                metadata: DoneMetadata {
                    input_tokens: Some(0),
                    output_tokens: Some(words.len()),
                    stop_reason: Some("stop".to_string()),
                },
            });
        };
        Ok(Box::pin(stream))
    }

    async fn summarize(&self, _messages: &[ProviderMessage], _options: &ChatOptions) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay > Duration::from_millis(0) {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.summary.clone())
    }
}
