pub mod mock;
pub mod ollama;
pub mod types;

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;

pub use types::{ChatOptions, ContentBlock, DoneMetadata, ProviderMessage, StreamEvent, ToolDef};

/// The Provider abstraction the context engine calls into. Transport,
/// authentication, and vendor-specific wire formats are the concern of the
/// concrete implementation (external to the CCE per spec.md §1); the CCE
/// only ever programs against this trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stream a chat completion. Used for normal turn generation.
    async fn chat_stream(
        &self,
        messages: &[ProviderMessage],
        options: &ChatOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>>;

    /// Non-streaming summarization call used by the compression coordinator.
    /// Always invoked with `options.think = false`.
    async fn summarize(&self, messages: &[ProviderMessage], options: &ChatOptions) -> Result<String>;
}
