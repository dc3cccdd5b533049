use std::pin::Pin;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_core::Stream;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::types::{ChatOptions, DoneMetadata, ProviderMessage, StreamEvent};
use crate::Provider;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Talks to a local Ollama-compatible `/api/chat` endpoint. NDJSON framed:
/// one JSON object per line, the last one carrying `"done": true`.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(model: impl Into<String>) -> Result<Self> {
        Self::with_base(DEFAULT_BASE_URL, model)
    }

    pub fn with_base(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("building ollama http client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        })
    }

    fn to_wire_messages(messages: &[ProviderMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.to_string(),
                    "content": m.as_text(),
                })
            })
            .collect()
    }

    fn request_body(&self, messages: &[ProviderMessage], options: &ChatOptions, stream: bool) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": Self::to_wire_messages(messages),
            "stream": stream,
            "think": options.think,
            "options": {
                "num_ctx": options.num_ctx,
                "temperature": options.temperature,
            },
        })
    }
}

fn parse_line(line: &str) -> Result<StreamEvent> {
    let value: serde_json::Value =
        serde_json::from_str(line).with_context(|| format!("malformed ollama chunk: {line}"))?;

    if let Some(err) = value.get("error").and_then(|v| v.as_str()) {
        return Ok(StreamEvent::Error { message: err.to_string() });
    }

    let done = value.get("done").and_then(|v| v.as_bool()).unwrap_or(false);
    if done {
        return Ok(StreamEvent::Done {
            metadata: DoneMetadata {
                input_tokens: value.get("prompt_eval_count").and_then(|v| v.as_u64()).map(|n| n as usize),
                output_tokens: value.get("eval_count").and_then(|v| v.as_u64()).map(|n| n as usize),
                stop_reason: value
                    .get("done_reason")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            },
        });
    }

    let message = value
        .get("message")
        .ok_or_else(|| anyhow!("ollama chunk missing 'message' field"))?;

    if let Some(thinking) = message.get("thinking").and_then(|v| v.as_str()) {
        if !thinking.is_empty() {
            return Ok(StreamEvent::Thinking { text: thinking.to_string() });
        }
    }

    let content = message.get("content").and_then(|v| v.as_str()).unwrap_or("");
    Ok(StreamEvent::TextDelta { text: content.to_string() })
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn chat_stream(
        &self,
        messages: &[ProviderMessage],
        options: &ChatOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>> {
        let url = format!("{}/api/chat", self.base_url);
        let body = self.request_body(messages, options, true);
        debug!(model = %self.model, num_ctx = options.num_ctx, "sending ollama chat_stream request");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("sending ollama chat request")?
            .error_for_status()
            .context("ollama chat request returned an error status")?;

        let mut byte_stream = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buf = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(anyhow!("ollama stream read failed: {e}"));
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline_pos) = buf.find('\n') {
                    let line = buf[..newline_pos].trim().to_string();
                    buf.drain(..=newline_pos);
                    if line.is_empty() {
                        continue;
                    }
                    yield parse_line(&line);
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn summarize(&self, messages: &[ProviderMessage], options: &ChatOptions) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = self.request_body(messages, options, false);

        let response: serde_json::Value = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("sending ollama summarize request")?
            .error_for_status()
            .context("ollama summarize request returned an error status")?
            .json()
            .await
            .context("parsing ollama summarize response")?;

        response
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("ollama summarize response missing message.content"))
    }
}
