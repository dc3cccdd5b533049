use serde::{Deserialize, Serialize};

use cce_schema::{Message, Role};

/// A block of message content passed to/from a Provider. Distinct from
/// `cce_schema::ContentPart`: this is the wire-facing shape the Provider
/// trait speaks, translated at the ContextManager/CompressionCoordinator
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { mime_type: String, data: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: String, is_error: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ProviderMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    /// Converts a stored `Message` into the wire-facing shape a Provider
    /// call expects, collapsing its content parts to a single text block.
    pub fn from_message(message: &Message) -> Self {
        Self::text(message.role, message.text())
    }

    pub fn as_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.clone()),
                ContentBlock::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Options passed with a chat/summarize call. `num_ctx` is always the exact
/// `ollama_context_size` taken from the selected context profile; the CCE
/// never scales it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptions {
    pub num_ctx: usize,
    pub temperature: f32,
    pub think: bool,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            num_ctx: 8192,
            temperature: 0.7,
            think: true,
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneMetadata {
    pub input_tokens: Option<usize>,
    pub output_tokens: Option<usize>,
    pub stop_reason: Option<String>,
}

/// A tagged-union stream event, per DESIGN NOTES "dynamic typing -> tagged
/// variants".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta { text: String },
    ToolCall { id: String, name: String, input: serde_json::Value },
    Thinking { text: String },
    Done { metadata: DoneMetadata },
    Error { message: String },
}
