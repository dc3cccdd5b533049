use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type MessageId = Uuid;

/// A piece of a message's content: plain text, or a structured tool
/// interaction. Most messages are a single `Text` part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ToolCall { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_call_id: String, content: String, is_error: bool },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// The raw text this part contributes to token accounting and display.
    pub fn as_text(&self) -> String {
        match self {
            ContentPart::Text { text } => text.clone(),
            ContentPart::ToolCall { name, input, .. } => format!("{name}({input})"),
            ContentPart::ToolResult { content, .. } => content.clone(),
        }
    }
}

/// An immutable record in the conversation. Once appended, content never
/// changes; user messages additionally may never be compressed, redacted,
/// truncated, or dropped from the full-history record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: Vec<ContentPart>,
    pub created_at: DateTime<Utc>,
    /// Cached token count from the last time TokenCounter measured this
    /// message; invalidated only if content changes, which it never does.
    #[serde(default)]
    pub cached_tokens: Option<usize>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: vec![ContentPart::text(text)],
            created_at: Utc::now(),
            cached_tokens: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self::new(Role::Tool, text)
    }

    /// Concatenated text of all content parts, in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn is_user(&self) -> bool {
        matches!(self, Role::User)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        write!(f, "{s}")
    }
}
