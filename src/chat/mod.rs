pub mod console;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
}

/// One inbound chat event. `channel_id` is the thread id for replies
/// posted inside a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub from_bot: bool,
}

impl IncomingMessage {
    pub fn is_command(&self) -> bool {
        self.content.trim_start().starts_with('/')
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embed {
    pub title: String,
    pub description: Option<String>,
    pub fields: Vec<EmbedField>,
}

impl Embed {
    pub fn new(title: impl Into<String>) -> Self {
        Embed {
            title: title.into(),
            description: None,
            fields: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Embed(Embed),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    /// Flattens the reply for transports without rich formatting.
    pub fn to_text(&self) -> String {
        match self {
            Reply::Text(text) => text.clone(),
            Reply::Embed(embed) => {
                let mut out = format!("**{}**", embed.title);
                if let Some(description) = &embed.description {
                    out.push('\n');
                    out.push_str(description);
                }
                for field in &embed.fields {
                    out.push_str(&format!("\n{}: {}", field.name, field.value));
                }
                out
            }
        }
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Text(text)
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::Text(text.to_string())
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, channel_id: &str, reply: Reply) -> anyhow::Result<()>;

    /// Opens a thread under `message` and returns the new thread id.
    async fn create_thread(&self, message: &IncomingMessage, name: &str) -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeds_flatten_to_text() {
        let reply = Reply::Embed(
            Embed::new("Bot status")
                .description("All good")
                .field("Ledger", "✅")
                .field("LLM", "❌ timeout"),
        );
        assert_eq!(
            reply.to_text(),
            "**Bot status**\nAll good\nLedger: ✅\nLLM: ❌ timeout"
        );
    }

    #[test]
    fn commands_start_with_a_slash() {
        let message = IncomingMessage {
            id: "1".to_string(),
            channel_id: "main".to_string(),
            author_id: "u".to_string(),
            content: "  /ping".to_string(),
            attachments: vec![],
            from_bot: false,
        };
        assert!(message.is_command());
    }
}
