pub mod discord;

use anyhow::Result;
use async_trait::async_trait;

/// A file attached to a chat message
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
}

/// A message received from the chat platform
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message_id: u64,
    pub channel_id: u64,
    /// Absent for direct messages
    pub guild_id: Option<u64>,
    /// Resolved only for guild messages carrying attachments
    pub channel_name: Option<String>,
    pub user_id: u64,
    /// Author tag as shown by the platform (e.g. "alice" or "alice#1234")
    pub user_name: String,
    pub author_is_bot: bool,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl IncomingMessage {
    pub fn is_direct_message(&self) -> bool {
        self.guild_id.is_none()
    }
}

/// Reaction markers reflecting processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Pending,
    Success,
    Failure,
}

impl Marker {
    pub fn emoji(self) -> &'static str {
        match self {
            Marker::Pending => "⏳",
            Marker::Success => "✅",
            Marker::Failure => "❌",
        }
    }
}

/// Operations the relay flow needs from a chat platform.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn react(&self, msg: &IncomingMessage, marker: Marker) -> Result<()>;

    /// Remove every reaction on the message.
    async fn clear_reactions(&self, msg: &IncomingMessage) -> Result<()>;

    async fn reply(&self, msg: &IncomingMessage, text: &str) -> Result<()>;
}
