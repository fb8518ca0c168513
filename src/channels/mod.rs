//! Channel abstraction for message I/O.

pub mod telegram;

pub use telegram::TelegramChannel;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Stream of inbound events produced by a channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Kind of uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Photo,
    Document,
}

/// Reference to a file the user uploaded. The bytes stay with the channel
/// until a collaborator fetches them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_id: String,
    pub kind: AttachmentKind,
    /// Channel-native message id, used to order a batch.
    pub message_id: i64,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

/// Chat commands the core reacts to. Both start the flow over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `/start`
    Start,
    /// `/restart`
    Restart,
}

impl Command {
    /// Parse a leading slash command, ignoring a `@botname` suffix.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.trim().split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);
        match name.to_lowercase().as_str() {
            "start" => Some(Self::Start),
            "restart" => Some(Self::Restart),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "/start",
            Self::Restart => "/restart",
        }
    }
}

/// What the user sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Text(String),
    Attachment(Attachment),
    Command(Command),
}

/// One inbound event, tagged with the user it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Channel-native id (Telegram update id).
    pub id: String,
    pub user_id: String,
    pub kind: InboundKind,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, kind: InboundKind) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            kind,
            received_at: Utc::now(),
        }
    }

    pub fn text(id: impl Into<String>, user_id: impl Into<String>, text: &str) -> Self {
        let kind = match Command::parse(text) {
            Some(cmd) => InboundKind::Command(cmd),
            None => InboundKind::Text(text.to_string()),
        };
        Self::new(id, user_id, kind)
    }
}

/// Outbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingContent {
    Text(String),
    Document {
        file_name: String,
        bytes: Vec<u8>,
        caption: Option<String>,
    },
}

/// A message to deliver to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub user_id: String,
    pub content: OutgoingContent,
}

impl OutgoingMessage {
    pub fn text(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            content: OutgoingContent::Text(text.into()),
        }
    }
}

/// Chat transport.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Begin receiving inbound events.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Deliver a message. Returns once the transport confirmed it.
    async fn send(&self, message: OutgoingMessage) -> Result<(), ChannelError>;

    /// Show a "typing…" hint while an event is processed.
    async fn send_typing(&self, _user_id: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
