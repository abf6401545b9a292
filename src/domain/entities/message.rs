//! Chat message entity and repository trait.
//!
//! `ChatMessage` is both the persisted row and the JSON envelope carried on
//! the bus, so its serde representation is part of the wire format.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shared::error::AppError;

/// Kind of content a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageType {
    /// Parse the database representation. Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of a message.
///
/// The send path creates messages as `Sent`; the consumer moves them to
/// `Delivered`. `Read` belongs to read receipts, which this service never sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a message fails domain validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidMessage {
    #[error("chatId is required")]
    MissingChat,

    #[error("userId is required")]
    MissingUser,

    #[error("content is required for text messages")]
    EmptyText,
}

/// A chat message.
///
/// Maps to the `messages` table and to the JSON value published on the
/// main topic (camelCase keys).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Primary key, assigned by the repository on insert
    #[serde(default)]
    pub id: i64,

    #[serde(default)]
    pub chat_id: i64,

    /// Sender
    #[serde(default)]
    pub user_id: i64,

    #[serde(rename = "type", default)]
    pub message_type: MessageType,

    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub status: MessageStatus,

    /// Sender-supplied correlation token, echoed back on broadcast
    #[serde(default)]
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    #[serde(default = "unix_epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "unix_epoch")]
    pub updated_at: DateTime<Utc>,
}

/// Timestamp used when a bus payload omits one.
fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl ChatMessage {
    /// Check the invariants every persisted message must satisfy.
    pub fn validate(&self) -> Result<(), InvalidMessage> {
        if self.chat_id == 0 {
            return Err(InvalidMessage::MissingChat);
        }
        if self.user_id == 0 {
            return Err(InvalidMessage::MissingUser);
        }
        if self.message_type == MessageType::Text && self.content.is_empty() {
            return Err(InvalidMessage::EmptyText);
        }
        Ok(())
    }

    /// Partition key used on the bus; keeps one chat on one partition.
    pub fn partition_key(&self) -> String {
        chat_partition_key(self.chat_id)
    }

    pub fn has_file(&self) -> bool {
        self.file_url.is_some()
    }
}

/// `chat_<id>` key shared by every message of a chat.
pub fn chat_partition_key(chat_id: i64) -> String {
    format!("chat_{}", chat_id)
}

/// Repository trait for message persistence.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Insert a message and return it with its assigned id and timestamps.
    async fn create_message(&self, message: &ChatMessage) -> Result<ChatMessage, AppError>;

    /// Set the status of a message and bump `updated_at`.
    async fn update_message_status(&self, id: i64, status: MessageStatus) -> Result<(), AppError>;

    async fn get_message_by_id(&self, id: i64) -> Result<Option<ChatMessage>, AppError>;

    /// Claim messages still `sent` and untouched since `older_than`, oldest
    /// first. Claimed rows get a fresh `updated_at`, so later passes skip
    /// them until they age past the cutoff again.
    async fn claim_undelivered(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, AppError>;
}
