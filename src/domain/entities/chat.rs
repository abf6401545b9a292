//! Chat and participant entities.
//!
//! Chats, participants and messages reference each other by id only; the
//! lookups needed for permission checks live on `ChatRepository`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::ChatMessage;
use crate::shared::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    #[default]
    Group,
    /// Broadcast-style chat where only owners and admins may post
    Channel,
}

impl ChatType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            "channel" => Some(Self::Channel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Channel => "channel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    Admin,
    #[default]
    Member,
}

impl ParticipantRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    pub created_by: i64,
    pub is_private: bool,
    pub max_members: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatParticipant {
    pub chat_id: i64,
    pub user_id: i64,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
}

impl ChatParticipant {
    /// Whether this participant may post into `chat`.
    ///
    /// Members are read-only in channels; every participant may post elsewhere.
    pub fn can_post_in(&self, chat: &Chat) -> bool {
        !(chat.chat_type == ChatType::Channel && self.role == ParticipantRole::Member)
    }
}

/// Chat lookups the message pipeline depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn get_chat_by_id(&self, chat_id: i64) -> Result<Option<Chat>, AppError>;

    async fn get_participant(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Option<ChatParticipant>, AppError>;

    /// Full history of a chat, oldest first.
    async fn get_messages_by_chat_id(&self, chat_id: i64) -> Result<Vec<ChatMessage>, AppError>;
}
