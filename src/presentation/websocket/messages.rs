//! WebSocket Message Types
//!
//! JSON envelopes pushed to clients, discriminated by `type`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChatMessage, MessageStatus, MessageType};

/// Server-to-client envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionEstablished {
        client_id: String,
        user_id: i64,
        session_id: String,
    },
    NewMessage(NewMessage),
    Participant(ParticipantEvent),
}

impl ServerEvent {
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Broadcast form of a delivered chat message. File fields appear only when
/// the message carries a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub content: String,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub client_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl From<&ChatMessage> for NewMessage {
    fn from(message: &ChatMessage) -> Self {
        let mut event = Self {
            message_id: message.id,
            chat_id: message.chat_id,
            user_id: message.user_id,
            content: message.content.clone(),
            message_type: message.message_type,
            status: message.status,
            client_id: message.client_id.clone(),
            timestamp: message.created_at,
            file_url: None,
            file_name: None,
            file_size: None,
            mime_type: None,
        };
        if message.has_file() {
            event.file_url = message.file_url.clone();
            event.file_name = message.file_name.clone();
            event.file_size = message.file_size;
            event.mime_type = message.mime_type.clone();
        }
        event
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    Added,
    Entered,
    Leaved,
    Removed,
    Deleted,
}

/// Membership change, published by chat management through the same hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantEvent {
    pub chat_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    pub action: ParticipantAction,
}
