//! Request DTOs
//!
//! Data structures for incoming API requests with validation.

use serde::Deserialize;
use validator::Validate;

use crate::domain::MessageType;

/// Send message request
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[validate(range(min = 1, message = "chatId is required"))]
    pub chat_id: i64,

    #[serde(default)]
    #[validate(length(max = 4000, message = "Content must be at most 4000 characters"))]
    pub content: String,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    pub reply_to_id: Option<i64>,

    #[validate(url(message = "fileUrl must be a valid URL"))]
    pub file_url: Option<String>,

    #[validate(length(max = 255, message = "fileName must be at most 255 characters"))]
    pub file_name: Option<String>,

    #[validate(range(min = 0, message = "fileSize must not be negative"))]
    pub file_size: Option<i64>,

    #[validate(length(max = 100, message = "mimeType must be at most 100 characters"))]
    pub mime_type: Option<String>,

    /// Sender-side correlation id echoed on broadcast
    #[validate(length(min = 1, max = 64, message = "clientId must be 1-64 characters"))]
    pub client_id: String,
}
