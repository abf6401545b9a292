//! Response DTOs

use serde::Serialize;

use crate::domain::ChatMessage;

/// Chat history
#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<ChatMessage>,
    pub count: usize,
}

impl From<Vec<ChatMessage>> for MessagesResponse {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Self {
            count: messages.len(),
            messages,
        }
    }
}
