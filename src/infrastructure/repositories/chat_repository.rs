//! Chat Repository Implementation
//!
//! PostgreSQL implementation of the ChatRepository trait: chat and
//! participant lookups plus chat history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::message_repository::MessageRow;
use crate::domain::{Chat, ChatMessage, ChatParticipant, ChatRepository, ChatType, ParticipantRole};
use crate::shared::error::AppError;

#[derive(Debug, sqlx::FromRow)]
struct ChatRow {
    id: i64,
    name: String,
    #[sqlx(rename = "type")]
    chat_type: String,
    created_by: i64,
    is_private: bool,
    max_members: i32,
    created_at: DateTime<Utc>,
}

impl ChatRow {
    fn into_chat(self) -> Result<Chat, AppError> {
        let chat_type = ChatType::parse(&self.chat_type)
            .ok_or_else(|| AppError::Internal(format!("unknown chat type: {}", self.chat_type)))?;
        Ok(Chat {
            id: self.id,
            name: self.name,
            chat_type,
            created_by: self.created_by,
            is_private: self.is_private,
            max_members: self.max_members,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ParticipantRow {
    chat_id: i64,
    user_id: i64,
    role: String,
    joined_at: DateTime<Utc>,
}

impl ParticipantRow {
    fn into_participant(self) -> Result<ChatParticipant, AppError> {
        let role = ParticipantRole::parse(&self.role)
            .ok_or_else(|| AppError::Internal(format!("unknown participant role: {}", self.role)))?;
        Ok(ChatParticipant {
            chat_id: self.chat_id,
            user_id: self.user_id,
            role,
            joined_at: self.joined_at,
        })
    }
}

#[derive(Clone)]
pub struct PgChatRepository {
    pool: PgPool,
}

impl PgChatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatRepository for PgChatRepository {
    async fn get_chat_by_id(&self, chat_id: i64) -> Result<Option<Chat>, AppError> {
        let row = sqlx::query_as::<_, ChatRow>(
            r#"
            SELECT id, name, type, created_by, is_private, max_members, created_at
            FROM chats
            WHERE id = $1
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChatRow::into_chat).transpose()
    }

    async fn get_participant(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Option<ChatParticipant>, AppError> {
        let row = sqlx::query_as::<_, ParticipantRow>(
            r#"
            SELECT chat_id, user_id, role, joined_at
            FROM chat_participants
            WHERE chat_id = $1 AND user_id = $2
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ParticipantRow::into_participant).transpose()
    }

    async fn get_messages_by_chat_id(&self, chat_id: i64) -> Result<Vec<ChatMessage>, AppError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, chat_id, user_id, type, content, status, client_id,
                   reply_to_id, file_url, file_name, file_size, mime_type,
                   created_at, updated_at
            FROM messages
            WHERE chat_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }
}
