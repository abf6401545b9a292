//! Message Repository Implementation
//!
//! PostgreSQL implementation of `MessageRepository`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::{ChatMessage, MessageRepository, MessageStatus, MessageType};
use crate::shared::error::AppError;

const MESSAGE_COLUMNS: &str = "id, chat_id, user_id, type, content, status, client_id, \
     reply_to_id, file_url, file_name, file_size, mime_type, created_at, updated_at";

pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Internal row type for message queries.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MessageRow {
    id: i64,
    chat_id: i64,
    user_id: i64,
    #[sqlx(rename = "type")]
    message_type: String,
    content: String,
    status: String,
    client_id: String,
    reply_to_id: Option<i64>,
    file_url: Option<String>,
    file_name: Option<String>,
    file_size: Option<i64>,
    mime_type: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MessageRow {
    /// Converts a database row to the domain entity. Unknown enum values are
    /// a schema violation and reported as internal errors.
    pub(crate) fn into_message(self) -> Result<ChatMessage, AppError> {
        let message_type = MessageType::parse(&self.message_type).ok_or_else(|| {
            AppError::Internal(format!("unknown message type: {}", self.message_type))
        })?;
        let status = MessageStatus::parse(&self.status)
            .ok_or_else(|| AppError::Internal(format!("unknown message status: {}", self.status)))?;

        Ok(ChatMessage {
            id: self.id,
            chat_id: self.chat_id,
            user_id: self.user_id,
            message_type,
            content: self.content,
            status,
            client_id: self.client_id,
            reply_to_id: self.reply_to_id,
            file_url: self.file_url,
            file_name: self.file_name,
            file_size: self.file_size,
            mime_type: self.mime_type,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    /// Insert a message. The id is assigned by the database; timestamps are
    /// set to now regardless of what the caller passed.
    async fn create_message(&self, message: &ChatMessage) -> Result<ChatMessage, AppError> {
        tracing::debug!(chat_id = message.chat_id, user_id = message.user_id, "creating message");

        let row = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            INSERT INTO messages (chat_id, user_id, type, content, status, client_id,
                                  reply_to_id, file_url, file_name, file_size, mime_type,
                                  created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(message.chat_id)
        .bind(message.user_id)
        .bind(message.message_type.as_str())
        .bind(&message.content)
        .bind(message.status.as_str())
        .bind(&message.client_id)
        .bind(message.reply_to_id)
        .bind(&message.file_url)
        .bind(&message.file_name)
        .bind(message.file_size)
        .bind(&message.mime_type)
        .fetch_one(&self.pool)
        .await?;

        row.into_message()
    }

    async fn update_message_status(&self, id: i64, status: MessageStatus) -> Result<(), AppError> {
        tracing::debug!(message_id = id, status = %status, "update status message");

        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(message_id = id, error = %e, "error update status message");
            AppError::Database(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Message {} not found", id)));
        }
        Ok(())
    }

    async fn get_message_by_id(&self, id: i64) -> Result<Option<ChatMessage>, AppError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {} FROM messages WHERE id = $1",
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MessageRow::into_message).transpose()
    }

    async fn claim_undelivered(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, AppError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            UPDATE messages
            SET updated_at = NOW()
            WHERE id IN (
                SELECT id
                FROM messages
                WHERE status = 'sent' AND updated_at < $1
                ORDER BY created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(MessageRow::into_message)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING has no defined order
        messages.sort_by_key(|m| (m.created_at, m.id));
        Ok(messages)
    }
}
