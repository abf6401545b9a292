//! Message Service
//!
//! Both ends of the delivery pipeline: the send path persists and publishes,
//! the process path (fed by the bus consumer) broadcasts and marks delivered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::application::dto::SendMessageRequest;
use crate::domain::{
    Chat, ChatMessage, ChatRepository, InvalidMessage, MessageRepository, MessageStatus,
};
use crate::infrastructure::messaging::{MessageProcessor, Producer, ProducerError};
use crate::presentation::websocket::{HubHandle, NewMessage, ServerEvent};
use crate::shared::error::AppError;
use crate::shared::validation::validation_error;

/// Message service trait
#[async_trait]
pub trait MessageService: Send + Sync {
    /// Persist a message from `sender_id` and publish it to the bus
    async fn send_message(
        &self,
        sender_id: i64,
        request: SendMessageRequest,
    ) -> Result<ChatMessage, MessageError>;

    /// History of a chat the user participates in
    async fn get_messages(&self, user_id: i64, chat_id: i64)
        -> Result<Vec<ChatMessage>, MessageError>;

    /// Broadcast a consumed message and mark it delivered
    async fn process_message(&self, message: ChatMessage) -> Result<(), MessageError>;

    /// Publish again messages still `sent` after `older_than`
    async fn republish_stale(&self, older_than: Duration, limit: i64)
        -> Result<usize, MessageError>;
}

/// Message service errors
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Chat not found")]
    ChatNotFound,

    #[error("User is not a participant of this chat")]
    NotParticipant,

    #[error("Permission denied, members can't send messages to a channel")]
    Forbidden,

    #[error("Invalid message: {0}")]
    Invalid(#[from] InvalidMessage),

    #[error(transparent)]
    Publish(#[from] ProducerError),

    #[error(transparent)]
    App(#[from] AppError),
}

impl From<MessageError> for AppError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::ChatNotFound => AppError::NotFound(err.to_string()),
            MessageError::NotParticipant | MessageError::Forbidden => {
                AppError::Forbidden(err.to_string())
            }
            MessageError::Invalid(e) => AppError::Validation(e.to_string()),
            MessageError::Publish(e) => AppError::Unavailable(e.to_string()),
            MessageError::App(e) => e,
        }
    }
}

/// MessageService implementation
pub struct MessageServiceImpl<M, C>
where
    M: MessageRepository,
    C: ChatRepository,
{
    message_repo: Arc<M>,
    chat_repo: Arc<C>,
    producer: Arc<Producer>,
    hub: HubHandle,
    publish_attempts: u32,
}

impl<M, C> MessageServiceImpl<M, C>
where
    M: MessageRepository,
    C: ChatRepository,
{
    pub fn new(
        message_repo: Arc<M>,
        chat_repo: Arc<C>,
        producer: Arc<Producer>,
        hub: HubHandle,
        publish_attempts: u32,
    ) -> Self {
        Self {
            message_repo,
            chat_repo,
            producer,
            hub,
            publish_attempts: publish_attempts.max(1),
        }
    }

    /// Load the chat and check that `user_id` participates in it. With
    /// `posting`, channel members are rejected too.
    async fn authorize(&self, user_id: i64, chat_id: i64, posting: bool) -> Result<Chat, MessageError> {
        let chat = self
            .chat_repo
            .get_chat_by_id(chat_id)
            .await?
            .ok_or(MessageError::ChatNotFound)?;

        let participant = self
            .chat_repo
            .get_participant(user_id, chat_id)
            .await?
            .ok_or(MessageError::NotParticipant)?;

        if posting && !participant.can_post_in(&chat) {
            return Err(MessageError::Forbidden);
        }

        Ok(chat)
    }
}

#[async_trait]
impl<M, C> MessageService for MessageServiceImpl<M, C>
where
    M: MessageRepository + 'static,
    C: ChatRepository + 'static,
{
    async fn send_message(
        &self,
        sender_id: i64,
        request: SendMessageRequest,
    ) -> Result<ChatMessage, MessageError> {
        request.validate().map_err(validation_error)?;

        self.authorize(sender_id, request.chat_id, true).await?;

        let now = Utc::now();
        let message = ChatMessage {
            id: 0,
            chat_id: request.chat_id,
            user_id: sender_id,
            message_type: request.message_type,
            content: request.content,
            status: MessageStatus::Sent,
            client_id: request.client_id,
            reply_to_id: request.reply_to_id,
            file_url: request.file_url,
            file_name: request.file_name,
            file_size: request.file_size,
            mime_type: request.mime_type,
            created_at: now,
            updated_at: now,
        };
        message.validate()?;

        let message = self.message_repo.create_message(&message).await?;

        // The row stays `sent` if this fails; the reconciler picks it up.
        self.producer
            .publish_with_retry(&message.partition_key(), &message, self.publish_attempts)
            .await?;

        tracing::info!(
            message_id = message.id,
            chat_id = message.chat_id,
            user_id = sender_id,
            "Message sent"
        );
        Ok(message)
    }

    async fn get_messages(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Vec<ChatMessage>, MessageError> {
        self.authorize(user_id, chat_id, false).await?;
        Ok(self.chat_repo.get_messages_by_chat_id(chat_id).await?)
    }

    async fn process_message(&self, message: ChatMessage) -> Result<(), MessageError> {
        let mut event = NewMessage::from(&message);
        event.status = MessageStatus::Delivered;

        match ServerEvent::NewMessage(event).to_bytes() {
            Ok(payload) => {
                if let Err(e) = self.hub.broadcast(payload) {
                    tracing::warn!(message_id = message.id, error = %e, "Failed to broadcast message");
                }
            }
            Err(e) => {
                tracing::warn!(message_id = message.id, error = %e, "Failed to encode broadcast envelope");
            }
        }

        self.message_repo
            .update_message_status(message.id, MessageStatus::Delivered)
            .await?;

        tracing::debug!(message_id = message.id, chat_id = message.chat_id, "Message delivered");
        Ok(())
    }

    async fn republish_stale(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> Result<usize, MessageError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let stale = self.message_repo.claim_undelivered(cutoff, limit).await?;

        let mut republished = 0;
        for message in &stale {
            match self.producer.publish_json(&message.partition_key(), message).await {
                Ok(()) => republished += 1,
                Err(e) => {
                    tracing::warn!(message_id = message.id, error = %e, "Failed to republish message");
                }
            }
        }

        if !stale.is_empty() {
            tracing::info!(found = stale.len(), republished, "Republished undelivered messages");
        }
        Ok(republished)
    }
}

#[async_trait]
impl<M, C> MessageProcessor for MessageServiceImpl<M, C>
where
    M: MessageRepository + 'static,
    C: ChatRepository + 'static,
{
    async fn process_message(&self, message: ChatMessage) -> anyhow::Result<()> {
        Ok(MessageService::process_message(self, message).await?)
    }
}

/// Republish stale `sent` messages every `every` until `shutdown` fires.
///
/// Each republished row is claimed for another `older_than`, so a backlog
/// that outlives one pass is not republished again on every tick.
pub async fn run_reconciler(
    service: Arc<dyn MessageService>,
    every: Duration,
    older_than: Duration,
    shutdown: CancellationToken,
) {
    const BATCH: i64 = 100;

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = service.republish_stale(older_than, BATCH).await {
                    tracing::error!(error = %e, "Reconciler pass failed");
                }
            }
        }
    }
    tracing::debug!("Reconciler stopped");
}
