//! Message Handlers

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};

use crate::application::dto::{MessagesResponse, SendMessageRequest};
use crate::domain::ChatMessage;
use crate::presentation::middleware::AuthUser;
use crate::shared::error::AppError;
use crate::startup::AppState;

/// Get the history of a chat
pub async fn get_messages(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(chat_id): Path<String>,
) -> Result<Json<MessagesResponse>, AppError> {
    let chat_id: i64 = chat_id
        .parse()
        .map_err(|_| AppError::BadRequest("Invalid chat ID".into()))?;

    let messages = state.messages.get_messages(auth.user_id, chat_id).await?;
    Ok(Json(messages.into()))
}

/// Send a message
pub async fn send_message(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<ChatMessage>), AppError> {
    let message = state.messages.send_message(auth.user_id, body).await?;
    Ok((StatusCode::CREATED, Json(message)))
}
