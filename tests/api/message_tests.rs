//! Message API Tests

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use messenger::domain::{ChatType, MessageStatus, ParticipantRole};

use super::TestApp;
use crate::common::{chat_message, eventually, mint_token, settings};

async fn app_with_chat() -> TestApp {
    let app = TestApp::new(settings()).await;
    app.pipeline.store.add_chat(7, ChatType::Group);
    app.pipeline.store.add_participant(7, 3, ParticipantRole::Member);
    app.pipeline.store.add_chat(8, ChatType::Channel);
    app.pipeline.store.add_participant(8, 3, ParticipantRole::Member);
    app
}

#[tokio::test]
async fn test_send_message_requires_token() {
    let app = app_with_chat().await;

    let response = app
        .server
        .post("/api/v1/messages")
        .json(&json!({"chatId": 7, "type": "text", "content": "hi", "clientId": "c1"}))
        .await;

    response.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(response.json::<Value>()["message"], "Missing authorization header");
}

#[tokio::test]
async fn test_send_message_persists_and_delivers() {
    let app = app_with_chat().await;

    let response = app
        .server
        .post("/api/v1/messages")
        .authorization_bearer(mint_token(3))
        .json(&json!({"chatId": 7, "type": "text", "content": "hi", "clientId": "c1"}))
        .await;

    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["chatId"], 7);
    assert_eq!(body["userId"], 3);
    assert_eq!(body["status"], "sent");
    assert_eq!(body["clientId"], "c1");

    let id = body["id"].as_i64().unwrap();
    let store = app.pipeline.store.clone();
    assert!(eventually(|| {
        let store = store.clone();
        async move { store.status_of(id) == Some(MessageStatus::Delivered) }
    })
    .await);
}

#[tokio::test]
async fn test_channel_member_gets_forbidden() {
    let app = app_with_chat().await;

    let response = app
        .server
        .post("/api/v1/messages")
        .authorization_bearer(mint_token(3))
        .json(&json!({"chatId": 8, "type": "text", "content": "hi", "clientId": "c1"}))
        .await;

    response.assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_invalid_body_is_rejected() {
    let app = app_with_chat().await;

    let response = app
        .server
        .post("/api/v1/messages")
        .authorization_bearer(mint_token(3))
        .json(&json!({"chatId": 7, "type": "text", "content": "", "clientId": "c1"}))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_chat_is_not_found() {
    let app = app_with_chat().await;

    let response = app
        .server
        .get("/api/v1/chats/999/messages")
        .authorization_bearer(mint_token(3))
        .await;

    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_history_for_participant() {
    let app = app_with_chat().await;
    app.pipeline.store.insert_message(chat_message(1, 7, 3));
    app.pipeline.store.insert_message(chat_message(2, 7, 4));
    app.pipeline.store.insert_message(chat_message(3, 8, 3));

    let response = app
        .server
        .get("/api/v1/chats/7/messages")
        .authorization_bearer(mint_token(3))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["count"], 2);
    assert_eq!(body["messages"][0]["id"], 1);
    assert_eq!(body["messages"][1]["id"], 2);
}

#[tokio::test]
async fn test_history_for_outsider_is_forbidden() {
    let app = app_with_chat().await;

    let response = app
        .server
        .get("/api/v1/chats/7/messages")
        .authorization_bearer(mint_token(42))
        .await;

    response.assert_status(StatusCode::FORBIDDEN);
}
