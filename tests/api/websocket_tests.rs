//! WebSocket upgrade over a real socket

use pretty_assertions::assert_eq;
use serde_json::Value;

use messenger::presentation::websocket::HubHandle;

use super::TestApp;
use crate::common::{eventually, mint_token, settings};

async fn connected_clients(hub: &HubHandle, expected: usize) -> bool {
    eventually(|| {
        let hub = hub.clone();
        async move { matches!(hub.client_count().await, Ok(n) if n == expected) }
    })
    .await
}

#[tokio::test]
async fn test_upgrade_requires_token() {
    let app = TestApp::with_http_transport(settings()).await;

    let response = app.server.get_websocket("/ws").await;

    response.assert_status_unauthorized();
}

#[tokio::test]
async fn test_oversized_frame_is_rejected_by_transport() {
    let app = TestApp::with_http_transport(settings()).await;
    let limit = app.pipeline.settings.websocket.max_message_size;

    let mut socket = app
        .server
        .get_websocket("/ws")
        .authorization_bearer(mint_token(3))
        .await
        .into_websocket()
        .await;

    let welcome: Value = socket.receive_json().await;
    assert_eq!(welcome["type"], "connection_established");
    assert_eq!(welcome["user_id"], 3);
    assert!(connected_clients(&app.pipeline.hub, 1).await);

    // Inbound text is fanned out through the hub, including to the sender.
    socket.send_text("hello").await;
    assert_eq!(socket.receive_text().await, "hello");

    socket.send_text("x".repeat(limit * 8)).await;
    assert!(connected_clients(&app.pipeline.hub, 0).await);
}
