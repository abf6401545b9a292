//! WebSocket Connection Handler
//!
//! Authenticates the upgrade request, registers a `Client` with the hub and
//! runs both pumps for the lifetime of the socket.

use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::{header::USER_AGENT, HeaderMap},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;

use super::client::{Client, PumpConfig};
use super::hub::HubHandle;
use super::messages::ServerEvent;
use crate::config::WebSocketSettings;
use crate::presentation::middleware::{bearer_token, decode_token};
use crate::shared::error::AppError;
use crate::startup::AppState;

/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// also come as `?token=`.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

struct Peer {
    user_id: i64,
    user_agent: String,
    remote_addr: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let token = match bearer_token(&headers)? {
        Some(token) => token.to_owned(),
        None => query
            .token
            .ok_or_else(|| AppError::Unauthorized("Missing authorization token".into()))?,
    };
    let user = decode_token(&state.settings.jwt.secret, &token)?;

    let peer = Peer {
        user_id: user.user_id,
        user_agent: header_str(&headers, USER_AGENT.as_str()),
        remote_addr: header_str(&headers, "x-forwarded-for"),
    };
    let hub = state.hub.clone();
    let settings = state.settings.websocket.clone();

    // Frames past the limit are rejected by the transport before buffering.
    Ok(ws
        .max_message_size(settings.max_message_size)
        .max_frame_size(settings.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, peer, hub, settings)))
}

async fn handle_socket(socket: WebSocket, peer: Peer, hub: HubHandle, settings: WebSocketSettings) {
    let (client, outbound) = Client::new(
        peer.user_id,
        peer.user_agent,
        peer.remote_addr,
        hub.clone(),
        settings.outbound_queue_capacity,
    );
    hub.register(client.clone());

    tracing::info!(
        client_id = %client.id(),
        user_id = client.user_id(),
        session_id = %client.session_id(),
        "WebSocket connection established"
    );

    let welcome = ServerEvent::ConnectionEstablished {
        client_id: client.id().to_string(),
        user_id: client.user_id(),
        session_id: client.session_id().to_string(),
    };
    match welcome.to_bytes() {
        Ok(payload) => {
            if let Err(e) = client.try_send(payload) {
                tracing::warn!(client_id = %client.id(), error = %e, "Failed to queue welcome message");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode welcome message"),
    }

    let config = PumpConfig::from(&settings);
    let (sink, stream) = socket.split();

    let writer = tokio::spawn(client.clone().write_pump(sink, outbound, config.clone()));
    client.clone().read_pump(stream, config).await;

    if let Err(e) = writer.await {
        tracing::error!(client_id = %client.id(), error = %e, "Write pump task failed");
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}
