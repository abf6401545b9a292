//! Per-connection client actor.
//!
//! A `Client` owns one WebSocket connection through two tasks: the read pump
//! (the only reader of the socket) and the write pump (the only writer). The
//! pumps are generic over `Stream`/`Sink` so they run against an axum
//! `WebSocket` in production and plain channels in tests.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::hub::HubHandle;
use crate::config::WebSocketSettings;

const PREVIEW_LEN: usize = 100;

/// Connection tuning used by the pumps.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
    pub max_ping_failures: u32,
}

impl From<&WebSocketSettings> for PumpConfig {
    fn from(settings: &WebSocketSettings) -> Self {
        Self {
            write_wait: settings.write_wait(),
            pong_wait: settings.pong_wait(),
            ping_period: settings.ping_period(),
            max_message_size: settings.max_message_size,
            max_ping_failures: settings.max_ping_failures.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,

    #[error("client is closed")]
    Closed,
}

struct ClientState {
    is_active: bool,
    last_activity: Instant,
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
}

pub struct Client {
    id: Uuid,
    user_id: i64,
    session_id: Uuid,
    user_agent: String,
    remote_addr: String,
    state: Mutex<ClientState>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    done: CancellationToken,
    hub: HubHandle,
}

impl Client {
    /// Create a client and the receiving end of its outbound queue, which
    /// belongs to the write pump.
    pub fn new(
        user_id: i64,
        user_agent: impl Into<String>,
        remote_addr: impl Into<String>,
        hub: HubHandle,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let client = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            session_id: Uuid::new_v4(),
            user_agent: user_agent.into(),
            remote_addr: remote_addr.into(),
            state: Mutex::new(ClientState {
                is_active: true,
                last_activity: Instant::now(),
                last_ping: None,
                last_pong: None,
            }),
            outbound: Mutex::new(Some(tx)),
            done: CancellationToken::new(),
            hub,
        });
        (client, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().is_active
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    /// Cancelled once the client closes.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Queue a payload without waiting.
    pub fn try_send(&self, payload: Bytes) -> Result<(), SendError> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(SendError::Closed);
        };
        tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Tear the client down. Only the first call has any effect: it signals
    /// `done`, releases the outbound queue and asks the hub to forget the
    /// client. Never blocks.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if !state.is_active {
                return;
            }
            state.is_active = false;
        }

        tracing::debug!(
            client_id = %self.id,
            user_id = self.user_id,
            session_id = %self.session_id,
            user_agent = %self.user_agent,
            remote_addr = %self.remote_addr,
            "Close connection"
        );

        self.done.cancel();
        self.outbound.lock().take();
        self.hub.unregister(self.id);
    }

    fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    fn mark_pong(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.last_pong = Some(now);
        state.last_activity = now;
    }

    fn mark_ping(&self) {
        self.state.lock().last_ping = Some(Instant::now());
    }

    /// Whether the previous ping, if any, got a pong back.
    fn ping_answered(&self) -> bool {
        let state = self.state.lock();
        match (state.last_ping, state.last_pong) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(ping), Some(pong)) => pong >= ping,
        }
    }

    /// Read frames until error, close, deadline or `done`. Application
    /// frames go to the hub verbatim; pongs push the read deadline out.
    pub async fn read_pump<S>(self: Arc<Self>, mut stream: S, config: PumpConfig)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        tracing::debug!(
            client_id = %self.id,
            user_id = self.user_id,
            user_agent = %self.user_agent,
            remote_addr = %self.remote_addr,
            "ReadPump started"
        );

        let mut deadline = Instant::now() + config.pong_wait;
        let mut message_count: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.done.cancelled() => break,
                next = timeout_at(deadline, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    tracing::debug!(client_id = %self.id, "Read deadline exceeded");
                    break;
                }
                Ok(None) => {
                    tracing::debug!(client_id = %self.id, total_messages = message_count, "WebSocket connection closed");
                    break;
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(client_id = %self.id, error = %e, total_messages = message_count, "Unexpected WebSocket close");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let payload = match frame {
                Message::Text(text) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Message::Binary(data) => data,
                Message::Pong(_) => {
                    self.mark_pong();
                    deadline = Instant::now() + config.pong_wait;
                    continue;
                }
                Message::Ping(_) => {
                    self.touch();
                    continue;
                }
                Message::Close(_) => {
                    tracing::debug!(client_id = %self.id, total_messages = message_count, "Close frame received");
                    break;
                }
            };

            if payload.len() > config.max_message_size {
                tracing::warn!(
                    client_id = %self.id,
                    size = payload.len(),
                    limit = config.max_message_size,
                    "Message exceeds read limit"
                );
                break;
            }

            message_count += 1;
            self.touch();
            tracing::debug!(
                client_id = %self.id,
                message_size = payload.len(),
                message_preview = %preview(&payload),
                message_number = message_count,
                "Message received"
            );

            if self.hub.broadcast(payload).is_err() {
                tracing::warn!(client_id = %self.id, "Hub is gone, dropping connection");
                break;
            }
        }

        tracing::info!(client_id = %self.id, session_id = %self.session_id, "ReadPump stopped");
        self.close();
    }

    /// Drain the outbound queue into the socket and ping on a fixed period.
    /// Exits on close, a failed or late write, or too many unanswered pings.
    pub async fn write_pump<K>(
        self: Arc<Self>,
        mut sink: K,
        mut outbound: mpsc::Receiver<Bytes>,
        config: PumpConfig,
    ) where
        K: Sink<Message, Error = axum::Error> + Unpin,
    {
        tracing::debug!(client_id = %self.id, ping_interval = ?config.ping_period, "WritePump started");

        let mut ticker =
            tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sent_messages: u64 = 0;
        let mut ping_failures: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.done.cancelled() => break,
                next = outbound.recv() => {
                    let Some(payload) = next else {
                        tracing::debug!(client_id = %self.id, "Send queue closed, sending close message");
                        let _ = timeout(config.write_wait, sink.send(Message::Close(None))).await;
                        break;
                    };

                    let size = payload.len();
                    match timeout(config.write_wait, sink.send(frame(payload))).await {
                        Ok(Ok(())) => {
                            sent_messages += 1;
                            self.touch();
                            tracing::debug!(client_id = %self.id, message_size = size, total_sent = sent_messages, "Message sent to client");
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(client_id = %self.id, error = %e, "Failed to write message");
                            break;
                        }
                        Err(_) => {
                            tracing::warn!(client_id = %self.id, "Write deadline exceeded");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let answered = self.ping_answered();
                    let written = matches!(
                        timeout(config.write_wait, sink.send(Message::Ping(Bytes::new()))).await,
                        Ok(Ok(()))
                    );
                    if written {
                        self.mark_ping();
                    }

                    if written && answered {
                        ping_failures = 0;
                        self.touch();
                    } else {
                        ping_failures += 1;
                        tracing::warn!(
                            client_id = %self.id,
                            written,
                            answered,
                            consecutive_failures = ping_failures,
                            "Ping round-trip failed"
                        );
                        if ping_failures >= config.max_ping_failures {
                            tracing::info!(client_id = %self.id, failures = ping_failures, "Max ping failures reached, closing connection");
                            break;
                        }
                    }
                }
            }
        }

        let _ = timeout(config.write_wait, sink.close()).await;
        tracing::info!(client_id = %self.id, session_id = %self.session_id, "WritePump stopped");
        self.close();
    }
}

/// Text frame for UTF-8 payloads, binary otherwise.
fn frame(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(payload),
    }
}

fn preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() > PREVIEW_LEN {
        format!("{}...", text.chars().take(PREVIEW_LEN).collect::<String>())
    } else {
        text.into_owned()
    }
}
