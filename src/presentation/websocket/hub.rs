//! Connection hub.
//!
//! The hub task is the only owner of the live-client registry. Everything
//! else talks to it through a `HubHandle`, whose commands are applied one at a
//! time by `Hub::run`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::client::{Client, SendError};
use crate::config::WebSocketSettings;
use crate::infrastructure::metrics;

pub enum HubCommand {
    Register(Arc<Client>),
    Unregister(Uuid),
    Broadcast(Bytes),
    Count(oneshot::Sender<usize>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("hub is not running")]
pub struct HubStopped;

/// Cloneable sender side of the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// A handle whose commands are left to the caller instead of a running
    /// hub.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HubCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn register(&self, client: Arc<Client>) {
        if self.tx.send(HubCommand::Register(client.clone())).is_err() {
            tracing::warn!(client_id = %client.id(), "Hub is not running, closing client");
            client.close();
        }
    }

    /// Removing an unknown client is a no-op.
    pub fn unregister(&self, client_id: Uuid) {
        let _ = self.tx.send(HubCommand::Unregister(client_id));
    }

    /// Queue `payload` for every registered client.
    pub fn broadcast(&self, payload: impl Into<Bytes>) -> Result<(), HubStopped> {
        self.tx
            .send(HubCommand::Broadcast(payload.into()))
            .map_err(|_| HubStopped)
    }

    pub async fn client_count(&self) -> Result<usize, HubStopped> {
        let (reply, count) = oneshot::channel();
        self.tx
            .send(HubCommand::Count(reply))
            .map_err(|_| HubStopped)?;
        count.await.map_err(|_| HubStopped)
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub struct Hub {
    clients: HashMap<Uuid, Arc<Client>>,
    /// Most recent connection per user
    by_user: HashMap<i64, Uuid>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    health_check_interval: Option<Duration>,
    max_inactivity: Duration,
}

impl Hub {
    pub fn new(settings: &WebSocketSettings) -> (Self, HubHandle) {
        let (handle, commands) = HubHandle::channel();
        let hub = Self {
            clients: HashMap::new(),
            by_user: HashMap::new(),
            commands,
            health_check_interval: settings.health_check_interval(),
            max_inactivity: settings.max_inactivity(),
        };
        (hub, handle)
    }

    /// Apply commands until `shutdown` fires or every handle is dropped,
    /// then close all remaining clients.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::debug!(health_check = ?self.health_check_interval, "hub run");

        let mut sweep = self.health_check_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = tick(&mut sweep) => self.sweep_inactive(),
            }
        }

        for client in self.clients.values() {
            client.close();
        }
        self.clients.clear();
        metrics::set_websocket_connections(0);
        tracing::info!("Hub stopped");
    }

    fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(client) => self.register(client),
            HubCommand::Unregister(id) => self.unregister(id),
            HubCommand::Broadcast(payload) => self.broadcast(payload),
            HubCommand::Count(reply) => {
                let _ = reply.send(self.clients.len());
            }
        }
    }

    fn register(&mut self, client: Arc<Client>) {
        if !client.is_active() {
            return;
        }

        if let Some(previous) = self.by_user.insert(client.user_id(), client.id()) {
            if previous != client.id() {
                if let Some(old) = self.clients.remove(&previous) {
                    tracing::info!(
                        user_id = client.user_id(),
                        client_id = %previous,
                        "Closing existing connection for user"
                    );
                    old.close();
                    metrics::record_client_dropped("evicted");
                }
            }
        }

        tracing::info!(user_id = client.user_id(), client_id = %client.id(), "register");
        self.clients.insert(client.id(), client);
        metrics::set_websocket_connections(self.clients.len());
    }

    fn unregister(&mut self, id: Uuid) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        if self.by_user.get(&client.user_id()) == Some(&id) {
            self.by_user.remove(&client.user_id());
        }
        tracing::info!(user_id = client.user_id(), client_id = %id, "unregister");
        metrics::set_websocket_connections(self.clients.len());
    }

    /// Fan out to every client without waiting; clients whose queue is full
    /// are closed and dropped.
    fn broadcast(&mut self, payload: Bytes) {
        let mut dropped = Vec::new();

        for (id, client) in &self.clients {
            match client.try_send(payload.clone()) {
                Ok(()) => {}
                Err(SendError::Full) => {
                    tracing::warn!(client_id = %id, user_id = client.user_id(), "Outbound queue full, dropping slow client");
                    client.close();
                    metrics::record_client_dropped("slow");
                    dropped.push(*id);
                }
                Err(SendError::Closed) => dropped.push(*id),
            }
        }

        tracing::debug!(
            message_size = payload.len(),
            recipients = self.clients.len() - dropped.len(),
            "broadcast"
        );

        for id in dropped {
            self.unregister(id);
        }
    }

    fn sweep_inactive(&mut self) {
        let mut stale = Vec::new();
        for (id, client) in &self.clients {
            if !client.is_active() {
                stale.push(*id);
                continue;
            }
            let idle = client.last_activity().elapsed();
            if idle > self.max_inactivity {
                tracing::info!(
                    user_id = client.user_id(),
                    client_id = %id,
                    inactivity_duration = ?idle,
                    "Closing inactive connection"
                );
                client.close();
                metrics::record_client_dropped("inactive");
                stale.push(*id);
            }
        }

        for id in stale {
            self.unregister(id);
        }
    }
}

async fn tick(sweep: &mut Option<tokio::time::Interval>) {
    match sweep {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
