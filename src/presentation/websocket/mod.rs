//! WebSocket delivery
//!
//! A single hub task owns the registry of live clients; each client runs a
//! read pump and a write pump over its socket.

pub mod client;
pub mod handler;
pub mod hub;
pub mod messages;

pub use client::{Client, PumpConfig, SendError};
pub use handler::ws_handler;
pub use hub::{Hub, HubCommand, HubHandle, HubStopped};
pub use messages::{NewMessage, ParticipantAction, ParticipantEvent, ServerEvent};
