//! # Messenger
//!
//! Chat backend that persists messages, publishes them to a partitioned log
//! keyed by chat, and delivers them from a consumer worker pool to live
//! WebSocket clients.
//!
//! ## Architecture
//!
//! - **Domain Layer**: messages, chats and the repository traits
//! - **Application Layer**: the message service (send, deliver, republish)
//! - **Infrastructure Layer**: PostgreSQL, the bus (Kafka or in-process), metrics
//! - **Presentation Layer**: HTTP endpoints, the hub and per-connection clients
//!
//! ```text
//! POST /messages -> MessageService::send_message -> DB (sent) -> Producer
//!                                                                  |
//!  Client <- Hub <- MessageService::process_message <- Consumer <-+
//!                        (status -> delivered)
//! ```

// Configuration module
pub mod config;

// Domain layer
pub mod domain;

// Application layer
pub mod application;

// Infrastructure layer
pub mod infrastructure;

// Presentation layer - HTTP and WebSocket handlers
pub mod presentation;

// Shared utilities
pub mod shared;

// Application startup and state management
pub mod startup;

// Telemetry and observability
pub mod telemetry;
