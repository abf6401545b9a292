//! Application Services
//!
//! Business logic services that coordinate domain operations.
//!
//! - **MessageService**: send, history, consumer-side delivery and republishing

pub mod message_service;

pub use message_service::{run_reconciler, MessageError, MessageService, MessageServiceImpl};
