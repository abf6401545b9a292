//! # Domain Entities
//!
//! - **ChatMessage**: a message as persisted and as carried on the bus
//! - **Chat** / **ChatParticipant**: the membership data used for permission checks
//!
//! Repository traits are declared next to their entities and implemented in
//! the infrastructure layer.

mod chat;
mod message;

pub use chat::{Chat, ChatParticipant, ChatRepository, ChatType, ParticipantRole};
pub use message::{
    chat_partition_key, ChatMessage, InvalidMessage, MessageRepository, MessageStatus, MessageType,
};

#[cfg(test)]
pub use chat::MockChatRepository;
#[cfg(test)]
pub use message::MockMessageRepository;
