//! Repository Implementations
//!
//! PostgreSQL implementations of the domain repository traits.
//!
//! - **PgMessageRepository** - message insert, status updates, undelivered scan
//! - **PgChatRepository** - chat and participant lookups, chat history

pub mod chat_repository;
pub mod message_repository;

pub use chat_repository::PgChatRepository;
pub use message_repository::PgMessageRepository;
