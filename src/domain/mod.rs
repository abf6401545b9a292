//! # Domain Layer
//!
//! Entities and the repository contracts the delivery pipeline consumes.
//! Nothing here depends on the bus, the WebSocket layer or the database driver.

pub mod entities;

pub use entities::*;
