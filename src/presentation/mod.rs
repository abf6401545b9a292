//! Presentation Layer
//!
//! HTTP routes, middleware, and the WebSocket hub with its clients.

pub mod http;
pub mod websocket;
pub mod middleware;
