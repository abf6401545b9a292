//! Middleware
//!
//! Tower middleware for request processing.

pub mod auth;
pub mod cors;
pub mod metrics;

pub use auth::{auth_middleware, bearer_token, decode_token, AuthUser, Claims};
pub use cors::create_cors_layer;
pub use metrics::track_metrics;
