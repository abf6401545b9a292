//! Infrastructure Layer
//!
//! - PostgreSQL pool and repositories
//! - Message bus (in-memory log or Kafka)
//! - Prometheus metrics

pub mod database;
pub mod messaging;
pub mod metrics;
pub mod repositories;
