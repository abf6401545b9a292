//! Message bus.
//!
//! - `bus`: record types and the reader/writer/connector traits
//! - `memory`: in-process partitioned log
//! - `kafka`: rdkafka backend (feature `kafka`)
//! - `producer` / `consumer`: the publishing and processing pipeline

mod bus;
pub mod consumer;
pub mod dlq;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod producer;

pub use bus::*;
pub use consumer::{Consumer, ConsumerConfig, ConsumerError, MessageProcessor};
pub use dlq::DlqEnvelope;
#[cfg(feature = "kafka")]
pub use kafka::KafkaConnector;
pub use memory::MemoryBus;
pub use producer::{Producer, ProducerError};
