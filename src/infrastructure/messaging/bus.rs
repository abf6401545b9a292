//! Bus abstraction shared by the producer, the consumer and the backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Compression, KafkaSettings};

/// A single key/value record header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A record fetched from a topic partition.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<Header>,
    pub timestamp: DateTime<Utc>,
}

impl BusRecord {
    /// Key as text, lossily decoded. Empty when the record has no key.
    pub fn key_str(&self) -> String {
        self.key
            .as_ref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default()
    }
}

/// A record about to be written. The topic is fixed by the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub key: String,
    pub value: Bytes,
    pub headers: Vec<Header>,
}

impl OutboundRecord {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }
}

/// Bus I/O errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("bus handle is closed")]
    Closed,

    #[error("operation timed out")]
    Timeout,

    #[error("invalid bus configuration: {0}")]
    Config(String),
}

/// Writer bound to one topic.
#[async_trait]
pub trait BusWriter: Send + Sync {
    fn topic(&self) -> &str;

    /// Write one record, partitioned by its key.
    async fn write(&self, record: OutboundRecord) -> Result<(), BusError>;

    /// Flush pending records and release the connection.
    async fn close(&self) -> Result<(), BusError>;
}

/// Consumer-group reader bound to one topic.
#[async_trait]
pub trait BusReader: Send + Sync {
    /// Wait for the next record. Does not commit.
    async fn fetch(&self) -> Result<BusRecord, BusError>;

    /// Record `record` as processed for the reader's group.
    async fn commit(&self, record: &BusRecord) -> Result<(), BusError>;

    /// Stop fetching; pending `fetch` calls return `BusError::Closed`.
    async fn close(&self) -> Result<(), BusError>;
}

/// Factory for readers and writers of one broker deployment.
pub trait BusConnector: Send + Sync {
    fn writer(&self, config: &WriterConfig) -> Result<Arc<dyn BusWriter>, BusError>;

    fn reader(&self, config: &ReaderConfig) -> Result<Arc<dyn BusReader>, BusError>;
}

/// Writer options derived from `KafkaSettings`.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub compression: Compression,
    pub batch_size: usize,
    pub linger: Duration,
    pub required_acks: i16,
    pub write_timeout: Duration,
    pub max_attempts: u32,
}

impl WriterConfig {
    /// Writer for the main message topic.
    pub fn messages(settings: &KafkaSettings) -> Self {
        Self {
            brokers: settings.brokers.clone(),
            topic: settings.topic_messages.clone(),
            compression: settings.compression,
            batch_size: settings.batch_size,
            linger: Duration::from_millis(settings.linger_ms),
            required_acks: settings.required_acks,
            write_timeout: settings.write_timeout(),
            max_attempts: settings.max_retry,
        }
    }

    /// Writer for the dead-letter topic: small batches, short linger.
    pub fn dead_letter(settings: &KafkaSettings) -> Self {
        Self {
            brokers: settings.brokers.clone(),
            topic: settings.topic_dlq.clone(),
            compression: Compression::None,
            batch_size: 1,
            linger: Duration::from_millis(50),
            required_acks: settings.required_acks,
            write_timeout: settings.write_timeout(),
            max_attempts: 3,
        }
    }
}

/// Reader options derived from `KafkaSettings`.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub group_id: String,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub max_wait: Duration,
}

impl ReaderConfig {
    pub fn messages(settings: &KafkaSettings) -> Self {
        Self {
            brokers: settings.brokers.clone(),
            topic: settings.topic_messages.clone(),
            group_id: settings.group_id.clone(),
            min_bytes: settings.min_bytes,
            max_bytes: settings.max_bytes,
            max_wait: Duration::from_millis(settings.max_wait_ms),
        }
    }
}
