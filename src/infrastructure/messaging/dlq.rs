//! Dead-letter envelope.
//!
//! Both the producer (failed publish) and the consumer (exhausted retries)
//! quarantine records by wrapping them in a `DlqEnvelope` and writing it to
//! the dead-letter topic. Partition and offset are only known on the consumer
//! side.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::bus::{BusRecord, Header, OutboundRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub original_topic: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_partition: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_offset: Option<i64>,

    pub original_key: String,

    /// Payload as text, lossily decoded
    pub original_value: String,

    pub error: String,

    pub failed_at: String,

    #[serde(default)]
    pub headers: Vec<Header>,
}

impl DlqEnvelope {
    /// Envelope for a record the producer could not publish.
    pub fn from_publish(topic: &str, record: &OutboundRecord, error: &str) -> Self {
        Self {
            original_topic: topic.to_string(),
            original_partition: None,
            original_offset: None,
            original_key: record.key.clone(),
            original_value: String::from_utf8_lossy(&record.value).into_owned(),
            error: error.to_string(),
            failed_at: rfc3339(Utc::now()),
            headers: record.headers.clone(),
        }
    }

    /// Envelope for a consumed record that exhausted its retries.
    pub fn from_record(record: &BusRecord, error: &str) -> Self {
        Self {
            original_topic: record.topic.clone(),
            original_partition: Some(record.partition),
            original_offset: Some(record.offset),
            original_key: record.key_str(),
            original_value: String::from_utf8_lossy(&record.value).into_owned(),
            error: error.to_string(),
            failed_at: rfc3339(Utc::now()),
            headers: record.headers.clone(),
        }
    }
}

/// Second-precision UTC timestamp, e.g. `2024-05-01T12:00:00Z`.
pub fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
