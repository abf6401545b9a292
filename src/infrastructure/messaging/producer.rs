//! Publishing side of the bus.
//!
//! Every failed write is mirrored to the dead-letter topic through a writer
//! created for that one write, so a broken main writer never shares state
//! with the quarantine path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use super::bus::{BusConnector, BusError, BusWriter, OutboundRecord, WriterConfig};
use super::dlq::{rfc3339, DlqEnvelope};
use crate::config::KafkaSettings;
use crate::infrastructure::metrics;

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to publish message: {0}")]
    Publish(#[from] BusError),

    #[error("failed to publish message after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: BusError,
    },
}

pub struct Producer {
    writer: Arc<dyn BusWriter>,
    connector: Arc<dyn BusConnector>,
    dlq: WriterConfig,
}

impl Producer {
    pub fn new(
        connector: Arc<dyn BusConnector>,
        settings: &KafkaSettings,
    ) -> Result<Self, ProducerError> {
        let config = WriterConfig::messages(settings);
        let writer = connector.writer(&config)?;

        tracing::info!(
            brokers = ?settings.brokers,
            topic = %config.topic,
            max_retries = config.max_attempts,
            batch_size = config.batch_size,
            "Bus producer initialized"
        );

        Ok(Self {
            writer,
            connector,
            dlq: WriterConfig::dead_letter(settings),
        })
    }

    pub fn topic(&self) -> &str {
        self.writer.topic()
    }

    /// Write one record. On failure the record is mirrored to the DLQ and the
    /// broker error returned.
    pub async fn publish(&self, record: OutboundRecord) -> Result<(), ProducerError> {
        let size = record.value.len();
        let key = record.key.clone();

        match self.writer.write(record.clone()).await {
            Ok(()) => {
                metrics::record_publish(true);
                tracing::debug!(topic = %self.topic(), key = %key, size, "Message published");
                Ok(())
            }
            Err(e) => {
                metrics::record_publish(false);
                tracing::error!(topic = %self.topic(), key = %key, error = %e, "Failed to publish message");
                self.send_to_dlq(&record, &e).await;
                Err(ProducerError::Publish(e))
            }
        }
    }

    /// Serialize `value` as JSON and publish it under `key`.
    pub async fn publish_json<T>(&self, key: &str, value: &T) -> Result<(), ProducerError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(value)?;
        let record = OutboundRecord::new(key, payload)
            .with_header("content-type", "application/json")
            .with_header("timestamp", rfc3339(Utc::now()));
        self.publish(record).await
    }

    /// Publish with up to `max_attempts` tries, sleeping `attempt²` seconds
    /// between them. Encoding errors are returned without retrying.
    ///
    /// Cancel by dropping the future.
    pub async fn publish_with_retry<T>(
        &self,
        key: &str,
        value: &T,
        max_attempts: u32,
    ) -> Result<(), ProducerError>
    where
        T: Serialize + ?Sized,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match self.publish_json(key, value).await {
                Ok(()) => return Ok(()),
                Err(ProducerError::Publish(e)) => e,
                Err(other) => return Err(other),
            };

            tracing::warn!(
                attempt,
                max_attempts,
                key = %key,
                error = %err,
                "Failed to publish message, retrying"
            );

            if attempt >= max_attempts {
                tracing::error!(key = %key, attempts = attempt, error = %err, "Giving up on publish");
                return Err(ProducerError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            tokio::time::sleep(retry_delay(attempt)).await;
            attempt += 1;
        }
    }

    /// Best-effort quarantine of a record that failed to publish. Failures
    /// here are logged only.
    async fn send_to_dlq(&self, record: &OutboundRecord, error: &BusError) {
        let envelope = DlqEnvelope::from_publish(self.topic(), record, &error.to_string());
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode DLQ envelope");
                return;
            }
        };

        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let dlq_record = OutboundRecord::new(format!("dlq_{}_{}", self.topic(), nanos), payload)
            .with_header("original_topic", self.topic())
            .with_header("error_type", error_type(error));

        let writer = match self.connector.writer(&self.dlq) {
            Ok(writer) => writer,
            Err(e) => {
                metrics::record_dlq_write("producer", false);
                tracing::error!(error = %e, original_error = %error, "Failed to open DLQ writer");
                return;
            }
        };

        let result = writer.write(dlq_record).await;
        if let Err(e) = writer.close().await {
            tracing::debug!(error = %e, "Failed to close DLQ writer");
        }

        match result {
            Ok(()) => metrics::record_dlq_write("producer", true),
            Err(e) => {
                metrics::record_dlq_write("producer", false);
                tracing::error!(error = %e, original_error = %error, "Failed to send message to DLQ");
            }
        }
    }

    /// Flush and release the main writer.
    pub async fn close(&self) -> Result<(), ProducerError> {
        self.writer.close().await?;
        tracing::info!(topic = %self.topic(), "Bus producer closed");
        Ok(())
    }
}

/// Sleep between publish attempts: `attempt²` seconds.
pub fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt) * u64::from(attempt))
}

fn error_type(error: &BusError) -> &'static str {
    match error {
        BusError::Broker(_) => "broker",
        BusError::Closed => "closed",
        BusError::Timeout => "timeout",
        BusError::Config(_) => "config",
    }
}
