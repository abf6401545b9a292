//! Kafka backend built on rdkafka.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header as KafkaHeader, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;

use super::bus::{
    BusConnector, BusError, BusReader, BusRecord, BusWriter, Header, OutboundRecord, ReaderConfig,
    WriterConfig,
};

impl From<KafkaError> for BusError {
    fn from(e: KafkaError) -> Self {
        match e.rdkafka_error_code() {
            Some(
                RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::OperationTimedOut,
            ) => BusError::Timeout,
            _ => BusError::Broker(e.to_string()),
        }
    }
}

/// Connector for a Kafka cluster.
#[derive(Debug, Clone, Default)]
pub struct KafkaConnector;

impl KafkaConnector {
    pub fn new() -> Self {
        Self
    }
}

fn acks(required_acks: i16) -> String {
    match required_acks {
        -1 => "all".to_string(),
        n => n.to_string(),
    }
}

impl BusConnector for KafkaConnector {
    fn writer(&self, config: &WriterConfig) -> Result<Arc<dyn BusWriter>, BusError> {
        if config.brokers.is_empty() {
            return Err(BusError::Config("no brokers configured".into()));
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("compression.type", config.compression.as_str())
            .set("batch.num.messages", config.batch_size.max(1).to_string())
            .set("linger.ms", config.linger.as_millis().to_string())
            .set("acks", acks(config.required_acks))
            .set("message.timeout.ms", config.write_timeout.as_millis().to_string())
            .set(
                "message.send.max.retries",
                config.max_attempts.saturating_sub(1).to_string(),
            )
            .create()?;

        Ok(Arc::new(KafkaWriter {
            producer,
            topic: config.topic.clone(),
            write_timeout: config.write_timeout,
        }))
    }

    fn reader(&self, config: &ReaderConfig) -> Result<Arc<dyn BusReader>, BusError> {
        if config.brokers.is_empty() {
            return Err(BusError::Config("no brokers configured".into()));
        }

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("fetch.min.bytes", config.min_bytes.to_string())
            .set("fetch.max.bytes", config.max_bytes.to_string())
            .set("fetch.wait.max.ms", config.max_wait.as_millis().to_string())
            .create()?;
        consumer.subscribe(&[config.topic.as_str()])?;

        Ok(Arc::new(KafkaReader {
            consumer,
            closed: CancellationToken::new(),
        }))
    }
}

pub struct KafkaWriter {
    producer: FutureProducer,
    topic: String,
    write_timeout: Duration,
}

#[async_trait]
impl BusWriter for KafkaWriter {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn write(&self, record: OutboundRecord) -> Result<(), BusError> {
        let mut headers = OwnedHeaders::new();
        for header in &record.headers {
            headers = headers.insert(KafkaHeader {
                key: &header.key,
                value: Some(header.value.as_bytes()),
            });
        }

        let mut outbound = FutureRecord::to(&self.topic)
            .payload(record.value.as_ref())
            .headers(headers);
        if !record.key.is_empty() {
            outbound = outbound.key(record.key.as_str());
        }

        self.producer
            .send(outbound, Timeout::After(self.write_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| BusError::from(e))
    }

    async fn close(&self) -> Result<(), BusError> {
        let producer = self.producer.clone();
        let timeout = self.write_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BusError::Broker(e.to_string()))??;
        Ok(())
    }
}

pub struct KafkaReader {
    consumer: StreamConsumer,
    closed: CancellationToken,
}

fn to_record(message: &BorrowedMessage<'_>) -> BusRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| {
                    Header::new(
                        h.key,
                        h.value
                            .map(|v| String::from_utf8_lossy(v).into_owned())
                            .unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    BusRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
        headers,
        timestamp,
    }
}

#[async_trait]
impl BusReader for KafkaReader {
    async fn fetch(&self) -> Result<BusRecord, BusError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(BusError::Closed),
            received = self.consumer.recv() => {
                let message = received?;
                Ok(to_record(&message))
            }
        }
    }

    async fn commit(&self, record: &BusRecord) -> Result<(), BusError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.cancel();
        self.consumer.unsubscribe();
        Ok(())
    }
}
