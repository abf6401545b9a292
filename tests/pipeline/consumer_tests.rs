//! Consumer behaviour against the in-process bus with a scripted processor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use messenger::config::KafkaSettings;
use messenger::domain::ChatMessage;
use messenger::infrastructure::messaging::{
    BusConnector, Consumer, DlqEnvelope, MemoryBus, MessageProcessor, OutboundRecord, WriterConfig,
};

use crate::common::{chat_message, eventually, settings};

/// Records every attempt; fails every attempt for ids in `poisoned`.
struct ScriptedProcessor {
    attempts: Mutex<Vec<i64>>,
    poisoned: HashSet<i64>,
    /// Time spent on every attempt
    delay: Duration,
    /// Ids whose first attempt hangs past any processing timeout
    stalled: Mutex<HashSet<i64>>,
    /// Ids that wait for a permit on `gate` before completing
    gated: HashSet<i64>,
    gate: Semaphore,
}

impl ScriptedProcessor {
    fn new() -> Self {
        Self {
            attempts: Mutex::new(Vec::new()),
            poisoned: HashSet::new(),
            delay: Duration::ZERO,
            stalled: Mutex::new(HashSet::new()),
            gated: HashSet::new(),
            gate: Semaphore::new(0),
        }
    }

    fn failing(ids: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            poisoned: ids.iter().copied().collect(),
            ..Self::new()
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::new()
        })
    }

    fn stalling_once(ids: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            stalled: Mutex::new(ids.iter().copied().collect()),
            ..Self::new()
        })
    }

    fn gated(ids: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            gated: ids.iter().copied().collect(),
            ..Self::new()
        })
    }

    fn attempts_for(&self, id: i64) -> usize {
        self.attempts.lock().iter().filter(|&&a| a == id).count()
    }

    fn attempted(&self) -> Vec<i64> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl MessageProcessor for ScriptedProcessor {
    async fn process_message(&self, message: ChatMessage) -> anyhow::Result<()> {
        self.attempts.lock().push(message.id);

        let stall = self.stalled.lock().remove(&message.id);
        if stall {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.gated.contains(&message.id) {
            self.gate.acquire().await?.forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.poisoned.contains(&message.id) {
            anyhow::bail!("cannot process message {}", message.id);
        }
        Ok(())
    }
}

struct Harness {
    bus: MemoryBus,
    kafka: KafkaSettings,
    consumer: Consumer,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start(kafka: KafkaSettings, processor: Arc<ScriptedProcessor>) -> Self {
        let bus = MemoryBus::new();
        let consumer = Consumer::new(&bus, &kafka, processor).unwrap();
        let shutdown = CancellationToken::new();
        consumer.start(&shutdown).await;
        Self {
            bus,
            kafka,
            consumer,
            shutdown,
        }
    }

    async fn write(&self, key: &str, value: impl Into<bytes::Bytes>) {
        let writer = self.bus.writer(&WriterConfig::messages(&self.kafka)).unwrap();
        writer.write(OutboundRecord::new(key, value)).await.unwrap();
    }

    async fn write_message(&self, message: &ChatMessage) {
        self.write(&message.partition_key(), serde_json::to_vec(message).unwrap())
            .await;
    }

    async fn committed(&self, key: &str, expected: i64) -> bool {
        let partition = self.bus.partition_for(key);
        let bus = self.bus.clone();
        let (group, topic) = (self.kafka.group_id.clone(), self.kafka.topic_messages.clone());
        eventually(|| {
            let committed = bus.committed_offset(&group, &topic, partition);
            async move { committed == Some(expected) }
        })
        .await
    }
}

fn single_worker() -> KafkaSettings {
    KafkaSettings {
        worker_pool_size: 1,
        max_in_flight: 1,
        ..settings().kafka
    }
}

#[tokio::test]
async fn test_poison_message_is_quarantined_and_partition_moves_on() {
    let processor = ScriptedProcessor::failing(&[1]);
    let harness = Harness::start(single_worker(), processor.clone()).await;

    let poison = chat_message(1, 7, 3);
    let next = chat_message(2, 7, 3);
    harness.write_message(&poison).await;
    harness.write_message(&next).await;

    assert!(harness.committed("chat_7", 2).await);
    assert_eq!(processor.attempts_for(1), 3);
    assert_eq!(processor.attempts_for(2), 1);

    let dlq = harness.bus.records(&harness.kafka.topic_dlq);
    assert_eq!(dlq.len(), 1);
    let partition = harness.bus.partition_for("chat_7");
    assert_eq!(dlq[0].key_str(), format!("dlq-{}-0", partition));
    assert!(dlq[0]
        .headers
        .iter()
        .any(|h| h.key == "original-topic" && h.value == harness.kafka.topic_messages));
    assert!(dlq[0].headers.iter().any(|h| h.key == "dlq-reason"));

    let envelope: DlqEnvelope = serde_json::from_slice(&dlq[0].value).unwrap();
    assert_eq!(envelope.original_key, "chat_7");
    assert_eq!(envelope.original_offset, Some(0));
    assert!(envelope.error.contains("cannot process message 1"));
    let original: ChatMessage = serde_json::from_str(&envelope.original_value).unwrap();
    assert_eq!(original, poison);

    harness.consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_payload_is_committed_without_processing() {
    let processor = Arc::new(ScriptedProcessor::new());
    let harness = Harness::start(single_worker(), processor.clone()).await;

    harness.write("chat_7", "{not json").await;
    harness.write_message(&chat_message(5, 7, 3)).await;

    assert!(harness.committed("chat_7", 2).await);
    assert_eq!(*processor.attempts.lock(), vec![5]);
    assert!(harness.bus.records(&harness.kafka.topic_dlq).is_empty());

    harness.consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_single_worker_preserves_chat_order() {
    let processor = Arc::new(ScriptedProcessor::new());
    let harness = Harness::start(single_worker(), processor.clone()).await;

    let ids: Vec<i64> = (1..=20).collect();
    for &id in &ids {
        harness.write_message(&chat_message(id, 7, 3)).await;
    }

    assert!(harness.committed("chat_7", 20).await);
    assert_eq!(*processor.attempts.lock(), ids);

    harness.consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_worker_pool_processes_every_chat() {
    let processor = Arc::new(ScriptedProcessor::new());
    let harness = Harness::start(settings().kafka, processor.clone()).await;

    for chat_id in 1..=6 {
        for n in 0..5 {
            harness
                .write_message(&chat_message(chat_id * 100 + n, chat_id, 3))
                .await;
        }
    }

    let seen = processor.clone();
    assert!(eventually(|| {
        let count = seen.attempts.lock().len();
        async move { count == 30 }
    })
    .await);

    harness.consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_start_is_idempotent_and_stop_cancels() {
    let processor = Arc::new(ScriptedProcessor::new());
    let harness = Harness::start(single_worker(), processor).await;

    assert!(harness.consumer.is_running().await);
    harness.consumer.start(&harness.shutdown).await;
    assert!(harness.consumer.is_running().await);

    harness.consumer.stop().await;
    assert!(!harness.consumer.is_running().await);
    // A second stop is a no-op.
    harness.consumer.stop().await;
    harness.consumer.close().await.unwrap();
}


#[tokio::test]
async fn test_minimal_payload_reaches_processor() {
    let processor = Arc::new(ScriptedProcessor::new());
    let harness = Harness::start(single_worker(), processor.clone()).await;

    harness
        .write(
            "chat_7",
            r#"{"chatId":7,"userId":3,"type":"text","content":"hi","clientId":"c1"}"#,
        )
        .await;

    assert!(harness.committed("chat_7", 1).await);
    assert_eq!(processor.attempted(), vec![0]);
    assert!(harness.bus.records(&harness.kafka.topic_dlq).is_empty());

    harness.consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_full_queue_delays_dispatch_without_dropping() {
    let kafka = KafkaSettings {
        job_queue_capacity: 1,
        dispatch_timeout_ms: 20,
        ..single_worker()
    };
    let processor = ScriptedProcessor::slow(Duration::from_millis(50));
    let harness = Harness::start(kafka, processor.clone()).await;

    let ids: Vec<i64> = (1..=8).collect();
    for &id in &ids {
        harness.write_message(&chat_message(id, 7, 3)).await;
    }

    assert!(harness.committed("chat_7", 8).await);
    assert_eq!(processor.attempted(), ids);
    assert!(harness.bus.records(&harness.kafka.topic_dlq).is_empty());

    harness.consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_processing_timeout_counts_as_failed_attempt() {
    let kafka = KafkaSettings {
        processing_timeout_secs: 1,
        ..single_worker()
    };
    let processor = ScriptedProcessor::stalling_once(&[9]);
    let harness = Harness::start(kafka, processor.clone()).await;

    harness.write_message(&chat_message(9, 7, 3)).await;

    assert!(harness.committed("chat_7", 1).await);
    assert_eq!(processor.attempts_for(9), 2);
    assert!(harness.bus.records(&harness.kafka.topic_dlq).is_empty());

    harness.consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_stop_drains_queued_jobs() {
    let processor = ScriptedProcessor::gated(&[1]);
    let harness = Harness::start(single_worker(), processor.clone()).await;

    for id in 1..=5 {
        harness.write_message(&chat_message(id, 7, 3)).await;
    }

    // The only worker is held on the first record while the rest queue up.
    let seen = processor.clone();
    assert!(eventually(|| {
        let started = seen.attempts_for(1) == 1;
        async move { started }
    })
    .await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let consumer = Arc::new(harness.consumer);
    let stopping = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.stop().await }
    });
    processor.gate.add_permits(1);
    stopping.await.unwrap();

    assert!(!consumer.is_running().await);
    assert_eq!(processor.attempted(), vec![1, 2, 3, 4, 5]);
    let partition = harness.bus.partition_for("chat_7");
    assert_eq!(
        harness
            .bus
            .committed_offset(&harness.kafka.group_id, &harness.kafka.topic_messages, partition),
        Some(5)
    );

    consumer.close().await.unwrap();
}
