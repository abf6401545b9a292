//! Consuming side of the bus.
//!
//! One dispatcher task fetches records and feeds a bounded job queue; a pool
//! of workers takes jobs off the queue, each holding a permit from a shared
//! semaphore while it processes. Offsets are committed manually, only after a
//! record is processed, found invalid, or quarantined to the DLQ.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bus::{
    BusConnector, BusError, BusReader, BusRecord, BusWriter, OutboundRecord, ReaderConfig,
    WriterConfig,
};
use super::dlq::DlqEnvelope;
use crate::config::KafkaSettings;
use crate::domain::ChatMessage;
use crate::infrastructure::metrics;

const JITTER_FACTOR: f64 = 0.2;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
const FETCH_ERROR_PAUSE: Duration = Duration::from_secs(1);
const POISON_COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked for every valid message on the main topic.
///
/// An `Err` makes the consumer retry the message with backoff.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process_message(&self, message: ChatMessage) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("errors closing consumer: {0}")]
    Close(String),
}

/// Tuning knobs, resolved from `KafkaSettings`.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub topic_dlq: String,
    pub group_id: String,
    pub max_retry: u32,
    pub worker_pool_size: usize,
    pub max_in_flight: usize,
    pub job_queue_capacity: usize,
    pub fetch_timeout: Duration,
    pub dispatch_timeout: Duration,
    pub processing_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl From<&KafkaSettings> for ConsumerConfig {
    fn from(settings: &KafkaSettings) -> Self {
        Self {
            topic: settings.topic_messages.clone(),
            topic_dlq: settings.topic_dlq.clone(),
            group_id: settings.group_id.clone(),
            max_retry: settings.max_retry.max(1),
            worker_pool_size: settings.worker_pool_size.max(1),
            max_in_flight: settings.max_in_flight.max(1),
            job_queue_capacity: settings.job_queue_capacity.max(1),
            fetch_timeout: settings.fetch_timeout(),
            dispatch_timeout: settings.dispatch_timeout(),
            processing_timeout: settings.processing_timeout(),
            shutdown_timeout: settings.shutdown_timeout(),
            backoff_base: Duration::from_millis(settings.max_wait_ms),
            backoff_cap: settings.retry_backoff_cap(),
        }
    }
}

/// Delay before retry number `attempt + 1`: `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let base = if base.is_zero() { DEFAULT_BACKOFF_BASE } else { base };
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(cap)
}

/// Spread `duration` uniformly over `±factor`.
pub fn add_jitter(duration: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || duration.is_zero() {
        return duration;
    }
    let spread = duration.as_secs_f64() * factor;
    let low = duration.as_secs_f64() - spread;
    let high = duration.as_secs_f64() + spread;
    Duration::from_secs_f64(rand::rng().random_range(low..=high))
}

pub fn calculate_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    add_jitter(backoff_delay(attempt, base, cap), JITTER_FACTOR)
}

/// State shared by the dispatcher and every worker.
struct Shared {
    reader: Arc<dyn BusReader>,
    dlq_writer: Arc<dyn BusWriter>,
    processor: Arc<dyn MessageProcessor>,
    limiter: Semaphore,
    config: ConsumerConfig,
}

struct RunState {
    running: bool,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Consumer {
    shared: Arc<Shared>,
    state: Mutex<RunState>,
}

impl Consumer {
    pub fn new(
        connector: &dyn BusConnector,
        settings: &KafkaSettings,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<Self, ConsumerError> {
        let reader = connector.reader(&ReaderConfig::messages(settings))?;
        let dlq_writer = connector.writer(&WriterConfig::dead_letter(settings))?;
        let config = ConsumerConfig::from(settings);

        tracing::info!(
            brokers = ?settings.brokers,
            topic = %config.topic,
            group_id = %config.group_id,
            workers = config.worker_pool_size,
            max_in_flight = config.max_in_flight,
            "Bus consumer initialized"
        );

        Ok(Self::from_parts(reader, dlq_writer, processor, config))
    }

    fn from_parts(
        reader: Arc<dyn BusReader>,
        dlq_writer: Arc<dyn BusWriter>,
        processor: Arc<dyn MessageProcessor>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                reader,
                dlq_writer,
                processor,
                limiter: Semaphore::new(config.max_in_flight),
                config,
            }),
            state: Mutex::new(RunState {
                running: false,
                shutdown: CancellationToken::new(),
                tasks: Vec::new(),
            }),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Spawn the dispatcher and the worker pool. A second call while running
    /// is a no-op. Cancelling `parent` stops dispatching just like `stop`.
    pub async fn start(&self, parent: &CancellationToken) {
        let mut state = self.state.lock().await;
        if state.running {
            tracing::warn!("Consumer is already running");
            return;
        }

        let shutdown = parent.child_token();
        let (jobs_tx, jobs_rx) = mpsc::channel(self.shared.config.job_queue_capacity);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let mut tasks = Vec::with_capacity(self.shared.config.worker_pool_size + 1);
        tasks.push(tokio::spawn(dispatch(
            self.shared.clone(),
            jobs_tx,
            shutdown.clone(),
        )));
        for worker_id in 0..self.shared.config.worker_pool_size {
            tasks.push(tokio::spawn(work(
                self.shared.clone(),
                jobs_rx.clone(),
                worker_id,
            )));
        }

        state.running = true;
        state.shutdown = shutdown;
        state.tasks = tasks;

        tracing::info!(workers = self.shared.config.worker_pool_size, "Bus consumer started");
    }

    /// Stop dispatching, let workers drain the queue, and wait for them up to
    /// the shutdown timeout. Tasks still running after that are aborted.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }

        tracing::info!("Stopping bus consumer...");
        state.shutdown.cancel();
        state.running = false;
        let mut tasks = std::mem::take(&mut state.tasks);

        let drained = tokio::time::timeout(
            self.shared.config.shutdown_timeout,
            futures::future::join_all(tasks.iter_mut()),
        )
        .await;

        match drained {
            Ok(_) => tracing::info!("Bus consumer stopped gracefully"),
            Err(_) => {
                for task in &tasks {
                    task.abort();
                }
                tracing::warn!("Bus consumer stopped by timeout, some messages may not be processed");
            }
        }
    }

    /// Stop, then release the reader and the DLQ writer.
    pub async fn close(&self) -> Result<(), ConsumerError> {
        self.stop().await;

        let mut errors = Vec::new();
        if let Err(e) = self.shared.reader.close().await {
            errors.push(format!("failed to close reader: {}", e));
        }
        if let Err(e) = self.shared.dlq_writer.close().await {
            errors.push(format!("failed to close DLQ writer: {}", e));
        }

        if !errors.is_empty() {
            return Err(ConsumerError::Close(errors.join("; ")));
        }
        tracing::info!("Bus consumer resources closed");
        Ok(())
    }
}

/// Fetch records and hand them to the workers. Never drops a fetched record:
/// when the queue stays full past the dispatch timeout the same record is
/// offered again. Dropping the sender on exit closes the queue.
async fn dispatch(shared: Arc<Shared>, jobs: mpsc::Sender<BusRecord>, shutdown: CancellationToken) {
    let config = &shared.config;

    'fetch: loop {
        let fetched = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            fetched = tokio::time::timeout(config.fetch_timeout, shared.reader.fetch()) => fetched,
        };

        let mut pending = match fetched {
            Err(_) => continue,
            Ok(Err(BusError::Closed)) => break,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to fetch message from bus");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(FETCH_ERROR_PAUSE) => {}
                }
                continue;
            }
            Ok(Ok(record)) => record,
        };

        loop {
            let (partition, offset) = (pending.partition, pending.offset);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::warn!(
                        partition,
                        offset,
                        "Shutdown before dispatch, record left uncommitted"
                    );
                    break 'fetch;
                }
                sent = jobs.send_timeout(pending, config.dispatch_timeout) => match sent {
                    Ok(()) => break,
                    Err(mpsc::error::SendTimeoutError::Timeout(record)) => {
                        tracing::warn!(
                            partition,
                            offset,
                            timeout = ?config.dispatch_timeout,
                            "Job queue full, retrying dispatch"
                        );
                        pending = record;
                    }
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => break 'fetch,
                },
            }
        }
    }

    tracing::info!("Consumer dispatcher stopped");
}

async fn work(shared: Arc<Shared>, jobs: Arc<Mutex<mpsc::Receiver<BusRecord>>>, worker_id: usize) {
    loop {
        let next = jobs.lock().await.recv().await;
        let Some(record) = next else {
            break;
        };

        let Ok(_permit) = shared.limiter.acquire().await else {
            break;
        };
        shared.handle(record).await;
    }

    tracing::debug!(worker_id, "Consumer worker stopped");
}

impl Shared {
    async fn handle(&self, record: BusRecord) {
        let started = Instant::now();

        let message: ChatMessage = match serde_json::from_slice(&record.value) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Invalid message payload, skipping"
                );
                metrics::record_consumer_outcome("invalid");
                self.commit(&record, "invalid").await;
                return;
            }
        };
        let message_id = message.id;
        let chat_id = message.chat_id;

        match self.process_with_retry(message).await {
            Ok(()) => {
                self.commit(&record, "processed").await;
                metrics::record_consumer_outcome("processed");
                metrics::observe_processing("processed", started.elapsed().as_secs_f64());
                tracing::debug!(message_id, chat_id, offset = record.offset, "Message processed successfully");
            }
            Err(e) => {
                tracing::error!(
                    message_id,
                    chat_id,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to process message after retries"
                );
                self.handle_poison(&record, &e).await;
                metrics::observe_processing("dead_lettered", started.elapsed().as_secs_f64());
            }
        }
    }

    async fn process_with_retry(&self, message: ChatMessage) -> anyhow::Result<()> {
        let config = &self.config;
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(
                config.processing_timeout,
                self.processor.process_message(message.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow!(
                    "processing timed out after {:?}",
                    config.processing_timeout
                )),
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempt >= config.max_retry {
                return Err(err.context(format!("max retry attempts ({}) exceeded", config.max_retry)));
            }

            let backoff = calculate_backoff(attempt, config.backoff_base, config.backoff_cap);
            tracing::warn!(
                message_id = message.id,
                attempt,
                backoff = ?backoff,
                error = %err,
                "Processing failed, retrying"
            );
            metrics::record_consumer_outcome("retried");

            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Quarantine an exhausted record and commit it so the partition moves on.
    async fn handle_poison(&self, record: &BusRecord, error: &anyhow::Error) {
        tracing::error!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            raw_message = %String::from_utf8_lossy(&record.value),
            "Handling poison pill message"
        );

        if !self.config.topic_dlq.is_empty() {
            self.send_to_dlq(record, error).await;
        }

        match tokio::time::timeout(POISON_COMMIT_TIMEOUT, self.reader.commit(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Failed to commit poison pill message"),
            Err(_) => tracing::error!("Timed out committing poison pill message"),
        }
        metrics::record_consumer_outcome("dead_lettered");

        tracing::warn!(
            offset = record.offset,
            dlq_topic = %self.config.topic_dlq,
            "Poison pill message handled and committed"
        );
    }

    async fn send_to_dlq(&self, record: &BusRecord, error: &anyhow::Error) {
        let reason = format!("{:#}", error);
        let envelope = DlqEnvelope::from_record(record, &reason);
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode DLQ envelope");
                return;
            }
        };

        let mut dlq_record = OutboundRecord::new(
            format!("dlq-{}-{}", record.partition, record.offset),
            payload,
        );
        dlq_record.headers = record.headers.clone();
        let dlq_record = dlq_record
            .with_header("dlq-reason", reason)
            .with_header("original-topic", record.topic.clone())
            .with_header("original-offset", record.offset.to_string());

        match self.dlq_writer.write(dlq_record).await {
            Ok(()) => {
                metrics::record_dlq_write("consumer", true);
                tracing::info!(
                    dlq_topic = %self.config.topic_dlq,
                    original_offset = record.offset,
                    original_partition = record.partition,
                    "Message sent to DLQ"
                );
            }
            Err(e) => {
                metrics::record_dlq_write("consumer", false);
                tracing::error!(error = %e, "Failed to send message to DLQ");
            }
        }
    }

    async fn commit(&self, record: &BusRecord, outcome: &str) {
        if let Err(e) = self.reader.commit(record).await {
            tracing::error!(
                partition = record.partition,
                offset = record.offset,
                outcome,
                error = %e,
                "Failed to commit offset"
            );
        }
    }
}
