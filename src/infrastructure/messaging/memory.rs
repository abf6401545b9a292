//! In-process partitioned log.
//!
//! Behaves like a single-node broker: topics split into a fixed number of
//! partitions, key-hash partitioning, per-group committed offsets and readers
//! that resume from the last commit. Used for local development and as the
//! broker in tests.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::bus::{
    BusConnector, BusError, BusReader, BusRecord, BusWriter, OutboundRecord, ReaderConfig,
    WriterConfig,
};

pub const DEFAULT_PARTITIONS: usize = 3;

/// Shared handle to an in-memory broker. Clones refer to the same log.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    partitions: usize,
    state: Mutex<State>,
    appended: Notify,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Vec<BusRecord>>>,
    /// (group, topic, partition) -> next offset to read
    commits: HashMap<(String, String, i32), i64>,
    /// Remaining injected failures per topic
    failing_writes: HashMap<String, usize>,
}

impl State {
    fn topic_mut(&mut self, topic: &str, partitions: usize) -> &mut Vec<Vec<BusRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(State::default()),
                appended: Notify::new(),
            }),
        }
    }

    pub fn partitions(&self) -> usize {
        self.inner.partitions
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> i32 {
        if key.is_empty() {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as i32
    }

    /// Make the next `count` writes to `topic` fail with a broker error.
    pub fn fail_next_writes(&self, topic: &str, count: usize) {
        self.inner
            .state
            .lock()
            .failing_writes
            .insert(topic.to_string(), count);
    }

    /// Snapshot of every record in `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<BusRecord> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Next offset `group` will read from `partition`, if it ever committed.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .state
            .lock()
            .commits
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    fn append(&self, topic: &str, record: OutboundRecord) -> Result<BusRecord, BusError> {
        let partition = self.partition_for(&record.key);
        let mut state = self.inner.state.lock();

        if let Some(remaining) = state.failing_writes.get_mut(topic) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::Broker(format!(
                    "injected write failure on topic {}",
                    topic
                )));
            }
        }

        let log = state.topic_mut(topic, self.inner.partitions);
        let entries = &mut log[partition as usize];
        let stored = BusRecord {
            topic: topic.to_string(),
            partition,
            offset: entries.len() as i64,
            key: (!record.key.is_empty()).then(|| Bytes::from(record.key)),
            value: record.value,
            headers: record.headers,
            timestamp: Utc::now(),
        };
        entries.push(stored.clone());
        drop(state);

        self.inner.appended.notify_waiters();
        Ok(stored)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusConnector for MemoryBus {
    fn writer(&self, config: &WriterConfig) -> Result<Arc<dyn BusWriter>, BusError> {
        if config.topic.is_empty() {
            return Err(BusError::Config("writer topic is empty".into()));
        }
        Ok(Arc::new(MemoryWriter {
            bus: self.clone(),
            topic: config.topic.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn reader(&self, config: &ReaderConfig) -> Result<Arc<dyn BusReader>, BusError> {
        if config.topic.is_empty() || config.group_id.is_empty() {
            return Err(BusError::Config("reader needs a topic and a group id".into()));
        }
        Ok(Arc::new(MemoryReader {
            bus: self.clone(),
            topic: config.topic.clone(),
            group: config.group_id.clone(),
            cursor: Mutex::new(Cursor {
                positions: vec![None; self.inner.partitions],
                next_partition: 0,
            }),
            closed: CancellationToken::new(),
        }))
    }
}

pub struct MemoryWriter {
    bus: MemoryBus,
    topic: String,
    closed: AtomicBool,
}

#[async_trait]
impl BusWriter for MemoryWriter {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn write(&self, record: OutboundRecord) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        self.bus.append(&self.topic, record).map(|_| ())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct Cursor {
    /// Fetch position per partition; `None` until first read from the commit log
    positions: Vec<Option<i64>>,
    next_partition: usize,
}

pub struct MemoryReader {
    bus: MemoryBus,
    topic: String,
    group: String,
    cursor: Mutex<Cursor>,
    closed: CancellationToken,
}

impl MemoryReader {
    /// Next unread record, visiting partitions round-robin.
    fn try_next(&self) -> Option<BusRecord> {
        let partitions = self.bus.inner.partitions;
        let mut state = self.bus.inner.state.lock();
        let mut cursor = self.cursor.lock();

        for step in 0..partitions {
            let partition = (cursor.next_partition + step) % partitions;
            let key = (self.group.clone(), self.topic.clone(), partition as i32);
            let position = *cursor.positions[partition]
                .get_or_insert_with(|| state.commits.get(&key).copied().unwrap_or(0));

            let log = state.topic_mut(&self.topic, partitions);
            if let Some(record) = log[partition].get(position as usize) {
                let record = record.clone();
                cursor.positions[partition] = Some(position + 1);
                cursor.next_partition = (partition + 1) % partitions;
                return Some(record);
            }
        }
        None
    }
}

#[async_trait]
impl BusReader for MemoryReader {
    async fn fetch(&self) -> Result<BusRecord, BusError> {
        loop {
            let appended = self.bus.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if self.closed.is_cancelled() {
                return Err(BusError::Closed);
            }
            if let Some(record) = self.try_next() {
                return Ok(record);
            }

            tokio::select! {
                _ = &mut appended => {}
                _ = self.closed.cancelled() => return Err(BusError::Closed),
            }
        }
    }

    async fn commit(&self, record: &BusRecord) -> Result<(), BusError> {
        if record.topic != self.topic {
            return Err(BusError::Broker(format!(
                "record from topic {} committed on reader of {}",
                record.topic, self.topic
            )));
        }
        let mut state = self.bus.inner.state.lock();
        let next = record.offset + 1;
        state
            .commits
            .entry((self.group.clone(), self.topic.clone(), record.partition))
            .and_modify(|committed| *committed = (*committed).max(next))
            .or_insert(next);
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.cancel();
        Ok(())
    }
}
