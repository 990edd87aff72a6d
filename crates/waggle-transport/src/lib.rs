// Partitioned append-only log transport.
// The trait pair is the seam an external log (e.g. a Kafka cluster) plugs
// into; `LogTransport` is the in-process implementation used by tests and
// single-process deployments. Ordering is guaranteed within one partition
// only, and delivery is at-least-once from the consumer's point of view.
use ahash::RandomState;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("partition count must be non-zero")]
    ZeroPartitions,
    #[error("log capacity must be non-zero")]
    ZeroCapacity,
    // A blocked poll was interrupted by `wakeup()`; consumers treat this
    // as the signal to stop their loop.
    #[error("consumer woken up")]
    Wakeup,
}

const DEFAULT_PARTITIONS: u32 = 8;
const DEFAULT_LOG_CAPACITY: usize = 4096;

/// One message handed to a consumer, with its ordering coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Bytes,
}

/// Producer/consumer-factory side of the log.
///
/// `publish` routes by key: all messages sharing a key land in the same
/// partition and are observed in publish order by every group.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<u64>;

    // Creating a consumer joins `group` on `topic` and positions the group
    // at the current tail if it did not exist yet. Consumers in one group
    // share cursors, so each message is handed to exactly one of them.
    async fn consumer(&self, topic: &str, group: &str) -> Result<Arc<dyn TransportConsumer>>;
}

/// Blocking-poll consumer handle.
#[async_trait]
pub trait TransportConsumer: Send + Sync {
    // Blocks until at least one message is available, then returns a batch
    // ordered within each partition. Returns `TransportError::Wakeup` after
    // `wakeup()` was called.
    async fn poll(&self) -> Result<Vec<Delivery>>;

    // Interrupt a blocked (or the next) `poll` call. Safe to call from any
    // task or thread.
    fn wakeup(&self);
}

#[derive(Debug)]
struct LogEntry {
    offset: u64,
    key: String,
    payload: Bytes,
}

#[derive(Debug, Default)]
struct PartitionLog {
    entries: VecDeque<LogEntry>,
    next_offset: u64,
}

impl PartitionLog {
    fn append(&mut self, key: &str, payload: Bytes, capacity: usize) -> u64 {
        let offset = self.next_offset;
        self.next_offset += 1;
        self.entries.push_back(LogEntry {
            offset,
            key: key.to_string(),
            payload,
        });
        // Bounded log; oldest entries are dropped as new ones arrive.
        let overflow = self.entries.len().saturating_sub(capacity);
        if overflow > 0 {
            self.entries.drain(..overflow);
        }
        offset
    }

    fn oldest_offset(&self) -> u64 {
        self.entries
            .front()
            .map(|entry| entry.offset)
            .unwrap_or(self.next_offset)
    }
}

#[derive(Debug)]
struct TopicState {
    partitions: Vec<Mutex<PartitionLog>>,
    // Per-group consume cursors, one per partition, shared by every
    // consumer in the group.
    groups: Mutex<HashMap<String, Arc<GroupState>, RandomState>>,
    data_ready: Notify,
}

#[derive(Debug)]
struct GroupState {
    cursors: Mutex<Vec<u64>>,
}

impl TopicState {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions)
                .map(|_| Mutex::new(PartitionLog::default()))
                .collect(),
            groups: Mutex::new(HashMap::with_hasher(RandomState::new())),
            data_ready: Notify::new(),
        }
    }

    fn group(&self, name: &str) -> Arc<GroupState> {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(name) {
            return Arc::clone(group);
        }
        // New groups start at the tail so they only observe messages
        // published after the group joined.
        let cursors = self
            .partitions
            .iter()
            .map(|partition| partition.lock().next_offset)
            .collect();
        let group = Arc::new(GroupState {
            cursors: Mutex::new(cursors),
        });
        groups.insert(name.to_string(), Arc::clone(&group));
        group
    }
}

/// In-process partitioned log.
///
/// ```
/// use bytes::Bytes;
/// use waggle_transport::{LogTransport, Transport, TransportConsumer};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let transport = LogTransport::new();
///     let consumer = transport.consumer("updates", "g1").await.expect("consumer");
///     transport
///         .publish("updates", "key", Bytes::from_static(b"hello"))
///         .await
///         .expect("publish");
///     let batch = consumer.poll().await.expect("poll");
///     assert_eq!(batch[0].payload, Bytes::from_static(b"hello"));
/// });
/// ```
#[derive(Debug)]
pub struct LogTransport {
    topics: Mutex<HashMap<String, Arc<TopicState>, RandomState>>,
    hasher: RandomState,
    partitions: u32,
    log_capacity: usize,
}

impl Default for LogTransport {
    fn default() -> Self {
        Self {
            topics: Mutex::new(HashMap::with_hasher(RandomState::new())),
            hasher: RandomState::new(),
            partitions: DEFAULT_PARTITIONS,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partitions(mut self, partitions: u32) -> Result<Self> {
        if partitions == 0 {
            return Err(TransportError::ZeroPartitions);
        }
        self.partitions = partitions;
        Ok(self)
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TransportError::ZeroCapacity);
        }
        self.log_capacity = capacity;
        Ok(self)
    }

    // Topics are created on first use; all topics share the transport's
    // partition count and log capacity.
    fn topic(&self, name: &str) -> Arc<TopicState> {
        let mut topics = self.topics.lock();
        if let Some(topic) = topics.get(name) {
            return Arc::clone(topic);
        }
        let topic = Arc::new(TopicState::new(self.partitions));
        topics.insert(name.to_string(), Arc::clone(&topic));
        topic
    }

    fn partition_for(&self, key: &str, partitions: usize) -> usize {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() % partitions as u64) as usize
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<u64> {
        let topic = self.topic(topic);
        let index = self.partition_for(key, topic.partitions.len());
        let offset = {
            let mut partition = topic.partitions[index].lock();
            partition.append(key, payload, self.log_capacity)
        };
        topic.data_ready.notify_waiters();
        Ok(offset)
    }

    async fn consumer(&self, topic: &str, group: &str) -> Result<Arc<dyn TransportConsumer>> {
        let topic = self.topic(topic);
        let group = topic.group(group);
        Ok(Arc::new(LogConsumer {
            topic,
            group,
            woken: AtomicBool::new(false),
            wakeup: Notify::new(),
        }))
    }
}

#[derive(Debug)]
pub struct LogConsumer {
    topic: Arc<TopicState>,
    group: Arc<GroupState>,
    woken: AtomicBool,
    wakeup: Notify,
}

impl LogConsumer {
    // Drain everything past the group cursors in one pass. The cursor lock
    // is held for the whole scan so concurrent consumers in the same group
    // never hand out the same message twice.
    fn fetch(&self) -> Vec<Delivery> {
        let mut cursors = self.group.cursors.lock();
        let mut batch = Vec::new();
        for (index, partition) in self.topic.partitions.iter().enumerate() {
            let partition = partition.lock();
            let cursor = cursors[index].max(partition.oldest_offset());
            if cursor >= partition.next_offset {
                continue;
            }
            for entry in partition.entries.iter().filter(|e| e.offset >= cursor) {
                batch.push(Delivery {
                    partition: index as u32,
                    offset: entry.offset,
                    key: entry.key.clone(),
                    payload: entry.payload.clone(),
                });
            }
            cursors[index] = partition.next_offset;
        }
        batch
    }
}

#[async_trait]
impl TransportConsumer for LogConsumer {
    async fn poll(&self) -> Result<Vec<Delivery>> {
        loop {
            if self.woken.swap(false, Ordering::SeqCst) {
                return Err(TransportError::Wakeup);
            }
            // Arm the notification before scanning so a publish landing
            // between the scan and the await still wakes us.
            let notified = self.topic.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let batch = self.fetch();
            if !batch.is_empty() {
                return Ok(batch);
            }
            tokio::select! {
                _ = notified => {}
                _ = self.wakeup.notified() => {}
            }
        }
    }

    fn wakeup(&self) {
        self.woken.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }
}
