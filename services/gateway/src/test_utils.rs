//! In-process doubles for the broker and endpoint interfaces.
//!
//! `MemoryBroker` is a partitioned in-memory log with consumer-group
//! committed offsets and manual commit, enough to exercise the ordering
//! and redelivery contracts. The endpoint doubles record, refuse, or delay
//! sends. Integration tests and the binary's embedded-broker mode both use
//! this module, so it is compiled unconditionally.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::broker::{
    BrokerClient, BrokerConsumer, BrokerError, BrokerProducer, ConsumerRecord, ConsumerSettings,
    ProducerRecord,
};
use crate::endpoint::{EndpointError, EndpointSink};

/// A record as stored in the in-memory log.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<Mutex<Vec<StoredRecord>>>,
}

impl TopicLog {
    fn new(partitions: i32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }
}

#[derive(Debug)]
struct BrokerInner {
    topics: DashMap<String, Arc<TopicLog>>,
    /// (group, topic, partition) -> next offset to consume.
    committed: DashMap<(String, String, i32), i64>,
    default_partitions: i32,
}

/// In-memory broker implementing the gateway's broker traits.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_default_partitions(1)
    }

    /// Topics auto-created by publishes get this many partitions.
    pub fn with_default_partitions(partitions: i32) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: DashMap::new(),
                committed: DashMap::new(),
                default_partitions: partitions.max(1),
            }),
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicLog> {
        self.inner
            .topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new(self.inner.default_partitions)))
            .clone()
    }

    /// Synchronous publish used by the producer handle.
    fn publish(&self, record: ProducerRecord) -> Result<(), BrokerError> {
        let log = self.topic(&record.topic);
        let partition_count = log.partitions.len() as i32;

        let partition = match record.partition {
            Some(p) if (0..partition_count).contains(&p) => p,
            Some(p) => {
                return Err(BrokerError::Publish {
                    topic: record.topic,
                    message: format!("partition {p} out of range (topic has {partition_count})"),
                })
            }
            None => match &record.key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() % partition_count as u64) as i32
                }
                None => 0,
            },
        };

        let mut slot = log.partitions[partition as usize].lock();
        let offset = slot.len() as i64;
        slot.push(StoredRecord {
            partition,
            offset,
            key: record.key,
            payload: record.payload,
            headers: record.headers,
        });
        Ok(())
    }

    /// All records of a topic, partition-major.
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        match self.inner.topics.get(topic) {
            Some(log) => log
                .partitions
                .iter()
                .flat_map(|p| p.lock().clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn records_in_partition(&self, topic: &str, partition: i32) -> Vec<StoredRecord> {
        match self.inner.topics.get(topic) {
            Some(log) => log
                .partitions
                .get(partition as usize)
                .map(|p| p.lock().clone())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Next offset the group would consume from, if ever committed.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|entry| *entry.value())
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .inner
            .topics
            .iter()
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn create_topic(
        &self,
        topic: &str,
        partitions: i32,
        _replication: i16,
    ) -> Result<(), BrokerError> {
        if self.inner.topics.contains_key(topic) {
            return Err(BrokerError::Topic {
                topic: topic.to_string(),
                message: "already exists".to_string(),
            });
        }
        self.inner
            .topics
            .insert(topic.to_string(), Arc::new(TopicLog::new(partitions)));
        Ok(())
    }

    fn producer(&self) -> Arc<dyn BrokerProducer> {
        Arc::new(MemoryProducer {
            broker: self.clone(),
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        settings: ConsumerSettings,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let log = self.topic(topic);
        let positions = (0..log.partitions.len() as i32)
            .map(|partition| {
                self.committed_offset(&settings.group_id, topic, partition)
                    .unwrap_or(0)
            })
            .collect();
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            group: settings.group_id,
            positions,
        }))
    }
}

#[derive(Debug)]
struct MemoryProducer {
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(&self, record: ProducerRecord) -> Result<(), BrokerError> {
        self.broker.publish(record)
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    topic: String,
    group: String,
    /// Fetch position per partition; independent of the committed offset,
    /// like a live consumer session.
    positions: Vec<i64>,
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumerRecord>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let log = self.broker.topic(&self.topic);
            for (partition, position) in self.positions.iter_mut().enumerate() {
                let slot = log.partitions[partition].lock();
                if let Some(record) = slot.get(*position as usize) {
                    let consumed = ConsumerRecord {
                        topic: self.topic.clone(),
                        partition: partition as i32,
                        offset: record.offset,
                        key: record.key.clone(),
                        payload: record.payload.clone(),
                    };
                    *position += 1;
                    return Ok(Some(consumed));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn commit(&mut self, record: &ConsumerRecord) -> Result<(), BrokerError> {
        self.broker.inner.committed.insert(
            (self.group.clone(), self.topic.clone(), record.partition),
            record.offset + 1,
        );
        Ok(())
    }
}

/// Broker whose every call fails; drives the startup health-check paths.
#[derive(Debug, Clone, Default)]
pub struct UnreachableBroker;

#[async_trait]
impl BrokerClient for UnreachableBroker {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        Err(BrokerError::Unreachable("no broker at configured address".to_string()))
    }

    async fn create_topic(&self, topic: &str, _: i32, _: i16) -> Result<(), BrokerError> {
        Err(BrokerError::Topic {
            topic: topic.to_string(),
            message: "unreachable".to_string(),
        })
    }

    fn producer(&self) -> Arc<dyn BrokerProducer> {
        Arc::new(UnreachableProducer)
    }

    async fn subscribe(
        &self,
        _topic: &str,
        _settings: ConsumerSettings,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        Err(BrokerError::Unreachable("no broker at configured address".to_string()))
    }
}

#[derive(Debug)]
struct UnreachableProducer;

#[async_trait]
impl BrokerProducer for UnreachableProducer {
    async fn send(&self, record: ProducerRecord) -> Result<(), BrokerError> {
        Err(BrokerError::Publish {
            topic: record.topic,
            message: "unreachable".to_string(),
        })
    }
}

/// Endpoint that records every payload with its arrival instant.
#[derive(Debug, Clone)]
pub struct CollectorEndpoint {
    name: String,
    received: Arc<Mutex<Vec<(Instant, String)>>>,
}

impl CollectorEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn payloads(&self) -> Vec<String> {
        self.received.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn received(&self) -> Vec<(Instant, String)> {
        self.received.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }
}

#[async_trait]
impl EndpointSink for CollectorEndpoint {
    async fn send(&self, payload: &str) -> Result<(), EndpointError> {
        self.received.lock().push((Instant::now(), payload.to_string()));
        Ok(())
    }

    fn describe(&self) -> String {
        format!("collector:{}", self.name)
    }
}

/// Endpoint that always refuses the connection (a network error),
/// recording each attempt's instant.
#[derive(Debug, Clone, Default)]
pub struct RefusingEndpoint {
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl RefusingEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl EndpointSink for RefusingEndpoint {
    async fn send(&self, _payload: &str) -> Result<(), EndpointError> {
        self.attempts.lock().push(Instant::now());
        Err(EndpointError::ConnectionRefused {
            addr: "refusing".to_string(),
            message: "connection refused".to_string(),
        })
    }

    fn describe(&self) -> String {
        "refusing".to_string()
    }
}

/// Endpoint that fails with a network error N times, then succeeds.
#[derive(Debug, Clone)]
pub struct FlakyEndpoint {
    failures_before_success: u32,
    attempts: Arc<AtomicU32>,
    delivered: Arc<Mutex<Vec<String>>>,
}

impl FlakyEndpoint {
    pub fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            attempts: Arc::new(AtomicU32::new(0)),
            delivered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl EndpointSink for FlakyEndpoint {
    async fn send(&self, payload: &str) -> Result<(), EndpointError> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt <= self.failures_before_success {
            return Err(EndpointError::ConnectionLost {
                addr: "flaky".to_string(),
                message: "socket reset".to_string(),
            });
        }
        self.delivered.lock().push(payload.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "flaky".to_string()
    }
}

/// Endpoint that rejects every payload with a non-network error.
#[derive(Debug, Clone, Default)]
pub struct RejectingEndpoint {
    attempts: Arc<AtomicU32>,
}

impl RejectingEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EndpointSink for RejectingEndpoint {
    async fn send(&self, _payload: &str) -> Result<(), EndpointError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(EndpointError::Other("payload rejected by validator".to_string()))
    }

    fn describe(&self) -> String {
        "rejecting".to_string()
    }
}

/// Endpoint that appends `<name>:start` / `<name>:end` markers around an
/// optional in-flight delay; proves ordering contracts.
#[derive(Debug, Clone)]
pub struct EventLogEndpoint {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl EventLogEndpoint {
    pub fn new(name: impl Into<String>, log: Arc<Mutex<Vec<String>>>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            log,
            delay,
        }
    }

    pub fn shared_log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }
}

#[async_trait]
impl EndpointSink for EventLogEndpoint {
    async fn send(&self, payload: &str) -> Result<(), EndpointError> {
        let marker = payload_marker(payload);
        self.log.lock().push(format!("{}:start:{}", self.name, marker));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.lock().push(format!("{}:end:{}", self.name, marker));
        Ok(())
    }

    fn describe(&self) -> String {
        format!("eventlog:{}", self.name)
    }
}

/// ClOrdID when present, else MsgType; identifies a payload in event logs.
fn payload_marker(payload: &str) -> String {
    let tags = fixwire::parse_tags(payload);
    tags.get(&fixwire::tags::CL_ORD_ID)
        .or_else(|| tags.get(&fixwire::tags::MSG_TYPE))
        .cloned()
        .unwrap_or_else(|| "?".to_string())
}

/// A well-formed NewOrderSingle payload used across the test suites.
pub fn sample_raw_message() -> &'static str {
    "8=FIX.4.4\u{1}9=100\u{1}35=D\u{1}49=GTWY\u{1}56=EXEC\u{1}55=AAPL\u{1}54=1\u{1}38=100\u{1}44=150.25\u{1}11=ORDER123\u{1}10=000\u{1}"
}
