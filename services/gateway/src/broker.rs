//! Broker client interfaces.
//!
//! The broker client library itself is an external collaborator; the gateway
//! programs against these traits. Manual offset commit is an explicit
//! capability of [`BrokerConsumer`] so that commit-after-dispatch is a
//! compile-time contract rather than a runtime discovery.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Record header marking the payload type on egress.
pub const HEADER_TYPE_ID: &str = "__TypeId__";
pub const TYPE_ID_ENVELOPE: &str = "fixMessageEnvelope";

/// Conditional egress headers carrying the resolved partition strategy.
pub const HEADER_KAFKA_KEY: &str = "kafka.KEY";
pub const HEADER_KAFKA_PARTITION: &str = "kafka.PARTITION";

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("topic '{topic}': {message}")]
    Topic { topic: String, message: String },

    #[error("publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    #[error("offset commit failed: {0}")]
    Commit(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// A record consumed from a broker topic.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: String,
}

/// A record published to a broker topic.
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Option<String>,
    pub partition: Option<i32>,
    pub headers: Vec<(String, String)>,
    pub payload: String,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            partition: None,
            headers: Vec::new(),
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Consumer knobs the ordered input loop depends on.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub max_poll_records: usize,
    pub auto_commit: bool,
    pub allow_manual_commit: bool,
    pub break_on_first_error: bool,
    pub session_timeout: Duration,
}

impl ConsumerSettings {
    /// Settings for strict per-partition ordering: one record at a time,
    /// auto-commit off, manual commit on.
    pub fn ordered(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            max_poll_records: 1,
            auto_commit: false,
            allow_manual_commit: true,
            break_on_first_error: false,
            session_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide producer; implementations are internally thread-safe.
#[async_trait]
pub trait BrokerProducer: Send + Sync + Debug {
    async fn send(&self, record: ProducerRecord) -> Result<(), BrokerError>;

    async fn flush(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// One consumer instance per INPUT route; never shared across workers.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Next record, or `None` when the timeout elapses with nothing to read.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumerRecord>, BrokerError>;

    /// Commit the offset of `record` for this consumer's group. Called only
    /// after dispatch has terminated for the record.
    async fn commit(&mut self, record: &ConsumerRecord) -> Result<(), BrokerError>;
}

/// Entry point the supervisor uses to reach the broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError>;

    async fn create_topic(
        &self,
        topic: &str,
        partitions: i32,
        replication: i16,
    ) -> Result<(), BrokerError>;

    fn producer(&self) -> Arc<dyn BrokerProducer>;

    async fn subscribe(
        &self,
        topic: &str,
        settings: ConsumerSettings,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}
