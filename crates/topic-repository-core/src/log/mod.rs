//! Partitioned-log client abstraction.
//!
//! The repository talks to the underlying log only through these traits:
//! - [`LogClient`] opens producer, consumer and admin connections
//! - [`ProducerConnection`] resolves partition leadership and dispatches sends
//! - [`ConsumerConnection`] reads partition positions
//! - [`TopicAdmin`] creates and deletes topics
//! - [`AdminEndpoints`] supplies the cluster connection string for admin work
//!
//! [`kafka`] implements them over the Kafka wire protocol.

pub mod kafka;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::LogResult;

/// Completion handle of an asynchronous send.
///
/// Resolves to the offset assigned to the record, or the send failure.
pub type SendHandle = BoxFuture<'static, LogResult<i64>>;

/// A partition as reported by cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition: i32,
    /// Leader broker id, `None` while the partition is leaderless.
    pub leader: Option<i32>,
}

/// A physical partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A record addressed to one partition.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

/// Settings of a topic to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopic {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
    pub retention_ms: i64,
    pub segment_ms: i64,
}

impl NewTopic {
    /// Topic-level configuration entries.
    #[must_use]
    pub fn configs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("retention.ms", self.retention_ms.to_string()),
            ("segment.ms", self.segment_ms.to_string()),
        ]
    }
}

/// Entry point to the partitioned log.
#[async_trait]
pub trait LogClient: Send + Sync + 'static {
    type Producer: ProducerConnection;
    type Consumer: ConsumerConnection;
    type Admin: TopicAdmin;

    /// Names of every topic in the cluster.
    async fn list_topics(&self) -> LogResult<Vec<String>>;

    /// Open a long-lived publish connection.
    async fn open_producer(&self) -> LogResult<Self::Producer>;

    /// Open a short-lived read connection.
    async fn open_consumer(&self) -> LogResult<Self::Consumer>;

    /// Open an administrative session against `connection_string`.
    async fn open_admin(&self, connection_string: &str) -> LogResult<Self::Admin>;
}

/// Publish-side connection. Shared by reference while pooled.
#[async_trait]
pub trait ProducerConnection: Send + Sync + 'static {
    /// Current partitions of `topic` and their leaders.
    async fn partitions_for(&self, topic: &str) -> LogResult<Vec<PartitionInfo>>;

    /// Dispatch a record without waiting for its acknowledgment.
    fn send(&self, record: LogRecord) -> SendHandle;

    /// Whether the connection can be handed out again.
    fn is_usable(&self) -> bool;

    /// Close the connection. Outstanding sends fail.
    fn close(&self);
}

/// Read-side connection.
///
/// Seeks are lazy: the offset is resolved when the position is requested.
#[async_trait]
pub trait ConsumerConnection: Send + 'static {
    /// Partitions of every topic in the cluster.
    async fn list_topics(&mut self) -> LogResult<Vec<(String, Vec<PartitionInfo>)>>;

    /// Current partitions of `topic`.
    async fn partitions_for(&mut self, topic: &str) -> LogResult<Vec<PartitionInfo>>;

    /// Replace the assignment with `partitions`.
    fn assign(&mut self, partitions: Vec<TopicPartition>);

    fn seek_to_beginning(&mut self, partitions: &[TopicPartition]);

    fn seek_to_end(&mut self, partitions: &[TopicPartition]);

    /// Offset of the next record to be read from `partition`.
    async fn position(&mut self, partition: &TopicPartition) -> LogResult<i64>;

    fn close(&mut self);
}

/// Administrative session.
#[async_trait]
pub trait TopicAdmin: Send + 'static {
    async fn create_topic(&mut self, topic: &NewTopic) -> LogResult<()>;

    /// Trigger deletion. Removal completes asynchronously on the cluster.
    async fn delete_topic(&mut self, name: &str) -> LogResult<()>;

    fn close(&mut self);
}

/// Source of the current cluster connection string.
#[async_trait]
pub trait AdminEndpoints: Send + Sync + 'static {
    async fn connection_string(&self) -> LogResult<String>;
}

/// Fixed connection string.
#[derive(Debug, Clone)]
pub struct StaticEndpoints {
    connection_string: String,
}

impl StaticEndpoints {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

#[async_trait]
impl AdminEndpoints for StaticEndpoints {
    async fn connection_string(&self) -> LogResult<String> {
        Ok(self.connection_string.clone())
    }
}
