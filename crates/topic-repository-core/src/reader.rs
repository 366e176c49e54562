//! Partition and position reads.
//!
//! Every read opens its own read connection and closes it before returning.
//! Nothing is cached between calls.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cursor::{to_caller_partition, to_physical_partition, Offset};
use crate::error::{LogError, LogResult, RepositoryError, Result};
use crate::log::{ConsumerConnection, LogClient, ProducerConnection, TopicPartition};
use crate::pool::{ConnectionPool, ReadConnection};

const OFFSETS_UNAVAILABLE: &str = "error occurred when fetching partition offsets";

/// A partition of a topic with its retained offset range in caller space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub topic: String,
    pub partition_id: String,
    pub oldest_available_offset: Offset,
    /// `BeforeOldest` when the partition is empty.
    pub newest_available_offset: Offset,
}

impl Partition {
    /// Build from physical positions: the first retained offset and the end
    /// offset (next offset to be written).
    #[must_use]
    pub fn from_positions(topic: &str, partition: i32, oldest: i64, end: i64) -> Self {
        Self {
            topic: topic.to_string(),
            partition_id: to_caller_partition(partition),
            oldest_available_offset: Offset::At(oldest),
            newest_available_offset: Offset::from_newest(end),
        }
    }

    /// Whether the partition holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.newest_available_offset.is_before_oldest()
    }
}

/// Where a new reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialPosition {
    Begin,
    End,
}

impl FromStr for InitialPosition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "begin" => Ok(Self::Begin),
            "end" => Ok(Self::End),
            other => Err(format!("bad initial position '{other}', expected begin or end")),
        }
    }
}

impl fmt::Display for InitialPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Begin => f.write_str("begin"),
            Self::End => f.write_str("end"),
        }
    }
}

/// Reads partition layouts and positions.
pub struct PartitionReader<C: LogClient> {
    pool: Arc<ConnectionPool<C>>,
}

impl<C: LogClient> PartitionReader<C> {
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool<C>>) -> Self {
        Self { pool }
    }

    /// Every partition of `topic` with its offset range.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ServiceUnavailable`] on any log failure.
    #[instrument(skip(self))]
    pub async fn list_partitions(&self, topic: &str) -> Result<Vec<Partition>> {
        let mut consumer = self.open().await?;
        let result: LogResult<Vec<Partition>> = async {
            let partitions = consumer
                .partitions_for(topic)
                .await?
                .into_iter()
                .map(|info| TopicPartition::new(topic, info.partition))
                .collect();
            describe(&mut *consumer, partitions).await
        }
        .await;
        result.map_err(|e| RepositoryError::unavailable(OFFSETS_UNAVAILABLE, e))
    }

    /// Partitions of several topics, read over one connection.
    ///
    /// Topics unknown to the cluster contribute nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ServiceUnavailable`] on any log failure.
    #[instrument(skip_all, fields(topics = topics.len()))]
    pub async fn list_partitions_for(&self, topics: &[String]) -> Result<Vec<Partition>> {
        let wanted: HashSet<&str> = topics.iter().map(String::as_str).collect();
        let mut consumer = self.open().await?;
        let result: LogResult<Vec<Partition>> = async {
            let partitions = consumer
                .list_topics()
                .await?
                .into_iter()
                .filter(|(name, _)| wanted.contains(name.as_str()))
                .flat_map(|(name, infos)| {
                    infos
                        .into_iter()
                        .map(move |info| TopicPartition::new(name.clone(), info.partition))
                })
                .collect();
            describe(&mut *consumer, partitions).await
        }
        .await;
        result.map_err(|e| RepositoryError::unavailable(OFFSETS_UNAVAILABLE, e))
    }

    /// One partition of `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Format`] for a malformed partition id, before
    /// any connection is opened, and [`RepositoryError::ServiceUnavailable`]
    /// on any log failure.
    #[instrument(skip(self))]
    pub async fn get_partition(&self, topic: &str, partition: &str) -> Result<Partition> {
        let physical = to_physical_partition(partition)?;
        let mut consumer = self.open().await?;
        let mut described = describe(&mut *consumer, vec![TopicPartition::new(topic, physical)])
            .await
            .map_err(|e| RepositoryError::unavailable(OFFSETS_UNAVAILABLE, e))?;
        described.pop().ok_or_else(|| {
            RepositoryError::unavailable(
                OFFSETS_UNAVAILABLE,
                LogError::UnknownPartition {
                    topic: topic.to_string(),
                    partition: physical,
                },
            )
        })
    }

    /// Physical read positions of every partition of `topic`, keyed by caller
    /// partition id.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ServiceUnavailable`] on any log failure.
    #[instrument(skip(self))]
    pub async fn materialize_positions(
        &self,
        topic: &str,
        position: InitialPosition,
    ) -> Result<BTreeMap<String, i64>> {
        let mut consumer = self.open().await?;
        let result: LogResult<BTreeMap<String, i64>> = async {
            let partitions: Vec<TopicPartition> = consumer
                .partitions_for(topic)
                .await?
                .into_iter()
                .map(|info| TopicPartition::new(topic, info.partition))
                .collect();
            consumer.assign(partitions.clone());
            match position {
                InitialPosition::Begin => consumer.seek_to_beginning(&partitions),
                InitialPosition::End => consumer.seek_to_end(&partitions),
            }
            let mut positions = BTreeMap::new();
            for tp in &partitions {
                let offset = consumer.position(tp).await?;
                positions.insert(to_caller_partition(tp.partition), offset);
            }
            Ok(positions)
        }
        .await;
        result.map_err(|e| RepositoryError::unavailable(OFFSETS_UNAVAILABLE, e))
    }

    /// Caller ids of the partitions of `topic`, resolved over a pooled
    /// publish connection.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ServiceUnavailable`] on any log failure.
    #[instrument(skip(self))]
    pub async fn list_partition_names(&self, topic: &str) -> Result<Vec<String>> {
        let producer = self.pool.take_producer().await.map_err(|e| {
            RepositoryError::unavailable("unable to obtain a producer connection", e)
        })?;
        let infos = producer.partitions_for(topic).await;
        producer.release();

        let mut partitions: Vec<i32> = infos
            .map_err(|e| {
                RepositoryError::unavailable(format!("unable to list partitions of {topic}"), e)
            })?
            .into_iter()
            .map(|info| info.partition)
            .collect();
        partitions.sort_unstable();
        Ok(partitions.into_iter().map(to_caller_partition).collect())
    }

    async fn open(&self) -> Result<ReadConnection<C::Consumer>> {
        self.pool
            .read_connection()
            .await
            .map_err(|e| RepositoryError::unavailable("unable to open a read connection", e))
    }
}

/// Assign `partitions`, read their oldest and end positions, and translate.
async fn describe<R: ConsumerConnection>(
    consumer: &mut R,
    mut partitions: Vec<TopicPartition>,
) -> LogResult<Vec<Partition>> {
    partitions.sort();
    consumer.assign(partitions.clone());

    consumer.seek_to_beginning(&partitions);
    let mut oldest = Vec::with_capacity(partitions.len());
    for tp in &partitions {
        oldest.push(consumer.position(tp).await?);
    }

    consumer.seek_to_end(&partitions);
    let mut described = Vec::with_capacity(partitions.len());
    for (tp, oldest) in partitions.iter().zip(oldest) {
        let end = consumer.position(tp).await?;
        debug!(partition = %tp, oldest, end, "read partition bounds");
        described.push(Partition::from_positions(&tp.topic, tp.partition, oldest, end));
    }
    Ok(described)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_from_positions() {
        let empty = Partition::from_positions("orders", 0, 0, 0);
        assert!(empty.is_empty());
        assert_eq!(empty.newest_available_offset.to_string(), "BEGIN");
        assert_eq!(empty.oldest_available_offset.to_string(), "0");

        let one = Partition::from_positions("orders", 1, 0, 1);
        assert!(!one.is_empty());
        assert_eq!(one.partition_id, "1");
        assert_eq!(one.newest_available_offset.to_string(), "0");
    }

    #[test]
    fn test_initial_position_parse() {
        assert_eq!("BEGIN".parse::<InitialPosition>(), Ok(InitialPosition::Begin));
        assert_eq!("end".parse::<InitialPosition>(), Ok(InitialPosition::End));
        assert!("middle".parse::<InitialPosition>().is_err());
    }

    #[test]
    fn test_partition_serializes_offsets_as_strings() {
        let value = serde_yaml::to_value(Partition::from_positions("t", 2, 5, 10)).unwrap();
        assert_eq!(value["partition_id"], serde_yaml::Value::from("2"));
        assert_eq!(value["oldest_available_offset"], serde_yaml::Value::from("5"));
        assert_eq!(value["newest_available_offset"], serde_yaml::Value::from("9"));
    }

    #[tokio::test]
    async fn test_offset_failures_share_one_message() {
        let cluster = crate::testing::MockLogCluster::new();
        let reader = PartitionReader::new(Arc::new(ConnectionPool::new(Arc::new(cluster), 1)));

        let listed = reader.list_partitions("missing").await.unwrap_err();
        let positions = reader
            .materialize_positions("missing", InitialPosition::End)
            .await
            .unwrap_err();

        for err in [listed, positions] {
            match err {
                RepositoryError::ServiceUnavailable { message, .. } => {
                    assert_eq!(message, OFFSETS_UNAVAILABLE);
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }
}
