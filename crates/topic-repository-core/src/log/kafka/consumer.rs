//! Read-side connection.
//!
//! Seeks only record intent. The offset is fetched from the partition leader
//! with a ListOffsets request when the position is first asked for.
//!
//! Leaders are remembered from every metadata response, so describing the
//! partitions of a topic costs one metadata round-trip.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use kafka_protocol::messages::list_offsets_request::{ListOffsetsPartition, ListOffsetsTopic};
use kafka_protocol::messages::{BrokerId, ListOffsetsRequest};
use tracing::debug;

use crate::error::{LogError, LogResult};
use crate::log::{ConsumerConnection, PartitionInfo, TopicPartition};

use super::cluster::KafkaCluster;
use super::protocol::{self, versions, EARLIEST_TIMESTAMP, LATEST_TIMESTAMP};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Beginning,
    End,
    Resolved(i64),
}

/// Short-lived consumer over its own broker connections.
pub struct KafkaConsumer {
    cluster: KafkaCluster,
    assignment: BTreeMap<TopicPartition, Position>,
    leaders: HashMap<TopicPartition, i32>,
}

impl KafkaConsumer {
    pub(crate) fn new(cluster: KafkaCluster) -> Self {
        Self {
            cluster,
            assignment: BTreeMap::new(),
            leaders: HashMap::new(),
        }
    }

    fn remember(&mut self, partitions: &[PartitionInfo]) {
        for info in partitions {
            let tp = TopicPartition::new(info.topic.clone(), info.partition);
            match info.leader {
                Some(leader) => {
                    self.leaders.insert(tp, leader);
                }
                None => {
                    self.leaders.remove(&tp);
                }
            }
        }
    }

    /// Leader of `tp`, refreshing the metadata of every assigned topic on a
    /// miss.
    async fn leader_of(&mut self, tp: &TopicPartition) -> LogResult<i32> {
        if let Some(leader) = self.leaders.get(tp) {
            return Ok(*leader);
        }

        let mut topics: Vec<String> = self.assignment.keys().map(|a| a.topic.clone()).collect();
        topics.push(tp.topic.clone());
        topics.sort_unstable();
        topics.dedup();
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        let metadata = self.cluster.fetch_metadata(Some(&names)).await?;

        let requested = metadata.partitions_of(&tp.topic)?;
        self.remember(&requested);
        for topic in topics.iter().filter(|t| **t != tp.topic) {
            if let Ok(partitions) = metadata.partitions_of(topic) {
                self.remember(&partitions);
            }
        }

        self.leaders
            .get(tp)
            .copied()
            .ok_or_else(|| LogError::UnknownPartition {
                topic: tp.topic.clone(),
                partition: tp.partition,
            })
    }

    fn seek(&mut self, partitions: &[TopicPartition], position: Position) {
        for tp in partitions {
            if let Some(current) = self.assignment.get_mut(tp) {
                *current = position;
            }
        }
    }

    async fn list_offset(&mut self, tp: &TopicPartition, timestamp: i64) -> LogResult<i64> {
        let leader = self.leader_of(tp).await?;

        let request = ListOffsetsRequest::default()
            .with_replica_id(BrokerId::from(-1))
            .with_topics(vec![ListOffsetsTopic::default()
                .with_name(protocol::topic_name(&tp.topic))
                .with_partitions(vec![ListOffsetsPartition::default()
                    .with_partition_index(tp.partition)
                    .with_current_leader_epoch(-1)
                    .with_timestamp(timestamp)])]);

        let response = self
            .cluster
            .broker(leader)?
            .request(&request, versions::LIST_OFFSETS)
            .await?;
        let partition = response
            .topics
            .iter()
            .filter(|topic| topic.name.as_str() == tp.topic)
            .flat_map(|topic| topic.partitions.iter())
            .find(|p| p.partition_index == tp.partition)
            .ok_or_else(|| LogError::Protocol {
                message: format!("list offsets response has no entry for {tp}"),
            })?;
        if protocol::is_leadership_error(partition.error_code) {
            self.leaders.remove(tp);
        }
        protocol::check_error(partition.error_code, None)?;

        debug!(partition = %tp, timestamp, offset = partition.offset, broker_id = leader, "resolved position");
        Ok(partition.offset)
    }
}

#[async_trait]
impl ConsumerConnection for KafkaConsumer {
    async fn list_topics(&mut self) -> LogResult<Vec<(String, Vec<PartitionInfo>)>> {
        let metadata = self.cluster.fetch_metadata(None).await?;
        let topics: Vec<(String, Vec<PartitionInfo>)> = metadata
            .topics
            .into_iter()
            .filter(|topic| !topic.is_internal && topic.error_code == protocol::error_codes::NONE)
            .map(|topic| (topic.name, topic.partitions))
            .collect();
        for (_, partitions) in &topics {
            self.remember(partitions);
        }
        Ok(topics)
    }

    async fn partitions_for(&mut self, topic: &str) -> LogResult<Vec<PartitionInfo>> {
        let partitions = self
            .cluster
            .fetch_metadata(Some(std::slice::from_ref(&topic)))
            .await?
            .partitions_of(topic)?;
        self.remember(&partitions);
        Ok(partitions)
    }

    fn assign(&mut self, partitions: Vec<TopicPartition>) {
        self.assignment = partitions
            .into_iter()
            .map(|tp| (tp, Position::Beginning))
            .collect();
    }

    fn seek_to_beginning(&mut self, partitions: &[TopicPartition]) {
        self.seek(partitions, Position::Beginning);
    }

    fn seek_to_end(&mut self, partitions: &[TopicPartition]) {
        self.seek(partitions, Position::End);
    }

    async fn position(&mut self, partition: &TopicPartition) -> LogResult<i64> {
        let current = *self
            .assignment
            .get(partition)
            .ok_or_else(|| LogError::NotAssigned {
                topic: partition.topic.clone(),
                partition: partition.partition,
            })?;

        let timestamp = match current {
            Position::Resolved(offset) => return Ok(offset),
            Position::Beginning => EARLIEST_TIMESTAMP,
            Position::End => LATEST_TIMESTAMP,
        };

        let offset = self.list_offset(partition, timestamp).await?;
        self.assignment
            .insert(partition.clone(), Position::Resolved(offset));
        Ok(offset)
    }

    fn close(&mut self) {
        self.assignment.clear();
        self.leaders.clear();
        self.cluster.close();
    }
}
