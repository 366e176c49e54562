//! The topic repository facade.
//!
//! [`TopicRepository`] exposes every upward operation: topic administration,
//! publishing, partition reads and cursor validation. It owns the connection
//! pool shared by the publish pipeline and the partition reader.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::capacity::{CapacityHint, PartitionPlanner};
use crate::config::RepositoryConfig;
use crate::cursor::{self, to_physical_partition, Cursor, Offset, PhysicalCursor};
use crate::error::{LogError, RepositoryError, Result};
use crate::log::{AdminEndpoints, LogClient, NewTopic, TopicAdmin};
use crate::metrics::RepositoryMetrics;
use crate::pool::ConnectionPool;
use crate::publish::{BatchItem, PublishPipeline};
use crate::reader::{InitialPosition, Partition, PartitionReader};
use crate::validator;

/// A topic to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    #[serde(default)]
    pub capacity_hint: Option<CapacityHint>,
    /// Required; creation fails without it.
    #[serde(default)]
    pub retention_ms: Option<i64>,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, retention_ms: i64) -> Self {
        Self {
            name: name.into(),
            capacity_hint: None,
            retention_ms: Some(retention_ms),
        }
    }

    #[must_use]
    pub fn with_capacity_hint(mut self, hint: CapacityHint) -> Self {
        self.capacity_hint = Some(hint);
        self
    }
}

/// Storage and transport layer over a partitioned log.
pub struct TopicRepository<C: LogClient> {
    client: Arc<C>,
    pool: Arc<ConnectionPool<C>>,
    pipeline: PublishPipeline<C>,
    reader: PartitionReader<C>,
    planner: PartitionPlanner,
    endpoints: Arc<dyn AdminEndpoints>,
    replication_factor: i16,
    segment_ms: i64,
    metrics: Option<Arc<RepositoryMetrics>>,
}

impl<C: LogClient> TopicRepository<C> {
    /// Create a repository over `client`.
    ///
    /// The configuration should already be validated via
    /// [`RepositoryConfig::validate`].
    pub fn new(client: Arc<C>, endpoints: Arc<dyn AdminEndpoints>, config: &RepositoryConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&client),
            config.publish.producer_pool_size,
        ));
        let pipeline = PublishPipeline::new(
            Arc::clone(&pool),
            config.publish.send_timeout(),
            config.kafka.request_timeout(),
        );
        Self {
            client,
            reader: PartitionReader::new(Arc::clone(&pool)),
            pool,
            pipeline,
            planner: PartitionPlanner::from_config(&config.topics),
            endpoints,
            replication_factor: config.topics.replication_factor,
            segment_ms: config.topics.segment_ms,
            metrics: None,
        }
    }

    /// Record metrics for publishing and cursor validation.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RepositoryMetrics>) -> Self {
        self.pipeline = self.pipeline.with_metrics(Arc::clone(&metrics));
        self.metrics = Some(metrics);
        self
    }

    /// Replace the partition planner.
    #[must_use]
    pub fn with_planner(mut self, planner: PartitionPlanner) -> Self {
        self.planner = planner;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    #[must_use]
    pub fn planner(&self) -> &PartitionPlanner {
        &self.planner
    }

    /// Names of every topic.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ServiceUnavailable`] if the cluster cannot
    /// be reached.
    pub async fn list_topics(&self) -> Result<Vec<String>> {
        self.client
            .list_topics()
            .await
            .map_err(|e| RepositoryError::unavailable("failed to list topics", e))
    }

    /// Whether `topic` exists.
    ///
    /// # Errors
    ///
    /// See [`TopicRepository::list_topics`].
    pub async fn topic_exists(&self, topic: &str) -> Result<bool> {
        Ok(self.list_topics().await?.iter().any(|t| t == topic))
    }

    /// Whether `topic` has a partition with caller id `partition`.
    ///
    /// # Errors
    ///
    /// See [`TopicRepository::list_partition_names`].
    pub async fn partition_exists(&self, topic: &str, partition: &str) -> Result<bool> {
        Ok(self
            .list_partition_names(topic)
            .await?
            .iter()
            .any(|p| p == partition))
    }

    /// Create a topic sized by the partition planner.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::InvalidTopicSpec`] without a retention time
    /// - [`RepositoryError::DuplicateTopic`] if the name is taken
    /// - [`RepositoryError::ServiceUnavailable`] on any other failure
    #[instrument(skip_all, fields(topic = %spec.name))]
    pub async fn create_topic(&self, spec: &TopicSpec) -> Result<()> {
        let retention_ms = spec.retention_ms.ok_or_else(|| {
            RepositoryError::InvalidTopicSpec("retention time can not be null".to_string())
        })?;

        let partitions = self.planner.choose_partition_count(spec.capacity_hint.as_ref());
        let topic = NewTopic {
            name: spec.name.clone(),
            partitions: i32::try_from(partitions).unwrap_or(i32::MAX),
            replication_factor: self.replication_factor,
            retention_ms,
            segment_ms: self.segment_ms,
        };

        let connection_string = self
            .endpoints
            .connection_string()
            .await
            .map_err(|e| RepositoryError::unavailable("unable to resolve the cluster address", e))?;
        let mut admin = self
            .pool
            .admin_session(&connection_string)
            .await
            .map_err(|e| RepositoryError::unavailable("unable to open an admin session", e))?;

        match admin.create_topic(&topic).await {
            Ok(()) => {
                info!(
                    partitions = topic.partitions,
                    replication_factor = topic.replication_factor,
                    retention_ms,
                    "created topic"
                );
                Ok(())
            }
            Err(LogError::TopicAlreadyExists(_)) => {
                Err(RepositoryError::DuplicateTopic(spec.name.clone()))
            }
            Err(e) => Err(RepositoryError::unavailable(
                format!("unable to create topic {}", spec.name),
                e,
            )),
        }
    }

    /// Trigger deletion of `topic`. Removal completes asynchronously.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::TopicDeletion`] on any failure.
    #[instrument(skip(self))]
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        let deletion = |source: LogError| RepositoryError::TopicDeletion {
            topic: topic.to_string(),
            source,
        };

        let connection_string = self.endpoints.connection_string().await.map_err(deletion)?;
        let mut admin = self
            .pool
            .admin_session(&connection_string)
            .await
            .map_err(deletion)?;
        admin.delete_topic(topic).await.map_err(deletion)?;
        info!("triggered topic deletion");
        Ok(())
    }

    /// Publish `items` to `topic`. See [`PublishPipeline::publish`].
    ///
    /// # Errors
    ///
    /// Fails with [`RepositoryError::Publish`] if any item failed.
    pub async fn publish(&self, topic: &str, items: &mut [BatchItem]) -> Result<()> {
        self.pipeline.publish(topic, items).await
    }

    /// See [`PartitionReader::list_partitions`].
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ServiceUnavailable`] on any log failure.
    pub async fn list_partitions(&self, topic: &str) -> Result<Vec<Partition>> {
        self.reader.list_partitions(topic).await
    }

    /// See [`PartitionReader::list_partitions_for`].
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ServiceUnavailable`] on any log failure.
    pub async fn list_partitions_for(&self, topics: &[String]) -> Result<Vec<Partition>> {
        self.reader.list_partitions_for(topics).await
    }

    /// See [`PartitionReader::get_partition`].
    ///
    /// # Errors
    ///
    /// Fails on a malformed partition id or any log failure.
    pub async fn get_partition(&self, topic: &str, partition: &str) -> Result<Partition> {
        self.reader.get_partition(topic, partition).await
    }

    /// See [`PartitionReader::materialize_positions`].
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ServiceUnavailable`] on any log failure.
    pub async fn materialize_positions(
        &self,
        topic: &str,
        position: InitialPosition,
    ) -> Result<BTreeMap<String, i64>> {
        self.reader.materialize_positions(topic, position).await
    }

    /// See [`PartitionReader::list_partition_names`].
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ServiceUnavailable`] on any log failure.
    pub async fn list_partition_names(&self, topic: &str) -> Result<Vec<String>> {
        self.reader.list_partition_names(topic).await
    }

    /// Validate read cursors against the current layout of `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::InvalidCursor`] for the first rejected cursor,
    /// or [`RepositoryError::ServiceUnavailable`] if the layout cannot be read.
    pub async fn validate_cursors(&self, topic: &str, cursors: &[Cursor]) -> Result<()> {
        let partitions = self.list_partitions(topic).await?;
        self.observe(validator::validate_cursors(&partitions, cursors))
    }

    /// Validate commit cursors against the partitions of `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::InvalidCursor`] for the first rejected cursor,
    /// or [`RepositoryError::ServiceUnavailable`] if the partitions cannot be
    /// listed.
    pub async fn validate_commit_cursors(&self, topic: &str, cursors: &[Cursor]) -> Result<()> {
        let names = self.list_partition_names(topic).await?;
        self.observe(validator::validate_commit_cursors(&names, cursors))
    }

    /// Compare two caller offsets.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Format`] unless both offsets are numeric.
    pub fn compare_offsets(&self, first: &str, second: &str) -> Result<Ordering> {
        Ok(cursor::compare_offsets(first, second)?)
    }

    /// Validate `cursors` and translate each to the physical position a reader
    /// resumes from: the partition's oldest offset for the sentinel, otherwise
    /// the offset after the cursor.
    ///
    /// # Errors
    ///
    /// See [`TopicRepository::validate_cursors`].
    #[instrument(skip(self, cursors), fields(cursors = cursors.len()))]
    pub async fn read_start_positions(
        &self,
        topic: &str,
        cursors: &[Cursor],
    ) -> Result<Vec<PhysicalCursor>> {
        let partitions = self.list_partitions(topic).await?;
        self.observe(validator::validate_cursors(&partitions, cursors))?;

        cursors
            .iter()
            .map(|c| -> Result<PhysicalCursor> {
                let partition_id = c.partition().unwrap_or_default();
                let offset: Offset = c.offset().unwrap_or_default().parse()?;
                let oldest = partitions
                    .iter()
                    .find(|p| p.partition_id == partition_id)
                    .and_then(|p| match p.oldest_available_offset {
                        Offset::At(oldest) => Some(oldest),
                        Offset::BeforeOldest => None,
                    })
                    .unwrap_or(0);
                Ok(PhysicalCursor {
                    partition: to_physical_partition(partition_id)?,
                    offset: offset.read_start(oldest),
                })
            })
            .collect()
    }

    /// Close idle publish connections.
    pub fn close(&self) {
        self.pool.close_idle();
    }

    fn observe(&self, result: Result<()>) -> Result<()> {
        if let Some(kind) = result.as_ref().err().and_then(RepositoryError::cursor_kind) {
            warn!(%kind, "rejected cursor");
            if let Some(metrics) = &self.metrics {
                metrics.record_cursor_rejection(kind.as_str());
            }
        }
        result
    }
}
