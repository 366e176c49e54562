//! Publish pipeline.
//!
//! A batch is published over one pooled producer connection:
//! 1. resolve partition leadership and stamp every item with its broker
//! 2. dispatch one asynchronous send per item, in order
//! 3. wait for the acknowledgments in order under one shared time budget
//!
//! A timed-out acknowledgment fails its item, terminates the connection and
//! abandons the remaining waits. Other send failures fail only their item.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, instrument, warn};

use crate::cursor::to_physical_partition;
use crate::error::{LogError, RepositoryError, Result};
use crate::log::{LogClient, LogRecord, ProducerConnection, SendHandle};
use crate::metrics::RepositoryMetrics;
use crate::pool::{ConnectionPool, PooledProducer};

/// Detail recorded on items whose acknowledgment timed out.
pub const TIMED_OUT_DETAIL: &str = "timed out";

/// How far an item got through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishStep {
    #[default]
    None,
    Partitioning,
    Publishing,
}

/// Outcome of an item.
///
/// Items start out `Aborted` and keep that status when the batch is abandoned
/// before their acknowledgment is awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishStatus {
    #[default]
    Aborted,
    Submitted,
    Failed,
}

impl fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Aborted => "aborted",
            Self::Submitted => "submitted",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One event of a publish batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    event: Bytes,
    partition: Option<String>,
    broker: Option<i32>,
    topic: Option<String>,
    step: PublishStep,
    status: PublishStatus,
    detail: String,
}

impl BatchItem {
    pub fn new(event: impl Into<Bytes>) -> Self {
        Self {
            event: event.into(),
            partition: None,
            broker: None,
            topic: None,
            step: PublishStep::None,
            status: PublishStatus::Aborted,
            detail: String::new(),
        }
    }

    /// Item already routed to `partition`.
    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.set_partition(partition);
        self
    }

    /// Route the item to a caller partition.
    pub fn set_partition(&mut self, partition: impl Into<String>) {
        self.partition = Some(partition.into());
        self.step = PublishStep::Partitioning;
    }

    #[must_use]
    pub fn event(&self) -> &Bytes {
        &self.event
    }

    #[must_use]
    pub fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }

    /// Leader of the item's partition when the batch was routed.
    #[must_use]
    pub fn broker(&self) -> Option<i32> {
        self.broker
    }

    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    #[must_use]
    pub fn step(&self) -> PublishStep {
        self.step
    }

    #[must_use]
    pub fn status(&self) -> PublishStatus {
        self.status
    }

    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }

    fn update_status_and_detail(&mut self, status: PublishStatus, detail: impl Into<String>) {
        self.status = status;
        self.detail = detail.into();
    }
}

/// How the wait loop ended.
enum WaitOutcome {
    Completed,
    TimedOut,
}

fn is_log_timeout(e: &RepositoryError) -> bool {
    matches!(e, RepositoryError::ServiceUnavailable { source, .. } if source.is_timeout())
}

/// Publishes batches through pooled producer connections.
pub struct PublishPipeline<C: LogClient> {
    pool: Arc<ConnectionPool<C>>,
    budget: Duration,
    metrics: Option<Arc<RepositoryMetrics>>,
}

impl<C: LogClient> PublishPipeline<C> {
    /// The wait budget of a batch is `send_timeout + request_timeout`.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool<C>>, send_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool,
            budget: send_timeout + request_timeout,
            metrics: None,
        }
    }

    /// Record publish metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RepositoryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Total time allowed for the acknowledgments of one batch.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Publish `items` to `topic`.
    ///
    /// Items are updated in place; inspect them after a failed call.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::ServiceUnavailable`] if no connection or partition
    ///   layout can be obtained
    /// - [`RepositoryError::MissingPartition`] or [`RepositoryError::Format`]
    ///   if an item is not routed to a valid partition
    /// - [`RepositoryError::Publish`] if any item failed
    #[instrument(skip_all, fields(topic = %topic, items = items.len()))]
    pub async fn publish(&self, topic: &str, items: &mut [BatchItem]) -> Result<()> {
        let started = Instant::now();
        if let Some(metrics) = &self.metrics {
            metrics.record_batch(items.len());
        }

        let result = self.publish_with_producer(topic, items).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_duration(started.elapsed().as_secs_f64());
        }
        result?;

        let failed = items
            .iter()
            .filter(|item| item.status == PublishStatus::Failed)
            .count();
        if failed > 0 {
            return Err(RepositoryError::Publish {
                topic: topic.to_string(),
                failed,
                total: items.len(),
            });
        }

        debug!("published batch");
        Ok(())
    }

    async fn publish_with_producer(&self, topic: &str, items: &mut [BatchItem]) -> Result<()> {
        let producer = self.pool.take_producer().await.map_err(|e| {
            RepositoryError::unavailable("unable to obtain a producer connection", e)
        })?;
        self.report_in_use();

        let outcome = self.dispatch_and_wait(&producer, topic, items).await;
        let result = match outcome {
            Ok(WaitOutcome::Completed) => {
                producer.release();
                Ok(())
            }
            Ok(WaitOutcome::TimedOut) => {
                self.terminate(producer);
                Ok(())
            }
            Err(e @ RepositoryError::ServiceUnavailable { .. }) if is_log_timeout(&e) => {
                self.terminate(producer);
                Err(e)
            }
            Err(e) => {
                producer.release();
                Err(e)
            }
        };
        self.report_in_use();
        result
    }

    fn terminate(&self, producer: PooledProducer<C>) {
        producer.terminate();
        if let Some(metrics) = &self.metrics {
            metrics.record_termination();
        }
    }

    async fn dispatch_and_wait(
        &self,
        producer: &C::Producer,
        topic: &str,
        items: &mut [BatchItem],
    ) -> Result<WaitOutcome> {
        let leaders: HashMap<i32, Option<i32>> = producer
            .partitions_for(topic)
            .await
            .map_err(|e| {
                RepositoryError::unavailable(format!("unable to resolve partitions of {topic}"), e)
            })?
            .into_iter()
            .map(|info| (info.partition, info.leader))
            .collect();

        let mut targets = Vec::with_capacity(items.len());
        for (index, item) in items.iter_mut().enumerate() {
            let partition = item
                .partition()
                .ok_or(RepositoryError::MissingPartition { index })?;
            let physical = to_physical_partition(partition)?;
            item.broker = leaders.get(&physical).copied().flatten();
            item.topic = Some(topic.to_string());
            targets.push(physical);
        }

        let handles: Vec<SendHandle> = items
            .iter_mut()
            .zip(targets)
            .map(|(item, partition)| {
                item.step = PublishStep::Publishing;
                producer.send(LogRecord {
                    topic: topic.to_string(),
                    partition,
                    key: item.partition.as_deref().map(|p| Bytes::copy_from_slice(p.as_bytes())),
                    value: item.event.clone(),
                })
            })
            .collect();

        let mut remaining = self.budget;
        for (item, handle) in items.iter_mut().zip(handles) {
            let start = Instant::now();
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(offset)) => {
                    debug!(
                        partition = item.partition().unwrap_or_default(),
                        offset, "event acknowledged"
                    );
                    item.update_status_and_detail(PublishStatus::Submitted, "");
                }
                Ok(Err(e)) if e.is_timeout() => {
                    self.fail_timed_out(item, &e);
                    return Ok(WaitOutcome::TimedOut);
                }
                Ok(Err(e)) => {
                    warn!(
                        partition = item.partition().unwrap_or_default(),
                        broker_id = ?item.broker,
                        error = %e,
                        "event failed to publish"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_failure("send_error");
                    }
                    item.update_status_and_detail(PublishStatus::Failed, e.to_string());
                }
                Err(_) => {
                    let e = LogError::Timeout(format!("no acknowledgment within {remaining:?}"));
                    self.fail_timed_out(item, &e);
                    return Ok(WaitOutcome::TimedOut);
                }
            }
            remaining = remaining.saturating_sub(start.elapsed());
        }

        Ok(WaitOutcome::Completed)
    }

    fn fail_timed_out(&self, item: &mut BatchItem, e: &LogError) {
        error!(
            topic = item.topic().unwrap_or_default(),
            broker_id = ?item.broker,
            error = %e,
            "log timeout"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_failure("timed_out");
        }
        item.update_status_and_detail(PublishStatus::Failed, TIMED_OUT_DETAIL);
    }

    fn report_in_use(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_producers_in_use(self.pool.in_use());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLogCluster;

    fn pipeline(cluster: &MockLogCluster, budget_ms: u64) -> PublishPipeline<MockLogCluster> {
        let pool = Arc::new(ConnectionPool::new(Arc::new(cluster.clone()), 2));
        PublishPipeline::new(pool, Duration::from_millis(budget_ms), Duration::ZERO)
    }

    fn items(partitions: &[&str]) -> Vec<BatchItem> {
        partitions
            .iter()
            .map(|p| BatchItem::new(format!("event-{p}")).with_partition(*p))
            .collect()
    }

    #[test]
    fn test_new_item_defaults() {
        let item = BatchItem::new("payload");
        assert_eq!(item.status(), PublishStatus::Aborted);
        assert_eq!(item.step(), PublishStep::None);
        assert_eq!(item.partition(), None);

        let item = item.with_partition("2");
        assert_eq!(item.step(), PublishStep::Partitioning);
        assert_eq!(item.partition(), Some("2"));
    }

    #[test]
    fn test_budget_is_sum_of_timeouts() {
        let cluster = MockLogCluster::new();
        let pool = Arc::new(ConnectionPool::new(Arc::new(cluster), 1));
        let p = PublishPipeline::new(pool, Duration::from_millis(300), Duration::from_millis(200));
        assert_eq!(p.budget(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_publish_stamps_items() {
        let cluster = MockLogCluster::new();
        cluster.create_topic_with_leaders("orders", &[Some(7), Some(8)]);
        let p = pipeline(&cluster, 1_000);

        let mut batch = items(&["0", "1"]);
        p.publish("orders", &mut batch).await.unwrap();

        for item in &batch {
            assert_eq!(item.status(), PublishStatus::Submitted);
            assert_eq!(item.step(), PublishStep::Publishing);
            assert_eq!(item.topic(), Some("orders"));
        }
        assert_eq!(batch[0].broker(), Some(7));
        assert_eq!(batch[1].broker(), Some(8));
        assert_eq!(cluster.records("orders", 0).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_partition_is_rejected() {
        let cluster = MockLogCluster::new();
        cluster.create_topic("orders", 2);
        let p = pipeline(&cluster, 1_000);

        let mut batch = vec![
            BatchItem::new("a").with_partition("0"),
            BatchItem::new("b"),
        ];
        let err = p.publish("orders", &mut batch).await.unwrap_err();
        assert!(matches!(err, RepositoryError::MissingPartition { index: 1 }));
        assert!(cluster.records("orders", 0).is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_fails_only_that_item() {
        let cluster = MockLogCluster::new();
        cluster.create_topic("orders", 3);
        cluster.fail_partition("orders", 1, "NOT_LEADER_OR_FOLLOWER");
        let p = pipeline(&cluster, 1_000);

        let mut batch = items(&["0", "1", "2"]);
        let err = p.publish("orders", &mut batch).await.unwrap_err();

        assert!(matches!(err, RepositoryError::Publish { failed: 1, total: 3, .. }));
        assert_eq!(batch[0].status(), PublishStatus::Submitted);
        assert_eq!(batch[1].status(), PublishStatus::Failed);
        assert!(batch[1].detail().contains("NOT_LEADER_OR_FOLLOWER"));
        assert_eq!(batch[2].status(), PublishStatus::Submitted);
        assert_eq!(cluster.producers_closed(), 0);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_unavailable() {
        let cluster = MockLogCluster::new();
        let p = pipeline(&cluster, 1_000);

        let mut batch = items(&["0"]);
        let err = p.publish("missing", &mut batch).await.unwrap_err();
        assert!(matches!(err, RepositoryError::ServiceUnavailable { .. }));
        assert_eq!(cluster.producers_closed(), 0);
    }

    #[tokio::test]
    async fn test_partition_lookup_timeout_terminates_producer() {
        let cluster = MockLogCluster::new();
        cluster.create_topic("orders", 1);
        cluster.timeout_metadata(true);
        let p = pipeline(&cluster, 1_000);

        let mut batch = items(&["0"]);
        let err = p.publish("orders", &mut batch).await.unwrap_err();

        assert!(is_log_timeout(&err));
        assert_eq!(batch[0].status(), PublishStatus::Aborted);
        assert_eq!(cluster.producers_closed(), 1);
        assert_eq!(p.pool.terminated_count(), 1);
        assert_eq!(p.pool.idle_count(), 0);
    }
}
