//! Test harness for integration testing of the topic repository.
//!
//! Provides a complete test environment with:
//! - An in-memory log cluster
//! - A repository wired to it, with metrics
//! - Helpers for seeding topics and building batches

use std::sync::Arc;

use crate::config::RepositoryConfig;
use crate::log::StaticEndpoints;
use crate::metrics::RepositoryMetrics;
use crate::publish::BatchItem;
use crate::repository::TopicRepository;

use super::mock_log::MockLogCluster;

/// Connection string handed out by the harness endpoints.
pub const TEST_CONNECTION_STRING: &str = "mock-1:9092,mock-2:9092";

/// Test harness for integration testing.
pub struct RepositoryTestHarness {
    /// The in-memory cluster
    pub cluster: MockLogCluster,
    /// The repository under test
    pub repository: TopicRepository<MockLogCluster>,
    /// Metrics recorded by the repository
    pub metrics: Arc<RepositoryMetrics>,
    /// Test configuration
    pub config: RepositoryConfig,
}

impl RepositoryTestHarness {
    /// Create a new test harness with default configuration.
    #[must_use]
    pub fn new() -> Self {
        TestHarnessBuilder::new().build()
    }

    /// Create a topic with `partitions` empty partitions.
    pub fn with_topic(self, topic: &str, partitions: usize) -> Self {
        self.cluster.create_topic(topic, partitions);
        self
    }

    /// One item per caller partition, with payloads `event-<n>`.
    #[must_use]
    pub fn batch(partitions: &[&str]) -> Vec<BatchItem> {
        partitions
            .iter()
            .enumerate()
            .map(|(n, partition)| BatchItem::new(format!("event-{n}")).with_partition(*partition))
            .collect()
    }
}

impl Default for RepositoryTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test harness with specific configuration.
pub struct TestHarnessBuilder {
    send_timeout_ms: u64,
    request_timeout_ms: u64,
    producer_pool_size: usize,
    default_partition_count: u32,
    max_partition_count: u32,
    connection_string: String,
}

impl TestHarnessBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            send_timeout_ms: 500,
            request_timeout_ms: 500,
            producer_pool_size: 2,
            default_partition_count: 8,
            max_partition_count: 64,
            connection_string: TEST_CONNECTION_STRING.to_string(),
        }
    }

    /// Set the publish budget as `send + request` milliseconds.
    #[must_use]
    pub fn publish_timeouts(mut self, send_timeout_ms: u64, request_timeout_ms: u64) -> Self {
        self.send_timeout_ms = send_timeout_ms;
        self.request_timeout_ms = request_timeout_ms;
        self
    }

    /// Set the number of pooled producer connections.
    #[must_use]
    pub fn producer_pool_size(mut self, size: usize) -> Self {
        self.producer_pool_size = size;
        self
    }

    /// Set the default and maximum partition counts of new topics.
    #[must_use]
    pub fn partition_counts(mut self, default_count: u32, max_count: u32) -> Self {
        self.default_partition_count = default_count;
        self.max_partition_count = max_count;
        self
    }

    /// Set the connection string returned by the admin endpoints.
    #[must_use]
    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = connection_string.into();
        self
    }

    /// Build the test harness.
    #[must_use]
    pub fn build(self) -> RepositoryTestHarness {
        let mut config = RepositoryConfig::with_bootstrap_servers(vec!["mock-1:9092".to_string()]);
        config.kafka.request_timeout_ms = self.request_timeout_ms;
        config.publish.send_timeout_ms = self.send_timeout_ms;
        config.publish.producer_pool_size = self.producer_pool_size;
        config.topics.default_partition_count = self.default_partition_count;
        config.topics.max_partition_count = self.max_partition_count;

        let cluster = MockLogCluster::new();
        let metrics = Arc::new(RepositoryMetrics::new());
        let repository = TopicRepository::new(
            Arc::new(cluster.clone()),
            Arc::new(StaticEndpoints::new(self.connection_string)),
            &config,
        )
        .with_metrics(Arc::clone(&metrics));

        RepositoryTestHarness {
            cluster,
            repository,
            metrics,
            config,
        }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_creation() {
        let harness = RepositoryTestHarness::new();
        assert_eq!(harness.config.publish.producer_pool_size, 2);
        assert_eq!(harness.repository.planner().max_count(), 64);
    }

    #[test]
    fn test_harness_builder() {
        let harness = TestHarnessBuilder::new()
            .publish_timeouts(10, 20)
            .partition_counts(2, 8)
            .build();

        assert_eq!(harness.config.publish.send_timeout_ms, 10);
        assert_eq!(harness.config.kafka.request_timeout_ms, 20);
        assert_eq!(harness.repository.planner().max_count(), 8);
    }

    #[tokio::test]
    async fn test_harness_with_topic() {
        let harness = RepositoryTestHarness::new().with_topic("orders", 3);
        let names = harness.repository.list_partition_names("orders").await.unwrap();
        assert_eq!(names, vec!["0", "1", "2"]);
    }
}
