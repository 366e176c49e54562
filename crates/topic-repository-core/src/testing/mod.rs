//! Test utilities for the topic repository.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`MockLogCluster`] - An in-memory log with fault injection
//! - [`MockBroker`] - A single-node Kafka broker for the wire backend
//! - [`RepositoryTestHarness`] - A repository wired to a mock cluster
//! - [`TestHarnessBuilder`] - Builder pattern for custom test configurations
//!
//! # Example
//!
//! ```rust,ignore
//! use topic_repository_core::testing::RepositoryTestHarness;
//!
//! #[tokio::test]
//! async fn test_publish() {
//!     let harness = RepositoryTestHarness::new().with_topic("orders", 2);
//!     let mut batch = RepositoryTestHarness::batch(&["0", "1"]);
//!
//!     harness.repository.publish("orders", &mut batch).await.unwrap();
//!     assert_eq!(harness.cluster.producers_opened(), 1);
//! }
//! ```

pub mod harness;
pub mod mock_broker;
pub mod mock_log;

pub use harness::{RepositoryTestHarness, TestHarnessBuilder, TEST_CONNECTION_STRING};
pub use mock_broker::{api_keys, BrokerCall, MockBroker, MOCK_BROKER_ID};
pub use mock_log::{MockAdmin, MockConsumer, MockLogCluster, MockProducer, DEFAULT_LEADER};
