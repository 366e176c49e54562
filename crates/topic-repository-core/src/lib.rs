//! Topic Repository Core Library
//!
//! A topic and cursor repository over a partitioned, append-only log. It
//! creates and deletes topics, publishes batches of events with per-item
//! outcomes, reads partition offset ranges, and validates consumer cursors
//! against what the log still retains.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`cursor`] - Cursor and offset translation between caller and log space
//! - [`capacity`] - Partition count planning from capacity hints
//! - [`log`] - Log client traits and the Kafka wire backend
//! - [`pool`] - Pooled publish connections and scoped read/admin sessions
//! - [`publish`] - Batch publish pipeline with a shared deadline
//! - [`reader`] - Partition offset ranges and read positions
//! - [`validator`] - Read and commit cursor validation
//! - [`repository`] - The [`TopicRepository`] facade
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use topic_repository_core::config::RepositoryConfig;
//! use topic_repository_core::log::kafka::KafkaLogClient;
//! use topic_repository_core::log::StaticEndpoints;
//! use topic_repository_core::TopicRepository;
//!
//! let config = RepositoryConfig::from_file("config.yaml")?;
//! let client = Arc::new(KafkaLogClient::from_config(&config));
//! let endpoints = Arc::new(StaticEndpoints::new(config.kafka.connection_string()));
//! let repository = TopicRepository::new(client, endpoints, &config);
//!
//! let partitions = repository.list_partitions("orders").await?;
//! ```

#![forbid(unsafe_code)]

pub mod capacity;
pub mod config;
pub mod cursor;
pub mod error;
pub mod log;
pub mod metrics;
pub mod pool;
pub mod publish;
pub mod reader;
pub mod repository;
pub mod validator;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use capacity::{CapacityHint, PartitionLoadTable, PartitionPlanner};
pub use config::RepositoryConfig;
pub use cursor::{Cursor, Offset, PhysicalCursor, BEFORE_OLDEST_OFFSET};
pub use error::{
    ConfigError, CursorErrorKind, FormatError, LogError, RepositoryError, Result,
};
pub use log::kafka::KafkaLogClient;
pub use publish::{BatchItem, PublishStatus, PublishStep};
pub use reader::{InitialPosition, Partition};
pub use repository::{TopicRepository, TopicSpec};
