//! Metrics collection for the topic repository.
//!
//! Provides Prometheus-compatible metrics for monitoring publish throughput,
//! failures, latency, and producer connection churn.

pub mod prometheus;

pub use prometheus::RepositoryMetrics;
