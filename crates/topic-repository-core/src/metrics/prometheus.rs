//! Prometheus metrics for the topic repository.
//!
//! Provides counters, histograms, and gauges for monitoring publish health
//! and cursor validation.

use prometheus::{
    Counter, CounterVec, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Repository metrics collection.
pub struct RepositoryMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Publish calls.
    pub publish_batches: IntCounter,

    /// Events submitted through publish calls.
    pub publish_items: Counter,

    /// Failed items by reason.
    pub publish_failures: CounterVec,

    /// Publish call latency in seconds.
    pub publish_duration_seconds: Histogram,

    /// Producer connections terminated after a timeout.
    pub producers_terminated: IntCounter,

    /// Producer connections currently taken from the pool.
    pub producers_in_use: IntGauge,

    /// Rejected cursors by kind.
    pub cursor_rejections: CounterVec,
}

impl RepositoryMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let publish_batches = IntCounter::new(
            "topic_repository_publish_batches_total",
            "Total number of publish calls",
        )
        .expect("metric creation should succeed");

        let publish_items = Counter::new(
            "topic_repository_publish_items_total",
            "Total number of events submitted for publishing",
        )
        .expect("metric creation should succeed");

        let publish_failures = CounterVec::new(
            Opts::new(
                "topic_repository_publish_failures_total",
                "Total number of events that failed to publish by reason",
            ),
            &["reason"],
        )
        .expect("metric creation should succeed");

        let publish_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "topic_repository_publish_duration_seconds",
                "Publish call latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
        )
        .expect("metric creation should succeed");

        let producers_terminated = IntCounter::new(
            "topic_repository_producers_terminated_total",
            "Total number of producer connections terminated after a timeout",
        )
        .expect("metric creation should succeed");

        let producers_in_use = IntGauge::new(
            "topic_repository_producers_in_use",
            "Current number of producer connections taken from the pool",
        )
        .expect("metric creation should succeed");

        let cursor_rejections = CounterVec::new(
            Opts::new(
                "topic_repository_cursor_rejections_total",
                "Total number of rejected cursors by error kind",
            ),
            &["kind"],
        )
        .expect("metric creation should succeed");

        // Register all metrics
        registry
            .register(Box::new(publish_batches.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(publish_items.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(publish_failures.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(publish_duration_seconds.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(producers_terminated.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(producers_in_use.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(cursor_rejections.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            publish_batches,
            publish_items,
            publish_failures,
            publish_duration_seconds,
            producers_terminated,
            producers_in_use,
            cursor_rejections,
        }
    }

    /// Record a publish call of `items` events.
    pub fn record_batch(&self, items: usize) {
        self.publish_batches.inc();
        self.publish_items.inc_by(items as f64);
    }

    /// Record a failed item.
    pub fn record_failure(&self, reason: &str) {
        self.publish_failures.with_label_values(&[reason]).inc();
    }

    /// Record publish call duration.
    pub fn record_duration(&self, duration_seconds: f64) {
        self.publish_duration_seconds.observe(duration_seconds);
    }

    /// Record a terminated producer connection.
    pub fn record_termination(&self) {
        self.producers_terminated.inc();
    }

    /// Set the number of producer connections in use.
    pub fn set_producers_in_use(&self, count: usize) {
        self.producers_in_use
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Record a rejected cursor.
    pub fn record_cursor_rejection(&self, kind: &str) {
        self.cursor_rejections.with_label_values(&[kind]).inc();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for RepositoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = RepositoryMetrics::new();
        assert!(metrics.encode().is_ok());
    }

    #[test]
    fn test_record_batch() {
        let metrics = RepositoryMetrics::new();
        metrics.record_batch(3);
        metrics.record_batch(2);

        assert_eq!(metrics.publish_batches.get(), 2);
        assert!((metrics.publish_items.get() - 5.0).abs() < f64::EPSILON);
        let output = metrics.encode().unwrap();
        assert!(output.contains("topic_repository_publish_batches_total"));
    }

    #[test]
    fn test_record_failure() {
        let metrics = RepositoryMetrics::new();
        metrics.record_failure("timed_out");

        let output = metrics.encode().unwrap();
        assert!(output.contains("topic_repository_publish_failures_total"));
        assert!(output.contains("timed_out"));
    }

    #[test]
    fn test_producer_gauges() {
        let metrics = RepositoryMetrics::new();
        metrics.set_producers_in_use(3);
        metrics.record_termination();

        assert_eq!(metrics.producers_in_use.get(), 3);
        assert_eq!(metrics.producers_terminated.get(), 1);
    }

    #[test]
    fn test_cursor_rejections() {
        let metrics = RepositoryMetrics::new();
        metrics.record_cursor_rejection("unavailable");
        metrics.record_duration(0.002);

        let output = metrics.encode().unwrap();
        assert!(output.contains("topic_repository_cursor_rejections_total"));
        assert!(output.contains("topic_repository_publish_duration_seconds"));
    }
}
