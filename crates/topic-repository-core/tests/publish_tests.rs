//! Integration tests for batch publishing.
//!
//! Covers per-item outcomes, the shared acknowledgment budget and what
//! happens to the pooled connection after each kind of failure.

use std::time::Duration;

use topic_repository_core::testing::{RepositoryTestHarness, TestHarnessBuilder};
use topic_repository_core::{BatchItem, PublishStatus, PublishStep, RepositoryError};

fn statuses(items: &[BatchItem]) -> Vec<PublishStatus> {
    items.iter().map(BatchItem::status).collect()
}

#[tokio::test]
async fn test_publish_batch() {
    let harness = RepositoryTestHarness::new().with_topic("orders", 2);
    let mut batch = RepositoryTestHarness::batch(&["0", "1", "0"]);

    harness.repository.publish("orders", &mut batch).await.unwrap();

    for item in &batch {
        assert_eq!(item.status(), PublishStatus::Submitted);
        assert_eq!(item.step(), PublishStep::Publishing);
        assert_eq!(item.topic(), Some("orders"));
        assert_eq!(item.detail(), "");
    }
    assert_eq!(
        harness.cluster.records("orders", 0),
        vec!["event-0".as_bytes(), "event-2".as_bytes()]
    );
    assert_eq!(harness.cluster.records("orders", 1), vec!["event-1".as_bytes()]);
}

#[tokio::test]
async fn test_items_are_stamped_with_leaders() {
    let harness = RepositoryTestHarness::new();
    harness
        .cluster
        .create_topic_with_leaders("orders", &[Some(4), Some(7), None]);
    let mut batch = RepositoryTestHarness::batch(&["1", "0", "2"]);

    harness.repository.publish("orders", &mut batch).await.unwrap();

    let brokers: Vec<Option<i32>> = batch.iter().map(BatchItem::broker).collect();
    assert_eq!(brokers, vec![Some(7), Some(4), None]);
}

#[tokio::test]
async fn test_producer_connection_is_reused() {
    let harness = RepositoryTestHarness::new().with_topic("orders", 1);

    for _ in 0..3 {
        let mut batch = RepositoryTestHarness::batch(&["0"]);
        harness.repository.publish("orders", &mut batch).await.unwrap();
    }

    assert_eq!(harness.cluster.producers_opened(), 1);
    assert_eq!(harness.repository.pool().idle_count(), 1);
    assert_eq!(harness.repository.pool().in_use(), 0);
}

#[tokio::test]
async fn test_stalled_acknowledgment_terminates_connection() {
    let harness = TestHarnessBuilder::new()
        .publish_timeouts(50, 50)
        .build()
        .with_topic("orders", 3);
    harness.cluster.stall_partition("orders", 1);
    let mut batch = RepositoryTestHarness::batch(&["0", "1", "2"]);

    let err = harness
        .repository
        .publish("orders", &mut batch)
        .await
        .unwrap_err();

    match err {
        RepositoryError::Publish {
            topic,
            failed,
            total,
        } => {
            assert_eq!(topic, "orders");
            assert_eq!(failed, 1);
            assert_eq!(total, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        statuses(&batch),
        vec![
            PublishStatus::Submitted,
            PublishStatus::Failed,
            PublishStatus::Aborted
        ]
    );
    assert_eq!(batch[1].detail(), "timed out");

    assert_eq!(harness.cluster.producers_closed(), 1);
    assert_eq!(harness.repository.pool().terminated_count(), 1);
    assert_eq!(harness.repository.pool().idle_count(), 0);
    assert_eq!(harness.repository.pool().in_use(), 0);
}

#[tokio::test]
async fn test_timeout_error_from_log_is_treated_like_a_stall() {
    let harness = RepositoryTestHarness::new().with_topic("orders", 2);
    harness.cluster.timeout_partition("orders", 0);
    let mut batch = RepositoryTestHarness::batch(&["0", "1"]);

    let err = harness
        .repository
        .publish("orders", &mut batch)
        .await
        .unwrap_err();

    assert!(matches!(err, RepositoryError::Publish { failed: 1, .. }));
    assert_eq!(
        statuses(&batch),
        vec![PublishStatus::Failed, PublishStatus::Aborted]
    );
    assert_eq!(batch[0].detail(), "timed out");
    assert_eq!(harness.repository.pool().terminated_count(), 1);
}

#[tokio::test]
async fn test_slow_acknowledgment_exceeds_budget() {
    let harness = TestHarnessBuilder::new()
        .publish_timeouts(20, 30)
        .build()
        .with_topic("orders", 1);
    harness
        .cluster
        .delay_partition("orders", 0, Duration::from_millis(500));
    let mut batch = RepositoryTestHarness::batch(&["0"]);

    let result = harness.repository.publish("orders", &mut batch).await;

    assert!(result.is_err());
    assert_eq!(batch[0].status(), PublishStatus::Failed);
    assert_eq!(batch[0].detail(), "timed out");
}

#[tokio::test]
async fn test_slow_acknowledgment_within_budget() {
    let harness = RepositoryTestHarness::new().with_topic("orders", 2);
    harness
        .cluster
        .delay_partition("orders", 1, Duration::from_millis(20));
    let mut batch = RepositoryTestHarness::batch(&["1", "0", "1"]);

    harness.repository.publish("orders", &mut batch).await.unwrap();

    assert!(batch.iter().all(|i| i.status() == PublishStatus::Submitted));
    assert_eq!(harness.repository.pool().terminated_count(), 0);
}

#[tokio::test]
async fn test_send_failure_fails_only_its_item() {
    let harness = RepositoryTestHarness::new().with_topic("orders", 3);
    harness
        .cluster
        .fail_partition("orders", 1, "not leader for partition");
    let mut batch = RepositoryTestHarness::batch(&["0", "1", "2"]);

    let err = harness
        .repository
        .publish("orders", &mut batch)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RepositoryError::Publish {
            failed: 1,
            total: 3,
            ..
        }
    ));
    assert_eq!(
        statuses(&batch),
        vec![
            PublishStatus::Submitted,
            PublishStatus::Failed,
            PublishStatus::Submitted
        ]
    );
    assert!(batch[1].detail().contains("not leader for partition"));

    // the connection is healthy and goes back to the pool
    assert_eq!(harness.repository.pool().terminated_count(), 0);
    assert_eq!(harness.repository.pool().idle_count(), 1);
    assert_eq!(harness.cluster.producers_closed(), 0);
}

#[tokio::test]
async fn test_item_without_partition() {
    let harness = RepositoryTestHarness::new().with_topic("orders", 2);
    let mut batch = vec![
        BatchItem::new("a").with_partition("0"),
        BatchItem::new("b"),
    ];

    let err = harness
        .repository
        .publish("orders", &mut batch)
        .await
        .unwrap_err();

    assert!(matches!(err, RepositoryError::MissingPartition { index: 1 }));
    assert!(harness.cluster.records("orders", 0).is_empty());
    assert_eq!(harness.repository.pool().in_use(), 0);
    assert_eq!(harness.repository.pool().idle_count(), 1);
}

#[tokio::test]
async fn test_item_with_malformed_partition() {
    let harness = RepositoryTestHarness::new().with_topic("orders", 2);
    let mut batch = RepositoryTestHarness::batch(&["0", "one"]);

    let err = harness
        .repository
        .publish("orders", &mut batch)
        .await
        .unwrap_err();

    assert!(matches!(err, RepositoryError::Format(_)));
    assert!(harness.cluster.records("orders", 0).is_empty());
}

#[tokio::test]
async fn test_publish_to_unknown_topic() {
    let harness = RepositoryTestHarness::new();
    let mut batch = RepositoryTestHarness::batch(&["0"]);

    let err = harness
        .repository
        .publish("missing", &mut batch)
        .await
        .unwrap_err();

    assert!(matches!(err, RepositoryError::ServiceUnavailable { .. }));
    assert_eq!(batch[0].status(), PublishStatus::Aborted);
}

#[tokio::test]
async fn test_publish_when_cluster_unreachable() {
    let harness = RepositoryTestHarness::new().with_topic("orders", 1);
    harness.cluster.set_unavailable(true);
    let mut batch = RepositoryTestHarness::batch(&["0"]);

    let err = harness
        .repository
        .publish("orders", &mut batch)
        .await
        .unwrap_err();

    assert!(matches!(err, RepositoryError::ServiceUnavailable { .. }));
    assert_eq!(harness.repository.pool().in_use(), 0);
    assert_eq!(harness.repository.pool().opened_count(), 0);
}

#[tokio::test]
async fn test_broken_connection_is_replaced() {
    let harness = RepositoryTestHarness::new().with_topic("orders", 1);
    let mut batch = RepositoryTestHarness::batch(&["0"]);
    harness.repository.publish("orders", &mut batch).await.unwrap();

    harness.cluster.close_all_producers();

    let mut batch = RepositoryTestHarness::batch(&["0"]);
    harness.repository.publish("orders", &mut batch).await.unwrap();

    assert_eq!(harness.cluster.producers_opened(), 2);
    assert_eq!(harness.repository.pool().discarded_count(), 1);
}

#[tokio::test]
async fn test_concurrent_publishes_share_the_pool() {
    let harness = TestHarnessBuilder::new()
        .producer_pool_size(2)
        .build()
        .with_topic("orders", 4);

    let publishes = (0..6).map(|n| {
        let repository = &harness.repository;
        async move {
            let partition = (n % 4).to_string();
            let mut batch = RepositoryTestHarness::batch(&[partition.as_str()]);
            repository.publish("orders", &mut batch).await
        }
    });
    for result in futures::future::join_all(publishes).await {
        result.unwrap();
    }

    assert!(harness.cluster.producers_opened() <= 2);
    assert_eq!(harness.repository.pool().in_use(), 0);
}

#[tokio::test]
async fn test_publish_metrics() {
    let harness = TestHarnessBuilder::new()
        .publish_timeouts(30, 30)
        .build()
        .with_topic("orders", 2);
    harness.cluster.fail_partition("orders", 0, "broken");
    harness.cluster.stall_partition("orders", 1);
    let mut batch = RepositoryTestHarness::batch(&["0", "1"]);

    let _ = harness.repository.publish("orders", &mut batch).await;

    let output = harness.metrics.encode().unwrap();
    assert!(output.contains("topic_repository_publish_batches_total 1"));
    assert!(output.contains("topic_repository_publish_items_total 2"));
    assert!(output.contains("reason=\"send_error\""));
    assert!(output.contains("reason=\"timed_out\""));
    assert!(output.contains("topic_repository_producers_terminated_total 1"));
}

#[tokio::test]
async fn test_budget_is_shared_across_waits() {
    // 100ms budget; each acknowledgment takes 40ms once awaited, so the third wait runs out
    let harness = TestHarnessBuilder::new()
        .publish_timeouts(50, 50)
        .build()
        .with_topic("orders", 1);
    harness
        .cluster
        .delay_partition("orders", 0, Duration::from_millis(40));
    let mut batch = RepositoryTestHarness::batch(&["0", "0", "0"]);

    let err = harness
        .repository
        .publish("orders", &mut batch)
        .await
        .unwrap_err();

    assert!(matches!(err, RepositoryError::Publish { failed: 1, total: 3, .. }));
    assert_eq!(
        statuses(&batch),
        vec![
            PublishStatus::Submitted,
            PublishStatus::Submitted,
            PublishStatus::Failed
        ]
    );
    assert_eq!(batch[2].detail(), "timed out");
    assert_eq!(harness.repository.pool().terminated_count(), 1);
}

#[tokio::test]
async fn test_duration_recorded_for_rejected_batch() {
    let harness = RepositoryTestHarness::new().with_topic("orders", 1);
    let mut batch = vec![BatchItem::new("no partition")];

    let err = harness
        .repository
        .publish("orders", &mut batch)
        .await
        .unwrap_err();

    assert!(matches!(err, RepositoryError::MissingPartition { index: 0 }));
    assert_eq!(harness.metrics.publish_duration_seconds.get_sample_count(), 1);
}
