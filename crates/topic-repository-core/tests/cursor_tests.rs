//! Integration tests for cursor validation and translation.
//!
//! Cursors are validated against the live partition layout of a topic, and
//! read start positions are derived from the same snapshot.

use std::cmp::Ordering;

use topic_repository_core::testing::RepositoryTestHarness;
use topic_repository_core::{Cursor, CursorErrorKind, PhysicalCursor, RepositoryError};

/// Topic `orders` with three partitions:
/// - 0 retains offsets 0..=99
/// - 1 is empty
/// - 2 retains offsets 40..=59
fn harness() -> RepositoryTestHarness {
    let harness = RepositoryTestHarness::new().with_topic("orders", 3);
    harness.cluster.set_offsets("orders", 0, 0, 100);
    harness.cluster.set_offsets("orders", 2, 40, 60);
    harness
}

fn kind(result: Result<(), RepositoryError>) -> Option<CursorErrorKind> {
    result.err().and_then(|e| e.cursor_kind())
}

#[tokio::test]
async fn test_valid_cursors_accepted() {
    let harness = harness();
    let cursors = vec![
        Cursor::new("0", "0"),
        Cursor::new("0", "99"),
        Cursor::new("2", "39"),
        Cursor::new("2", "59"),
        Cursor::before_oldest("1"),
    ];

    harness
        .repository
        .validate_cursors("orders", &cursors)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cursor_outside_retained_range() {
    let harness = harness();

    for offset in ["38", "60"] {
        let result = harness
            .repository
            .validate_cursors("orders", &[Cursor::new("2", offset)])
            .await;
        assert_eq!(
            kind(result),
            Some(CursorErrorKind::Unavailable),
            "offset {offset} should be unavailable"
        );
    }
}

#[tokio::test]
async fn test_cursor_on_empty_partition() {
    let harness = harness();

    let result = harness
        .repository
        .validate_cursors("orders", &[Cursor::new("1", "0")])
        .await;
    assert_eq!(kind(result), Some(CursorErrorKind::EmptyPartition));
}

#[tokio::test]
async fn test_cursor_rejection_order() {
    let harness = harness();
    let cases = vec![
        (
            Cursor {
                partition: None,
                offset: Some("1".to_string()),
            },
            CursorErrorKind::NullPartition,
        ),
        (
            Cursor {
                partition: Some("0".to_string()),
                offset: None,
            },
            CursorErrorKind::NullOffset,
        ),
        (Cursor::new("7", "1"), CursorErrorKind::PartitionNotFound),
        (Cursor::new("0", "abc"), CursorErrorKind::InvalidFormat),
        (Cursor::new("0", "007"), CursorErrorKind::InvalidFormat),
    ];

    for (cursor, expected) in cases {
        let result = harness
            .repository
            .validate_cursors("orders", std::slice::from_ref(&cursor))
            .await;
        assert_eq!(kind(result), Some(expected), "cursor {cursor}");
    }
}

#[tokio::test]
async fn test_first_invalid_cursor_is_reported() {
    let harness = harness();
    let cursors = vec![
        Cursor::new("0", "5"),
        Cursor::new("9", "5"),
        Cursor::new("1", "5"),
    ];

    let err = harness
        .repository
        .validate_cursors("orders", &cursors)
        .await
        .unwrap_err();
    match err {
        RepositoryError::InvalidCursor { kind, cursor } => {
            assert_eq!(kind, CursorErrorKind::PartitionNotFound);
            assert_eq!(cursor.partition(), Some("9"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_rejections_are_counted() {
    let harness = harness();
    let _ = harness
        .repository
        .validate_cursors("orders", &[Cursor::new("1", "3")])
        .await;

    let output = harness.metrics.encode().unwrap();
    assert!(output.contains("topic_repository_cursor_rejections_total"));
    assert!(output.contains("kind=\"empty_partition\""));
}

#[tokio::test]
async fn test_commit_cursors_are_not_range_checked() {
    let harness = harness();

    harness
        .repository
        .validate_commit_cursors("orders", &[Cursor::new("1", "123456"), Cursor::new("2", "0")])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_commit_cursor_rejections() {
    let harness = harness();

    let missing = harness
        .repository
        .validate_commit_cursors("orders", &[Cursor::new("3", "1")])
        .await;
    assert_eq!(kind(missing), Some(CursorErrorKind::PartitionNotFound));

    let sentinel = harness
        .repository
        .validate_commit_cursors("orders", &[Cursor::before_oldest("0")])
        .await;
    assert_eq!(kind(sentinel), Some(CursorErrorKind::InvalidFormat));

    let negative = harness
        .repository
        .validate_commit_cursors("orders", &[Cursor::new("0", "-1")])
        .await;
    assert_eq!(kind(negative), Some(CursorErrorKind::InvalidFormat));
}

#[tokio::test]
async fn test_validation_against_unreachable_cluster() {
    let harness = harness();
    harness.cluster.set_unavailable(true);

    let err = harness
        .repository
        .validate_cursors("orders", &[Cursor::new("0", "1")])
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::ServiceUnavailable { .. }));
    assert_eq!(err.cursor_kind(), None);
}

#[tokio::test]
async fn test_read_start_positions() {
    let harness = harness();
    let cursors = vec![
        Cursor::new("0", "10"),
        Cursor::before_oldest("2"),
        Cursor::before_oldest("1"),
        Cursor::new("2", "39"),
    ];

    let positions = harness
        .repository
        .read_start_positions("orders", &cursors)
        .await
        .unwrap();
    assert_eq!(
        positions,
        vec![
            PhysicalCursor {
                partition: 0,
                offset: 11
            },
            PhysicalCursor {
                partition: 2,
                offset: 40
            },
            PhysicalCursor {
                partition: 1,
                offset: 0
            },
            PhysicalCursor {
                partition: 2,
                offset: 40
            },
        ]
    );
}

#[tokio::test]
async fn test_read_start_positions_rejects_invalid_cursor() {
    let harness = harness();

    let err = harness
        .repository
        .read_start_positions("orders", &[Cursor::new("0", "100")])
        .await
        .unwrap_err();
    assert_eq!(err.cursor_kind(), Some(CursorErrorKind::Unavailable));
}

#[test]
fn test_compare_offsets() {
    let harness = RepositoryTestHarness::new();
    let repository = &harness.repository;

    assert_eq!(repository.compare_offsets("9", "10").unwrap(), Ordering::Less);
    assert_eq!(repository.compare_offsets("10", "10").unwrap(), Ordering::Equal);
    assert_eq!(
        repository
            .compare_offsets("9223372036854775807", "0")
            .unwrap(),
        Ordering::Greater
    );

    assert!(matches!(
        repository.compare_offsets("BEGIN", "0"),
        Err(RepositoryError::Format(_))
    ));
    assert!(matches!(
        repository.compare_offsets("1", "x"),
        Err(RepositoryError::Format(_))
    ));
}
