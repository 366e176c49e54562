//! Cursor validation.
//!
//! Checks run in a fixed order and the first failing cursor rejects the call.

use crate::cursor::{to_physical_offset, Cursor, Offset};
use crate::error::{CursorErrorKind, RepositoryError, Result};
use crate::reader::Partition;

/// Check read cursors against the current partition layout.
///
/// A cursor must name an existing partition. The before-oldest sentinel is
/// always accepted. Any other offset requires a non-empty partition and must
/// lie within `oldest - 1 ..= newest`.
///
/// # Errors
///
/// Returns [`RepositoryError::InvalidCursor`] for the first rejected cursor.
pub fn validate_cursors(partitions: &[Partition], cursors: &[Cursor]) -> Result<()> {
    cursors
        .iter()
        .try_for_each(|cursor| validate_cursor(partitions, cursor))
}

/// Check commit cursors: the partition must exist and the offset must be
/// numeric. Offsets are not range checked.
///
/// # Errors
///
/// Returns [`RepositoryError::InvalidCursor`] for the first rejected cursor.
pub fn validate_commit_cursors(partition_names: &[String], cursors: &[Cursor]) -> Result<()> {
    for cursor in cursors {
        let (partition, offset) = present_fields(cursor)?;
        if !partition_names.iter().any(|name| name == partition) {
            return Err(reject(CursorErrorKind::PartitionNotFound, cursor));
        }
        if to_physical_offset(offset).is_err() {
            return Err(reject(CursorErrorKind::InvalidFormat, cursor));
        }
    }
    Ok(())
}

fn validate_cursor(partitions: &[Partition], cursor: &Cursor) -> Result<()> {
    let (partition, offset) = present_fields(cursor)?;

    let found = partitions
        .iter()
        .find(|p| p.partition_id == partition)
        .ok_or_else(|| reject(CursorErrorKind::PartitionNotFound, cursor))?;

    if cursor.is_before_oldest() {
        return Ok(());
    }

    let (Offset::At(oldest), Offset::At(newest)) =
        (found.oldest_available_offset, found.newest_available_offset)
    else {
        return Err(reject(CursorErrorKind::EmptyPartition, cursor));
    };

    let offset =
        to_physical_offset(offset).map_err(|_| reject(CursorErrorKind::InvalidFormat, cursor))?;
    if offset < oldest - 1 || offset > newest {
        return Err(reject(CursorErrorKind::Unavailable, cursor));
    }
    Ok(())
}

fn present_fields(cursor: &Cursor) -> Result<(&str, &str)> {
    let partition = cursor
        .partition()
        .ok_or_else(|| reject(CursorErrorKind::NullPartition, cursor))?;
    let offset = cursor
        .offset()
        .ok_or_else(|| reject(CursorErrorKind::NullOffset, cursor))?;
    Ok((partition, offset))
}

fn reject(kind: CursorErrorKind, cursor: &Cursor) -> RepositoryError {
    RepositoryError::InvalidCursor {
        kind,
        cursor: cursor.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::BEFORE_OLDEST_OFFSET;

    fn layout() -> Vec<Partition> {
        vec![
            // offsets 0..=100
            Partition::from_positions("orders", 0, 0, 101),
            // empty
            Partition::from_positions("orders", 1, 0, 0),
            // offsets 50..=60 retained
            Partition::from_positions("orders", 2, 50, 61),
        ]
    }

    fn kind_of(result: Result<()>) -> Option<CursorErrorKind> {
        result.err().and_then(|e| e.cursor_kind())
    }

    #[test]
    fn test_sentinel_always_accepted() {
        for p in ["0", "1", "2"] {
            assert!(validate_cursors(&layout(), &[Cursor::before_oldest(p)]).is_ok());
        }
    }

    #[test]
    fn test_null_fields() {
        let no_partition = Cursor {
            partition: None,
            offset: Some("1".to_string()),
        };
        let no_offset = Cursor {
            partition: Some("0".to_string()),
            offset: None,
        };
        assert_eq!(
            kind_of(validate_cursors(&layout(), &[no_partition])),
            Some(CursorErrorKind::NullPartition)
        );
        assert_eq!(
            kind_of(validate_cursors(&layout(), &[no_offset])),
            Some(CursorErrorKind::NullOffset)
        );
    }

    #[test]
    fn test_unknown_partition() {
        assert_eq!(
            kind_of(validate_cursors(&layout(), &[Cursor::new("7", "0")])),
            Some(CursorErrorKind::PartitionNotFound)
        );
        // partition ids compare as strings
        assert_eq!(
            kind_of(validate_cursors(&layout(), &[Cursor::new("00", "0")])),
            Some(CursorErrorKind::PartitionNotFound)
        );
    }

    #[test]
    fn test_empty_partition() {
        assert_eq!(
            kind_of(validate_cursors(&layout(), &[Cursor::new("1", "0")])),
            Some(CursorErrorKind::EmptyPartition)
        );
    }

    #[test]
    fn test_invalid_format() {
        assert_eq!(
            kind_of(validate_cursors(&layout(), &[Cursor::new("0", "abc")])),
            Some(CursorErrorKind::InvalidFormat)
        );
    }

    #[test]
    fn test_range() {
        let ok = [Cursor::new("0", "0"), Cursor::new("0", "100"), Cursor::new("2", "49")];
        assert!(validate_cursors(&layout(), &ok).is_ok());

        for (p, o) in [("0", "101"), ("0", "999999"), ("2", "48"), ("2", "61")] {
            assert_eq!(
                kind_of(validate_cursors(&layout(), &[Cursor::new(p, o)])),
                Some(CursorErrorKind::Unavailable),
                "cursor {p}/{o}"
            );
        }
    }

    #[test]
    fn test_first_failure_wins() {
        let cursors = [
            Cursor::new("0", "5"),
            Cursor::new("9", "5"),
            Cursor::new("0", "abc"),
        ];
        let err = validate_cursors(&layout(), &cursors).unwrap_err();
        match err {
            RepositoryError::InvalidCursor { kind, cursor } => {
                assert_eq!(kind, CursorErrorKind::PartitionNotFound);
                assert_eq!(cursor.partition(), Some("9"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_commit_cursors() {
        let names = vec!["0".to_string(), "1".to_string()];

        assert!(validate_commit_cursors(&names, &[Cursor::new("1", "123456789")]).is_ok());
        assert_eq!(
            kind_of(validate_commit_cursors(&names, &[Cursor::new("7", "1")])),
            Some(CursorErrorKind::PartitionNotFound)
        );
        assert_eq!(
            kind_of(validate_commit_cursors(&names, &[Cursor::new("0", "x1")])),
            Some(CursorErrorKind::InvalidFormat)
        );
        assert_eq!(
            kind_of(validate_commit_cursors(
                &names,
                &[Cursor::new("0", BEFORE_OLDEST_OFFSET)]
            )),
            Some(CursorErrorKind::InvalidFormat)
        );
    }
}
