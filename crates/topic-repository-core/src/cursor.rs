//! Coordinate translation between caller cursors and physical log coordinates.
//!
//! Callers address events by `{partition, offset}` strings. The log addresses
//! them by a zero-based `i32` partition index and a monotonically increasing
//! `i64` offset. Offsets are modelled as [`Offset`] internally; strings only
//! exist at the boundary.
//!
//! # Offset Layout
//!
//! The log reports the *next* offset to be written as the end of a partition.
//! Callers see the offset of the last written record instead:
//! - physical end `0` (nothing written) → [`BEFORE_OLDEST_OFFSET`]
//! - physical end `N > 0` → caller offset `N - 1`
//!
//! A caller cursor at offset `n` resumes reading at physical offset `n + 1`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FormatError;

/// Caller-visible offset meaning "before the oldest retained record".
pub const BEFORE_OLDEST_OFFSET: &str = "BEGIN";

/// A caller cursor. Both fields may be null at the boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub partition: Option<String>,
    pub offset: Option<String>,
}

impl Cursor {
    /// Create a cursor with both fields present.
    pub fn new(partition: impl Into<String>, offset: impl Into<String>) -> Self {
        Self {
            partition: Some(partition.into()),
            offset: Some(offset.into()),
        }
    }

    /// Cursor positioned before the oldest retained record of `partition`.
    pub fn before_oldest(partition: impl Into<String>) -> Self {
        Self::new(partition, BEFORE_OLDEST_OFFSET)
    }

    #[must_use]
    pub fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }

    #[must_use]
    pub fn offset(&self) -> Option<&str> {
        self.offset.as_deref()
    }

    /// Whether the offset is the before-oldest sentinel.
    #[must_use]
    pub fn is_before_oldest(&self) -> bool {
        self.offset() == Some(BEFORE_OLDEST_OFFSET)
    }

    /// Translate to physical coordinates.
    ///
    /// # Errors
    ///
    /// Fails on null fields, malformed numbers and the sentinel offset.
    pub fn to_physical(&self) -> Result<PhysicalCursor, FormatError> {
        let partition = self.partition().ok_or(FormatError::MissingField("partition"))?;
        let offset = self.offset().ok_or(FormatError::MissingField("offset"))?;
        Ok(PhysicalCursor {
            partition: to_physical_partition(partition)?,
            offset: to_physical_offset(offset)?,
        })
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{partition: {}, offset: {}}}",
            self.partition().unwrap_or("null"),
            self.offset().unwrap_or("null")
        )
    }
}

/// Physical coordinates derived from a [`Cursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalCursor {
    /// Zero-based partition index.
    pub partition: i32,
    /// Physical log offset.
    pub offset: i64,
}

/// An offset in caller space.
///
/// `BeforeOldest` orders before every numeric offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Offset {
    BeforeOldest,
    At(i64),
}

impl Offset {
    /// Caller offset of the newest record given the physical end offset.
    #[must_use]
    pub fn from_newest(physical_end: i64) -> Self {
        if physical_end == 0 {
            Self::BeforeOldest
        } else {
            Self::At(physical_end - 1)
        }
    }

    /// Physical offset to start reading from after this offset.
    ///
    /// `oldest` is the partition's current oldest physical offset.
    #[must_use]
    pub fn read_start(&self, oldest: i64) -> i64 {
        match self {
            Self::BeforeOldest => oldest,
            Self::At(offset) => offset + 1,
        }
    }

    #[must_use]
    pub fn is_before_oldest(&self) -> bool {
        matches!(self, Self::BeforeOldest)
    }
}

impl FromStr for Offset {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == BEFORE_OLDEST_OFFSET {
            return Ok(Self::BeforeOldest);
        }
        parse_canonical::<i64>(s)
            .map(Self::At)
            .ok_or_else(|| FormatError::InvalidOffset(s.to_string()))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeOldest => f.write_str(BEFORE_OLDEST_OFFSET),
            Self::At(offset) => write!(f, "{offset}"),
        }
    }
}

impl From<Offset> for String {
    fn from(offset: Offset) -> Self {
        offset.to_string()
    }
}

impl TryFrom<String> for Offset {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Parse a caller partition id.
///
/// # Errors
///
/// Returns [`FormatError::InvalidPartition`] unless `s` is a canonical
/// non-negative decimal `i32`.
pub fn to_physical_partition(s: &str) -> Result<i32, FormatError> {
    parse_canonical::<i32>(s).ok_or_else(|| FormatError::InvalidPartition(s.to_string()))
}

/// Render a physical partition index as a caller partition id.
#[must_use]
pub fn to_caller_partition(partition: i32) -> String {
    partition.to_string()
}

/// Parse a caller offset into physical space.
///
/// # Errors
///
/// The sentinel is rejected with [`FormatError::UnexpectedSentinel`]; it is only
/// meaningful when computing a read start (see [`Offset::read_start`]).
pub fn to_physical_offset(s: &str) -> Result<i64, FormatError> {
    match s.parse::<Offset>()? {
        Offset::At(offset) => Ok(offset),
        Offset::BeforeOldest => Err(FormatError::UnexpectedSentinel),
    }
}

/// Render a physical offset as a caller offset.
#[must_use]
pub fn to_caller_offset(offset: i64) -> String {
    offset.to_string()
}

/// Compare two caller offsets numerically.
///
/// # Errors
///
/// Both offsets must be numeric; the sentinel is rejected.
pub fn compare_offsets(first: &str, second: &str) -> Result<Ordering, FormatError> {
    let first = to_physical_offset(first)?;
    let second = to_physical_offset(second)?;
    Ok(first.cmp(&second))
}

/// Parse digits only, no sign and no leading zeros.
fn parse_canonical<T: FromStr>(s: &str) -> Option<T> {
    let canonical = !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && (s.len() == 1 || !s.starts_with('0'));
    if canonical {
        s.parse().ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_translation() {
        assert_eq!(to_physical_partition("0").unwrap(), 0);
        assert_eq!(to_physical_partition("17").unwrap(), 17);
        assert_eq!(to_caller_partition(17), "17");
    }

    #[test]
    fn test_partition_rejects_non_canonical() {
        for bad in ["", "-1", "+1", "01", " 1", "1a", "2147483648"] {
            assert!(
                matches!(to_physical_partition(bad), Err(FormatError::InvalidPartition(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_offset_translation() {
        assert_eq!(to_physical_offset("0").unwrap(), 0);
        assert_eq!(to_physical_offset("9223372036854775807").unwrap(), i64::MAX);
        assert_eq!(to_caller_offset(42), "42");
        assert!(matches!(
            to_physical_offset(BEFORE_OLDEST_OFFSET),
            Err(FormatError::UnexpectedSentinel)
        ));
        assert!(matches!(
            to_physical_offset("007"),
            Err(FormatError::InvalidOffset(_))
        ));
    }

    #[test]
    fn test_caller_offset_is_stable() {
        for n in [0_i64, 1, 99, 1 << 40, i64::MAX] {
            let caller = to_caller_offset(n);
            let again = to_caller_offset(to_physical_offset(&caller).unwrap());
            assert_eq!(again, caller);
        }
    }

    #[test]
    fn test_newest_offset_sentinel() {
        assert_eq!(Offset::from_newest(0), Offset::BeforeOldest);
        assert_eq!(Offset::from_newest(0).to_string(), BEFORE_OLDEST_OFFSET);
        assert_eq!(Offset::from_newest(1).to_string(), "0");
        assert_eq!(Offset::from_newest(101), Offset::At(100));
    }

    #[test]
    fn test_read_start() {
        assert_eq!(Offset::BeforeOldest.read_start(5), 5);
        assert_eq!(Offset::At(9).read_start(5), 10);
    }

    #[test]
    fn test_offset_ordering() {
        assert!(Offset::BeforeOldest < Offset::At(0));
        assert!(Offset::At(1) < Offset::At(2));
    }

    #[test]
    fn test_compare_offsets() {
        assert_eq!(compare_offsets("10", "9").unwrap(), Ordering::Greater);
        assert_eq!(compare_offsets("9", "10").unwrap(), Ordering::Less);
        assert_eq!(compare_offsets("3", "3").unwrap(), Ordering::Equal);
        assert!(compare_offsets("abc", "1").is_err());
        assert!(compare_offsets("1", BEFORE_OLDEST_OFFSET).is_err());
    }

    #[test]
    fn test_cursor_to_physical() {
        let physical = Cursor::new("3", "41").to_physical().unwrap();
        assert_eq!(
            physical,
            PhysicalCursor {
                partition: 3,
                offset: 41
            }
        );

        let missing = Cursor {
            partition: Some("3".to_string()),
            offset: None,
        };
        assert_eq!(
            missing.to_physical(),
            Err(FormatError::MissingField("offset"))
        );
    }

    #[test]
    fn test_offset_serde() {
        let yaml = serde_yaml::to_string(&Offset::BeforeOldest).unwrap();
        assert!(yaml.contains(BEFORE_OLDEST_OFFSET));
        let parsed: Offset = serde_yaml::from_str("'12'").unwrap();
        assert_eq!(parsed, Offset::At(12));
        assert!(serde_yaml::from_str::<Offset>("'x'").is_err());
    }

    #[test]
    fn test_cursor_display() {
        let cursor = Cursor {
            partition: None,
            offset: Some("1".to_string()),
        };
        assert_eq!(cursor.to_string(), "{partition: null, offset: 1}");
    }
}
