//! Load-to-partitions mapping.

use crate::config::LoadTableRow;

/// Recommends a partition count for a sustained load.
pub trait LoadPartitionMapping: Send + Sync {
    /// Partition count for `throughput_mb_per_sec` of messages averaging
    /// `avg_message_size_bytes`. Always at least 1.
    fn recommended_partitions(&self, avg_message_size_bytes: u64, throughput_mb_per_sec: f64)
        -> u32;
}

/// Lookup table of per-partition throughput keyed by message size.
///
/// The row used for a load is the one with the largest message size not above
/// the average message size, or the smallest row when every row is larger.
#[derive(Debug, Clone)]
pub struct PartitionLoadTable {
    // Sorted by message size, ascending.
    rows: Vec<LoadTableRow>,
}

impl PartitionLoadTable {
    /// Build a table from configured rows. Rows need not be sorted.
    #[must_use]
    pub fn new(mut rows: Vec<LoadTableRow>) -> Self {
        rows.sort_by_key(|row| row.message_size_bytes);
        Self { rows }
    }

    /// Per-partition throughput for messages of the given size.
    #[must_use]
    pub fn partition_throughput(&self, avg_message_size_bytes: u64) -> Option<f64> {
        self.rows
            .iter()
            .rev()
            .find(|row| u64::from(row.message_size_bytes) <= avg_message_size_bytes)
            .or_else(|| self.rows.first())
            .map(|row| row.partition_throughput_mb_per_sec)
    }
}

impl LoadPartitionMapping for PartitionLoadTable {
    fn recommended_partitions(
        &self,
        avg_message_size_bytes: u64,
        throughput_mb_per_sec: f64,
    ) -> u32 {
        let Some(per_partition) = self.partition_throughput(avg_message_size_bytes) else {
            return 1;
        };
        let needed = (throughput_mb_per_sec / per_partition).ceil();
        if needed.is_finite() && needed >= 1.0 {
            // Saturating float-to-int conversion
            needed as u32
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PartitionLoadTable {
        PartitionLoadTable::new(vec![
            LoadTableRow {
                message_size_bytes: 1_024,
                partition_throughput_mb_per_sec: 10.0,
            },
            LoadTableRow {
                message_size_bytes: 100,
                partition_throughput_mb_per_sec: 2.0,
            },
        ])
    }

    #[test]
    fn test_row_selection() {
        let t = table();
        assert_eq!(t.partition_throughput(50), Some(2.0));
        assert_eq!(t.partition_throughput(100), Some(2.0));
        assert_eq!(t.partition_throughput(1_023), Some(2.0));
        assert_eq!(t.partition_throughput(1_024), Some(10.0));
        assert_eq!(t.partition_throughput(1 << 20), Some(10.0));
    }

    #[test]
    fn test_recommended_partitions() {
        let t = table();
        assert_eq!(t.recommended_partitions(2_000, 0.0), 1);
        assert_eq!(t.recommended_partitions(2_000, 10.0), 1);
        assert_eq!(t.recommended_partitions(2_000, 10.5), 2);
        assert_eq!(t.recommended_partitions(200, 9.0), 5);
    }

    #[test]
    fn test_empty_table() {
        let t = PartitionLoadTable::new(Vec::new());
        assert_eq!(t.partition_throughput(100), None);
        assert_eq!(t.recommended_partitions(100, 1_000.0), 1);
    }
}
