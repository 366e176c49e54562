//! Partition count selection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::load_table::{LoadPartitionMapping, PartitionLoadTable};
use crate::config::TopicsConfig;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const SECONDS_PER_MINUTE: f64 = 60.0;

/// Declared load of a topic, supplied once at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityHint {
    pub read_parallelism: u32,
    pub write_parallelism: u32,
    pub messages_per_minute: u64,
    pub avg_message_size_bytes: u64,
}

/// Throughput of a hint in MB per second.
#[must_use]
pub fn throughput_mb_per_sec(hint: &CapacityHint) -> f64 {
    (hint.messages_per_minute as f64 * hint.avg_message_size_bytes as f64)
        / (BYTES_PER_MB * SECONDS_PER_MINUTE)
}

/// Chooses the partition count of new topics.
#[derive(Clone)]
pub struct PartitionPlanner {
    default_count: u32,
    max_count: u32,
    mapping: Arc<dyn LoadPartitionMapping>,
}

impl PartitionPlanner {
    pub fn new(default_count: u32, max_count: u32, mapping: Arc<dyn LoadPartitionMapping>) -> Self {
        Self {
            default_count,
            max_count,
            mapping,
        }
    }

    /// Planner over the configured bounds and load table.
    #[must_use]
    pub fn from_config(config: &TopicsConfig) -> Self {
        Self::new(
            config.default_partition_count,
            config.max_partition_count,
            Arc::new(PartitionLoadTable::new(config.load_table.clone())),
        )
    }

    /// Partition count for a topic.
    ///
    /// Without a hint the configured default is used. Otherwise the count is
    /// the declared parallelism, raised to the load-derived count, capped at
    /// the maximum.
    #[must_use]
    pub fn choose_partition_count(&self, hint: Option<&CapacityHint>) -> u32 {
        let Some(hint) = hint else {
            return self.default_count;
        };

        let parallelism = hint.read_parallelism.max(hint.write_parallelism);
        if parallelism >= self.max_count {
            return self.max_count;
        }

        let derived = self
            .mapping
            .recommended_partitions(hint.avg_message_size_bytes, throughput_mb_per_sec(hint));
        self.max_count.min(parallelism.max(derived))
    }

    #[must_use]
    pub fn max_count(&self) -> u32 {
        self.max_count
    }
}

impl std::fmt::Debug for PartitionPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionPlanner")
            .field("default_count", &self.default_count)
            .field("max_count", &self.max_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u32);

    impl LoadPartitionMapping for Fixed {
        fn recommended_partitions(&self, _: u64, _: f64) -> u32 {
            self.0
        }
    }

    fn planner(max_count: u32, derived: u32) -> PartitionPlanner {
        PartitionPlanner::new(3, max_count, Arc::new(Fixed(derived)))
    }

    fn hint(read: u32, write: u32) -> CapacityHint {
        CapacityHint {
            read_parallelism: read,
            write_parallelism: write,
            ..CapacityHint::default()
        }
    }

    #[test]
    fn test_no_hint_uses_default() {
        assert_eq!(planner(64, 1).choose_partition_count(None), 3);
    }

    #[test]
    fn test_parallelism_dominates() {
        assert_eq!(planner(64, 1).choose_partition_count(Some(&hint(10, 2))), 10);
        assert_eq!(planner(64, 1).choose_partition_count(Some(&hint(2, 10))), 10);
    }

    #[test]
    fn test_capped_at_max() {
        assert_eq!(planner(64, 1).choose_partition_count(Some(&hint(100, 0))), 64);
        assert_eq!(planner(64, 1).choose_partition_count(Some(&hint(64, 0))), 64);
        assert_eq!(planner(8, 50).choose_partition_count(Some(&hint(4, 4))), 8);
    }

    #[test]
    fn test_load_raises_count() {
        assert_eq!(planner(64, 12).choose_partition_count(Some(&hint(4, 4))), 12);
    }

    #[test]
    fn test_throughput() {
        let h = CapacityHint {
            messages_per_minute: 60 * 1024,
            avg_message_size_bytes: 1024,
            ..CapacityHint::default()
        };
        assert!((throughput_mb_per_sec(&h) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_config_defaults() {
        let p = PartitionPlanner::from_config(&TopicsConfig::default());
        let h = CapacityHint {
            read_parallelism: 4,
            write_parallelism: 4,
            messages_per_minute: 600,
            avg_message_size_bytes: 1024,
        };
        assert_eq!(p.choose_partition_count(Some(&h)), 4);
        assert_eq!(p.choose_partition_count(None), 8);
    }
}
