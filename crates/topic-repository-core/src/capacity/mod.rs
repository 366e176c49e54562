//! Partition count planning for new topics.
//!
//! A [`CapacityHint`] declares the expected parallelism and load of a topic.
//! The [`PartitionPlanner`] turns it into a partition count bounded by the
//! configured maximum, using a [`LoadPartitionMapping`] to derive a count from
//! throughput.

mod load_table;
mod planner;

pub use load_table::{LoadPartitionMapping, PartitionLoadTable};
pub use planner::{throughput_mb_per_sec, CapacityHint, PartitionPlanner};
