//! Domain error types for the topic repository.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.
//! Errors are split by concern: configuration, the underlying log client,
//! cursor formatting, and the upward-facing repository taxonomy.

use std::fmt;

use thiserror::Error;

use crate::cursor::Cursor;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// No bootstrap servers were configured.
    #[error("kafka.bootstrap_servers must contain at least one address")]
    NoBootstrapServers,

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// The producer pool must hold at least one connection.
    #[error("publish.producer_pool_size must be at least 1")]
    EmptyProducerPool,

    /// Only acknowledged produce modes are supported.
    #[error("publish.acks must be -1 (all) or 1 (leader), got {0}")]
    UnsupportedAcks(i16),

    /// Partition count bounds are inconsistent.
    #[error("invalid partition counts: default {default_count} and max {max_count} (need 1 <= default <= max)")]
    InvalidPartitionCounts { default_count: u32, max_count: u32 },

    /// Replication factor must be positive.
    #[error("topics.replication_factor must be at least 1, got {0}")]
    InvalidReplicationFactor(i16),

    /// A row of the partition load table is unusable.
    #[error("invalid load table row: message size {message_size_bytes}, throughput {throughput_mb_per_sec} MB/s")]
    InvalidLoadTableRow {
        message_size_bytes: u32,
        throughput_mb_per_sec: f64,
    },
}

/// Errors reported by the underlying partitioned-log client.
///
/// [`LogError::Timeout`] is kept apart from every other failure: a client-side
/// timeout leaves the connection in an untrusted state.
#[derive(Error, Debug)]
pub enum LogError {
    /// The operation did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// TCP/IO connection error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Broker is not available or connection failed.
    #[error("broker {broker_id} unavailable: {message}")]
    BrokerUnavailable { broker_id: i32, message: String },

    /// No brokers available to handle request.
    #[error("no brokers available")]
    NoBrokersAvailable,

    /// Failed to encode or decode a protocol message.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Request correlation ID mismatch.
    #[error("correlation ID mismatch: expected {expected}, got {actual}")]
    CorrelationIdMismatch { expected: i32, actual: i32 },

    /// The broker answered with a non-zero error code.
    #[error("broker error code {code}: {message}")]
    Broker { code: i16, message: String },

    /// Topic was not found in cluster metadata.
    #[error("topic not found: {0}")]
    UnknownTopic(String),

    /// Partition does not exist or has no known leader.
    #[error("partition {partition} of topic {topic} is unknown or leaderless")]
    UnknownPartition { topic: String, partition: i32 },

    /// Topic creation raced with an existing topic of the same name.
    #[error("topic already exists: {0}")]
    TopicAlreadyExists(String),

    /// A position was requested for a partition not assigned to the consumer.
    #[error("partition {partition} of topic {topic} is not assigned")]
    NotAssigned { topic: String, partition: i32 },

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}

impl LogError {
    /// Whether this failure is timeout-classified.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// A caller-supplied partition or offset string that cannot be translated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Partition ids are canonical non-negative decimal `i32` values.
    #[error("invalid partition '{0}': expected a non-negative decimal integer")]
    InvalidPartition(String),

    /// Offsets are canonical non-negative decimal `i64` values.
    #[error("invalid offset '{0}': expected a non-negative decimal integer")]
    InvalidOffset(String),

    /// The "before oldest" sentinel has no physical offset.
    #[error("the before-oldest sentinel cannot be used as a physical offset")]
    UnexpectedSentinel,

    /// A cursor field was null.
    #[error("cursor {0} is missing")]
    MissingField(&'static str),
}

/// Reason a cursor was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorErrorKind {
    NullPartition,
    NullOffset,
    InvalidFormat,
    PartitionNotFound,
    EmptyPartition,
    Unavailable,
}

impl CursorErrorKind {
    /// Stable label, used for metrics and messages.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NullPartition => "null_partition",
            Self::NullOffset => "null_offset",
            Self::InvalidFormat => "invalid_format",
            Self::PartitionNotFound => "partition_not_found",
            Self::EmptyPartition => "empty_partition",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for CursorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced to the layers above the repository.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Cluster or connection level failure.
    #[error("service unavailable: {message}: {source}")]
    ServiceUnavailable {
        message: String,
        #[source]
        source: LogError,
    },

    /// A topic with this name already exists (or is still being deleted).
    #[error("topic {0} already exists (or wasn't completely removed yet)")]
    DuplicateTopic(String),

    /// Topic deletion could not be triggered.
    #[error("unable to delete topic {topic}: {source}")]
    TopicDeletion {
        topic: String,
        #[source]
        source: LogError,
    },

    /// At least one item of a batch failed; inspect the items for details.
    #[error("error publishing {failed} of {total} events to topic {topic}")]
    Publish {
        topic: String,
        failed: usize,
        total: usize,
    },

    /// A cursor failed validation.
    #[error("invalid cursor {cursor}: {kind}")]
    InvalidCursor { kind: CursorErrorKind, cursor: Cursor },

    /// An offset or partition string failed to translate.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// The topic specification is incomplete.
    #[error("invalid topic specification: {0}")]
    InvalidTopicSpec(String),

    /// A batch item reached the publisher without a target partition.
    #[error("batch item {index} has no target partition at the moment of publishing")]
    MissingPartition { index: usize },
}

impl RepositoryError {
    /// Wrap a log-client failure as a service outage.
    pub(crate) fn unavailable(message: impl Into<String>, source: LogError) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
            source,
        }
    }

    /// The cursor-kind of an [`RepositoryError::InvalidCursor`].
    #[must_use]
    pub fn cursor_kind(&self) -> Option<CursorErrorKind> {
        match self {
            Self::InvalidCursor { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result type alias for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for log client operations.
pub type LogResult<T> = std::result::Result<T, LogError>;
