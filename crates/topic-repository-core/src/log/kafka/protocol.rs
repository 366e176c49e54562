//! Kafka protocol constants and helpers shared by the wire backend and the
//! mock broker.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::TopicName;
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType};

use crate::error::{LogError, LogResult};

/// API versions spoken by the client.
pub mod versions {
    pub const METADATA: i16 = 8;
    pub const LIST_OFFSETS: i16 = 5;
    pub const PRODUCE: i16 = 8;
    pub const CREATE_TOPICS: i16 = 4;
    pub const DELETE_TOPICS: i16 = 3;
}

/// Error codes the backend reacts to.
pub mod error_codes {
    pub const NONE: i16 = 0;
    pub const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
    pub const LEADER_NOT_AVAILABLE: i16 = 5;
    pub const NOT_LEADER_OR_FOLLOWER: i16 = 6;
    pub const REQUEST_TIMED_OUT: i16 = 7;
    pub const NOT_ENOUGH_REPLICAS: i16 = 19;
    pub const TOPIC_ALREADY_EXISTS: i16 = 36;
    pub const INVALID_PARTITIONS: i16 = 37;
    pub const INVALID_REPLICATION_FACTOR: i16 = 38;
    pub const NOT_CONTROLLER: i16 = 41;
}

/// ListOffsets timestamp for the first retained offset.
pub const EARLIEST_TIMESTAMP: i64 = -2;

/// ListOffsets timestamp for the end offset.
pub const LATEST_TIMESTAMP: i64 = -1;

/// Broker id used before the cluster layout is known.
pub const BOOTSTRAP_BROKER_ID: i32 = -1;

/// Symbolic name of a Kafka error code.
#[must_use]
pub fn error_name(code: i16) -> &'static str {
    match code {
        error_codes::NONE => "NONE",
        error_codes::UNKNOWN_TOPIC_OR_PARTITION => "UNKNOWN_TOPIC_OR_PARTITION",
        error_codes::LEADER_NOT_AVAILABLE => "LEADER_NOT_AVAILABLE",
        error_codes::NOT_LEADER_OR_FOLLOWER => "NOT_LEADER_OR_FOLLOWER",
        error_codes::REQUEST_TIMED_OUT => "REQUEST_TIMED_OUT",
        error_codes::NOT_ENOUGH_REPLICAS => "NOT_ENOUGH_REPLICAS",
        error_codes::TOPIC_ALREADY_EXISTS => "TOPIC_ALREADY_EXISTS",
        error_codes::INVALID_PARTITIONS => "INVALID_PARTITIONS",
        error_codes::INVALID_REPLICATION_FACTOR => "INVALID_REPLICATION_FACTOR",
        error_codes::NOT_CONTROLLER => "NOT_CONTROLLER",
        _ => "UNKNOWN_SERVER_ERROR",
    }
}

/// Turn a response error code into a result.
///
/// The broker's message is preferred over the symbolic name when present.
pub fn check_error(code: i16, message: Option<&StrBytes>) -> LogResult<()> {
    if code == error_codes::NONE {
        return Ok(());
    }
    let message = message.map_or_else(|| error_name(code).to_string(), |m| {
        format!("{}: {}", error_name(code), m.as_str())
    });
    Err(LogError::Broker { code, message })
}

/// Whether a partition error means the cached leader is stale.
#[must_use]
pub fn is_leadership_error(code: i16) -> bool {
    matches!(
        code,
        error_codes::UNKNOWN_TOPIC_OR_PARTITION
            | error_codes::LEADER_NOT_AVAILABLE
            | error_codes::NOT_LEADER_OR_FOLLOWER
    )
}

#[must_use]
pub fn topic_name(name: &str) -> TopicName {
    TopicName::from(StrBytes::from_string(name.to_string()))
}

/// Encode a single record as an uncompressed v2 record batch.
pub fn encode_record(key: Option<Bytes>, value: Bytes) -> LogResult<Bytes> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();
    let record = Record {
        transactional: false,
        control: false,
        partition_leader_epoch: -1,
        producer_id: -1,
        producer_epoch: -1,
        timestamp_type: TimestampType::Creation,
        offset: 0,
        sequence: -1,
        timestamp,
        key,
        value: Some(value),
        headers: Default::default(),
    };
    let options = RecordEncodeOptions {
        version: 2,
        compression: Compression::None,
    };

    let mut buf = BytesMut::new();
    RecordBatchEncoder::encode_with_custom_compression::<
        _,
        _,
        fn(&mut BytesMut, &mut BytesMut, Compression) -> anyhow::Result<()>,
    >(&mut buf, [record].iter(), &options, None)
    .map_err(|e| LogError::Protocol {
        message: format!("failed to encode record batch: {e}"),
    })?;
    Ok(buf.freeze())
}

/// Number of records in a v2 record batch, read from its header.
///
/// Returns `None` when `batch` is too short to carry a v2 header.
#[must_use]
pub fn batch_record_count(batch: &[u8]) -> Option<i32> {
    // base offset (8) + length (4) + leader epoch (4) + magic (1) + crc (4)
    // + attributes (2) + last offset delta (4) + timestamps (16)
    // + producer id (8) + epoch (2) + base sequence (4) + record count (4)
    const RECORD_COUNT_AT: usize = 57;
    let bytes = batch.get(RECORD_COUNT_AT..RECORD_COUNT_AT + 4)?;
    Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
