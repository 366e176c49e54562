//! Mock Kafka broker for integration testing.
//!
//! A single-node broker that:
//! - Accepts Kafka protocol connections
//! - Records all requests received
//! - Answers Metadata, ListOffsets, Produce, CreateTopics and DeleteTopics
//!   from in-memory topic state
//! - Injects faults per partition

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::create_topics_response::CreatableTopicResult;
use kafka_protocol::messages::delete_topics_response::DeletableTopicResult;
use kafka_protocol::messages::list_offsets_response::{
    ListOffsetsPartitionResponse, ListOffsetsTopicResponse,
};
use kafka_protocol::messages::metadata_response::{
    MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
};
use kafka_protocol::messages::produce_response::{PartitionProduceResponse, TopicProduceResponse};
use kafka_protocol::messages::{
    ApiKey, BrokerId, CreateTopicsRequest, CreateTopicsResponse, DeleteTopicsRequest,
    DeleteTopicsResponse, ListOffsetsRequest, ListOffsetsResponse, MetadataRequest,
    MetadataResponse, ProduceRequest, ProduceResponse, RequestHeader, ResponseHeader,
};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, Request, StrBytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};

use crate::config::parse_address;
use crate::log::kafka::protocol::{
    batch_record_count, error_codes, topic_name, EARLIEST_TIMESTAMP, LATEST_TIMESTAMP,
};

/// Node id of the mock broker. It is also the controller.
pub const MOCK_BROKER_ID: i32 = 1;

/// API keys for Kafka protocol
pub mod api_keys {
    pub const PRODUCE: i16 = 0;
    pub const LIST_OFFSETS: i16 = 2;
    pub const METADATA: i16 = 3;
    pub const CREATE_TOPICS: i16 = 19;
    pub const DELETE_TOPICS: i16 = 20;
}

/// A recorded broker call.
#[derive(Debug, Clone)]
pub struct BrokerCall {
    /// The API key of the request.
    pub api_key: i16,
    /// The API version of the request.
    pub api_version: i16,
    /// The correlation ID.
    pub correlation_id: i32,
    /// The raw request bytes (without length prefix).
    pub request_bytes: Bytes,
}

#[derive(Debug, Clone, Default)]
struct MockPartition {
    oldest: i64,
    end: i64,
    leaderless: bool,
    stalled: bool,
    error_code: Option<i16>,
}

#[derive(Debug, Default)]
struct BrokerState {
    host: String,
    port: i32,
    topics: BTreeMap<String, Vec<MockPartition>>,
    configs: BTreeMap<String, Vec<(String, String)>>,
    created: Vec<String>,
    deleted: Vec<String>,
}

/// Mock Kafka broker for testing.
pub struct MockBroker {
    address: String,
    shutdown_tx: Option<broadcast::Sender<()>>,
    call_log: Arc<RwLock<Vec<BrokerCall>>>,
    state: Arc<RwLock<BrokerState>>,
    connections: Arc<AtomicUsize>,
}

impl MockBroker {
    /// Create a new mock broker that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            shutdown_tx: None,
            call_log: Arc::new(RwLock::new(Vec::new())),
            state: Arc::new(RwLock::new(BrokerState::default())),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start the mock broker.
    ///
    /// Returns the actual address the broker is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> std::io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        let actual_address = listener.local_addr()?.to_string();
        let (host, port) = parse_address(&actual_address)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        {
            let mut state = self.state.write().await;
            state.host = host;
            state.port = port;
        }
        self.address = actual_address.clone();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let call_log = Arc::clone(&self.call_log);
        let state = Arc::clone(&self.state);
        let connections = Arc::clone(&self.connections);
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                let call_log = Arc::clone(&call_log);
                                let state = Arc::clone(&state);
                                let connections = Arc::clone(&connections);
                                let shutdown_rx = shutdown_tx.subscribe();

                                connections.fetch_add(1, Ordering::SeqCst);
                                tokio::spawn(async move {
                                    Self::handle_connection(stream, call_log, state, shutdown_rx).await;
                                    connections.fetch_sub(1, Ordering::SeqCst);
                                });
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Ok(actual_address)
    }

    /// Stop the mock broker.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Get the broker address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of client connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Create a topic with `partitions` empty partitions.
    pub async fn create_topic(&self, topic: &str, partitions: usize) {
        self.state
            .write()
            .await
            .topics
            .insert(topic.to_string(), vec![MockPartition::default(); partitions]);
    }

    /// Set the retained range of a partition: `oldest` is the first retained
    /// offset, `end` the next offset to be written.
    pub async fn set_offsets(&self, topic: &str, partition: i32, oldest: i64, end: i64) {
        self.with_partition(topic, partition, |p| {
            p.oldest = oldest;
            p.end = end;
        })
        .await;
    }

    /// Never answer produce requests for a partition.
    pub async fn stall_partition(&self, topic: &str, partition: i32) {
        self.with_partition(topic, partition, |p| p.stalled = true).await;
    }

    /// Answer produce requests for a partition with `error_code`.
    pub async fn fail_partition(&self, topic: &str, partition: i32, error_code: i16) {
        self.with_partition(topic, partition, |p| p.error_code = Some(error_code))
            .await;
    }

    /// Report a partition without a leader in metadata.
    pub async fn set_leaderless(&self, topic: &str, partition: i32) {
        self.with_partition(topic, partition, |p| p.leaderless = true).await;
    }

    /// End offset of a partition, if it exists.
    pub async fn end_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .and_then(|parts| parts.get(usize::try_from(partition).ok()?))
            .map(|p| p.end)
    }

    /// Partition count of a topic, if it exists.
    pub async fn partition_count(&self, topic: &str) -> Option<usize> {
        self.state.read().await.topics.get(topic).map(Vec::len)
    }

    /// Configuration entries a topic was created with.
    pub async fn topic_configs(&self, topic: &str) -> Vec<(String, String)> {
        self.state
            .read()
            .await
            .configs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Topics created through CreateTopics, in order.
    pub async fn created_topics(&self) -> Vec<String> {
        self.state.read().await.created.clone()
    }

    /// Topics deleted through DeleteTopics, in order.
    pub async fn deleted_topics(&self) -> Vec<String> {
        self.state.read().await.deleted.clone()
    }

    async fn with_partition(&self, topic: &str, partition: i32, f: impl FnOnce(&mut MockPartition)) {
        let mut state = self.state.write().await;
        let found = state
            .topics
            .get_mut(topic)
            .and_then(|parts| parts.get_mut(usize::try_from(partition).ok()?));
        if let Some(p) = found {
            f(p);
        }
    }

    /// Get all recorded calls.
    pub async fn get_calls(&self) -> Vec<BrokerCall> {
        self.call_log.read().await.clone()
    }

    /// Get calls filtered by API key.
    pub async fn get_calls_for_api(&self, api_key: i16) -> Vec<BrokerCall> {
        self.call_log
            .read()
            .await
            .iter()
            .filter(|c| c.api_key == api_key)
            .cloned()
            .collect()
    }

    /// Clear the call log.
    pub async fn clear_calls(&self) {
        self.call_log.write().await.clear();
    }

    /// Handle a single client connection.
    async fn handle_connection(
        mut stream: TcpStream,
        call_log: Arc<RwLock<Vec<BrokerCall>>>,
        state: Arc<RwLock<BrokerState>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = Self::read_frame(&mut stream) => {
                    let frame = match result {
                        Ok(Some(frame)) => Bytes::from(frame),
                        Ok(None) | Err(_) => break,
                    };
                    if frame.len() < 8 {
                        continue;
                    }

                    let call = BrokerCall {
                        api_key: i16::from_be_bytes([frame[0], frame[1]]),
                        api_version: i16::from_be_bytes([frame[2], frame[3]]),
                        correlation_id: i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
                        request_bytes: frame.clone(),
                    };
                    call_log.write().await.push(call.clone());

                    let response = {
                        let mut state = state.write().await;
                        Self::respond(&mut state, &call)
                    };
                    match response {
                        Ok(Some(response)) => {
                            if Self::write_frame(&mut stream, &response).await.is_err() {
                                break;
                            }
                        }
                        // stalled: leave the request unanswered
                        Ok(None) => {}
                        Err(_) => break,
                    }
                }
            }
        }
    }

    fn respond(state: &mut BrokerState, call: &BrokerCall) -> anyhow::Result<Option<Bytes>> {
        let version = call.api_version;
        let mut frame = call.request_bytes.clone();
        let key = ApiKey::try_from(call.api_key).map_err(|_| anyhow!("unknown api key {}", call.api_key))?;
        match key {
            ApiKey::Metadata => {
                let (header, request) = decode_request::<MetadataRequest>(&mut frame, version)?;
                let response = state.metadata(&request);
                encode_response::<MetadataRequest>(header.correlation_id, &response, version).map(Some)
            }
            ApiKey::ListOffsets => {
                let (header, request) = decode_request::<ListOffsetsRequest>(&mut frame, version)?;
                let response = state.list_offsets(&request);
                encode_response::<ListOffsetsRequest>(header.correlation_id, &response, version).map(Some)
            }
            ApiKey::Produce => {
                let (header, request) = decode_request::<ProduceRequest>(&mut frame, version)?;
                match state.produce(&request) {
                    Some(response) => {
                        encode_response::<ProduceRequest>(header.correlation_id, &response, version)
                            .map(Some)
                    }
                    None => Ok(None),
                }
            }
            ApiKey::CreateTopics => {
                let (header, request) = decode_request::<CreateTopicsRequest>(&mut frame, version)?;
                let response = state.create_topics(&request);
                encode_response::<CreateTopicsRequest>(header.correlation_id, &response, version)
                    .map(Some)
            }
            ApiKey::DeleteTopics => {
                let (header, request) = decode_request::<DeleteTopicsRequest>(&mut frame, version)?;
                let response = state.delete_topics(&request);
                encode_response::<DeleteTopicsRequest>(header.correlation_id, &response, version)
                    .map(Some)
            }
            other => bail!("unsupported api {other:?}"),
        }
    }

    /// Read a Kafka frame (4-byte length prefix + body).
    async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    /// Write a Kafka frame (4-byte length prefix + body).
    async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(4 + data.len());
        buf.put_u32(data.len() as u32);
        buf.extend_from_slice(data);
        stream.write_all(&buf).await?;
        stream.flush().await
    }
}

fn decode_request<R: Request>(frame: &mut Bytes, version: i16) -> anyhow::Result<(RequestHeader, R)> {
    let header = RequestHeader::decode(frame, R::header_version(version))?;
    let request = R::decode(frame, version)?;
    Ok((header, request))
}

fn encode_response<R: Request>(
    correlation_id: i32,
    response: &R::Response,
    version: i16,
) -> anyhow::Result<Bytes> {
    let mut buf = BytesMut::new();
    ResponseHeader::default()
        .with_correlation_id(correlation_id)
        .encode(&mut buf, R::Response::header_version(version))?;
    response.encode(&mut buf, version)?;
    Ok(buf.freeze())
}

impl BrokerState {
    fn partition(&self, topic: &str, partition: i32) -> Option<&MockPartition> {
        self.topics
            .get(topic)
            .and_then(|parts| parts.get(usize::try_from(partition).ok()?))
    }

    fn metadata(&self, request: &MetadataRequest) -> MetadataResponse {
        let broker = MetadataResponseBroker::default()
            .with_node_id(BrokerId::from(MOCK_BROKER_ID))
            .with_host(StrBytes::from_string(self.host.clone()))
            .with_port(self.port);

        let names: Vec<String> = match &request.topics {
            None => self.topics.keys().cloned().collect(),
            Some(topics) => topics
                .iter()
                .filter_map(|t| t.name.as_ref().map(|n| n.as_str().to_string()))
                .collect(),
        };

        let topics = names
            .into_iter()
            .map(|name| {
                let Some(parts) = self.topics.get(&name) else {
                    return MetadataResponseTopic::default()
                        .with_error_code(error_codes::UNKNOWN_TOPIC_OR_PARTITION)
                        .with_name(Some(topic_name(&name)));
                };
                let partitions = parts
                    .iter()
                    .enumerate()
                    .map(|(index, p)| {
                        let leader = if p.leaderless { -1 } else { MOCK_BROKER_ID };
                        MetadataResponsePartition::default()
                            .with_error_code(if p.leaderless {
                                error_codes::LEADER_NOT_AVAILABLE
                            } else {
                                error_codes::NONE
                            })
                            .with_partition_index(index as i32)
                            .with_leader_id(BrokerId::from(leader))
                            .with_leader_epoch(0)
                            .with_replica_nodes(vec![BrokerId::from(MOCK_BROKER_ID)])
                            .with_isr_nodes(vec![BrokerId::from(MOCK_BROKER_ID)])
                            .with_offline_replicas(vec![])
                    })
                    .collect();
                MetadataResponseTopic::default()
                    .with_error_code(error_codes::NONE)
                    .with_name(Some(topic_name(&name)))
                    .with_is_internal(false)
                    .with_partitions(partitions)
            })
            .collect();

        MetadataResponse::default()
            .with_brokers(vec![broker])
            .with_controller_id(BrokerId::from(MOCK_BROKER_ID))
            .with_topics(topics)
    }

    fn list_offsets(&self, request: &ListOffsetsRequest) -> ListOffsetsResponse {
        let topics = request
            .topics
            .iter()
            .map(|topic| {
                let partitions = topic
                    .partitions
                    .iter()
                    .map(|req| {
                        let response = ListOffsetsPartitionResponse::default()
                            .with_partition_index(req.partition_index)
                            .with_timestamp(-1)
                            .with_leader_epoch(0);
                        let found = self.partition(topic.name.as_str(), req.partition_index);
                        match (found, req.timestamp) {
                            (Some(p), EARLIEST_TIMESTAMP) => response.with_offset(p.oldest),
                            (Some(p), LATEST_TIMESTAMP) => response.with_offset(p.end),
                            (Some(p), _) => response.with_offset(p.end),
                            (None, _) => response
                                .with_error_code(error_codes::UNKNOWN_TOPIC_OR_PARTITION)
                                .with_offset(-1),
                        }
                    })
                    .collect();
                ListOffsetsTopicResponse::default()
                    .with_name(topic.name.clone())
                    .with_partitions(partitions)
            })
            .collect();

        ListOffsetsResponse::default().with_topics(topics)
    }

    /// `None` when any addressed partition is stalled.
    fn produce(&mut self, request: &ProduceRequest) -> Option<ProduceResponse> {
        let stalled = request.topic_data.iter().any(|topic| {
            topic.partition_data.iter().any(|data| {
                self.partition(topic.name.as_str(), data.index)
                    .is_some_and(|p| p.stalled)
            })
        });
        if stalled {
            return None;
        }

        let responses = request
            .topic_data
            .iter()
            .map(|topic| {
                let partition_responses = topic
                    .partition_data
                    .iter()
                    .map(|data| {
                        let response = PartitionProduceResponse::default()
                            .with_index(data.index)
                            .with_log_append_time_ms(-1);
                        let count = data
                            .records
                            .as_deref()
                            .and_then(batch_record_count)
                            .unwrap_or(0);
                        let found = self
                            .topics
                            .get_mut(topic.name.as_str())
                            .and_then(|parts| parts.get_mut(usize::try_from(data.index).ok()?));
                        match found {
                            None => response
                                .with_error_code(error_codes::UNKNOWN_TOPIC_OR_PARTITION)
                                .with_base_offset(-1),
                            Some(p) if p.leaderless => response
                                .with_error_code(error_codes::NOT_LEADER_OR_FOLLOWER)
                                .with_base_offset(-1),
                            Some(p) => match p.error_code {
                                Some(code) => response.with_error_code(code).with_base_offset(-1),
                                None => {
                                    let base_offset = p.end;
                                    p.end += i64::from(count);
                                    response
                                        .with_base_offset(base_offset)
                                        .with_log_start_offset(p.oldest)
                                }
                            },
                        }
                    })
                    .collect();
                TopicProduceResponse::default()
                    .with_name(topic.name.clone())
                    .with_partition_responses(partition_responses)
            })
            .collect();

        Some(ProduceResponse::default().with_responses(responses))
    }

    fn create_topics(&mut self, request: &CreateTopicsRequest) -> CreateTopicsResponse {
        let topics = request
            .topics
            .iter()
            .map(|topic| {
                let name = topic.name.as_str().to_string();
                let result = CreatableTopicResult::default()
                    .with_name(topic.name.clone())
                    .with_num_partitions(topic.num_partitions)
                    .with_replication_factor(topic.replication_factor);
                if self.topics.contains_key(&name) {
                    return result
                        .with_error_code(error_codes::TOPIC_ALREADY_EXISTS)
                        .with_error_message(Some(StrBytes::from_string(format!(
                            "Topic '{name}' already exists."
                        ))));
                }
                if topic.num_partitions < 1 {
                    return result.with_error_code(error_codes::INVALID_PARTITIONS);
                }

                let configs = topic
                    .configs
                    .iter()
                    .map(|c| {
                        (
                            c.name.as_str().to_string(),
                            c.value.as_ref().map(|v| v.as_str().to_string()).unwrap_or_default(),
                        )
                    })
                    .collect();
                let count = usize::try_from(topic.num_partitions).unwrap_or_default();
                self.topics
                    .insert(name.clone(), vec![MockPartition::default(); count]);
                self.configs.insert(name.clone(), configs);
                self.created.push(name);
                result.with_error_code(error_codes::NONE)
            })
            .collect();

        CreateTopicsResponse::default().with_topics(topics)
    }

    fn delete_topics(&mut self, request: &DeleteTopicsRequest) -> DeleteTopicsResponse {
        let mut seen = HashSet::new();
        let responses = request
            .topic_names
            .iter()
            .filter(|name| seen.insert(name.as_str().to_string()))
            .map(|name| {
                let key = name.as_str().to_string();
                let error_code = if self.topics.remove(&key).is_some() {
                    self.configs.remove(&key);
                    self.deleted.push(key);
                    error_codes::NONE
                } else {
                    error_codes::UNKNOWN_TOPIC_OR_PARTITION
                };
                DeletableTopicResult::default()
                    .with_name(Some(name.clone()))
                    .with_error_code(error_code)
            })
            .collect();

        DeleteTopicsResponse::default().with_responses(responses)
    }
}
