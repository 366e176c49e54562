//! Broker connection set of one client connection.
//!
//! Manages connections to all known Kafka brokers with discovery from
//! metadata responses.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
use kafka_protocol::messages::{MetadataRequest, MetadataResponse};
use tracing::{debug, info, warn};

use crate::error::{LogError, LogResult};
use crate::log::PartitionInfo;

use super::connection::BrokerConnection;
use super::protocol::{self, error_codes, versions, BOOTSTRAP_BROKER_ID};

/// Timeouts and identity shared by every broker connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub client_id: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

/// Topic layout from a metadata response.
#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub name: String,
    pub error_code: i16,
    pub is_internal: bool,
    pub partitions: Vec<PartitionInfo>,
}

/// Cluster layout from a metadata response.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    /// `None` when the cluster reports no active controller.
    pub controller_id: Option<i32>,
    pub topics: Vec<TopicMetadata>,
}

impl ClusterMetadata {
    /// Partitions of `topic`, or [`LogError::UnknownTopic`].
    pub fn partitions_of(&self, topic: &str) -> LogResult<Vec<PartitionInfo>> {
        let found = self
            .topics
            .iter()
            .find(|t| t.name == topic)
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;
        match found.error_code {
            error_codes::NONE => Ok(found.partitions.clone()),
            error_codes::UNKNOWN_TOPIC_OR_PARTITION => Err(LogError::UnknownTopic(topic.to_string())),
            code => Err(LogError::Broker {
                code,
                message: protocol::error_name(code).to_string(),
            }),
        }
    }
}

/// Connections to the brokers of one cluster.
pub struct KafkaCluster {
    bootstrap_servers: Vec<String>,
    settings: ConnectionSettings,
    /// Connections indexed by broker ID.
    brokers: DashMap<i32, Arc<BrokerConnection>>,
    bootstrap: Mutex<Option<Arc<BrokerConnection>>>,
    controller_id: AtomicI32,
    closed: AtomicBool,
}

impl KafkaCluster {
    #[must_use]
    pub fn new(bootstrap_servers: Vec<String>, settings: ConnectionSettings) -> Self {
        Self {
            bootstrap_servers,
            settings,
            brokers: DashMap::new(),
            bootstrap: Mutex::new(None),
            controller_id: AtomicI32::new(BOOTSTRAP_BROKER_ID),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Connect to the cluster using the bootstrap servers.
    ///
    /// Tries each bootstrap server in order until one succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::NoBrokersAvailable`] if all bootstrap servers fail.
    pub async fn connect(&self) -> LogResult<Arc<BrokerConnection>> {
        self.ensure_open()?;
        if let Some(conn) = self.current_bootstrap() {
            if conn.is_connected().await {
                return Ok(conn);
            }
        }

        for server in &self.bootstrap_servers {
            let conn = Arc::new(self.create_connection(BOOTSTRAP_BROKER_ID, server.clone()));
            match conn.connect().await {
                Ok(()) => {
                    info!(server = %server, "connected to bootstrap server");
                    if let Ok(mut bootstrap) = self.bootstrap.lock() {
                        *bootstrap = Some(Arc::clone(&conn));
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "failed to connect to bootstrap server");
                }
            }
        }

        Err(LogError::NoBrokersAvailable)
    }

    fn current_bootstrap(&self) -> Option<Arc<BrokerConnection>> {
        self.bootstrap.lock().ok().and_then(|b| b.clone())
    }

    fn create_connection(&self, broker_id: i32, address: String) -> BrokerConnection {
        BrokerConnection::new(
            broker_id,
            address,
            &self.settings.client_id,
            self.settings.connect_timeout,
            self.settings.request_timeout,
        )
    }

    /// Get the connection to a broker learned from metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is not known.
    pub fn broker(&self, broker_id: i32) -> LogResult<Arc<BrokerConnection>> {
        self.ensure_open()?;
        self.brokers
            .get(&broker_id)
            .map(|conn| Arc::clone(conn.value()))
            .ok_or_else(|| LogError::BrokerUnavailable {
                broker_id,
                message: "broker not in metadata".to_string(),
            })
    }

    /// Connection to the active controller, falling back to the bootstrap
    /// connection while no controller is known.
    ///
    /// # Errors
    ///
    /// Returns an error if no broker can be reached.
    pub async fn controller(&self) -> LogResult<Arc<BrokerConnection>> {
        match self.controller_id.load(Ordering::Relaxed) {
            BOOTSTRAP_BROKER_ID => self.connect().await,
            id => match self.broker(id) {
                Ok(conn) => Ok(conn),
                Err(_) => self.connect().await,
            },
        }
    }

    /// Fetch metadata for `topics`, or for every topic when `None`.
    ///
    /// Registers every broker in the response so later requests can be
    /// routed to partition leaders.
    ///
    /// # Errors
    ///
    /// Returns an error if no broker can be reached or the request fails.
    pub async fn fetch_metadata(&self, topics: Option<&[&str]>) -> LogResult<ClusterMetadata> {
        let conn = self.connect().await?;
        let request = MetadataRequest::default()
            .with_topics(topics.map(|names| {
                names
                    .iter()
                    .map(|name| MetadataRequestTopic::default().with_name(Some(protocol::topic_name(name))))
                    .collect()
            }))
            .with_allow_auto_topic_creation(false);

        let response = match conn.request(&request, versions::METADATA).await {
            Ok(response) => response,
            Err(e) => {
                self.drop_bootstrap();
                return Err(e);
            }
        };
        Ok(self.apply_metadata(response))
    }

    fn drop_bootstrap(&self) {
        if let Ok(mut bootstrap) = self.bootstrap.lock() {
            *bootstrap = None;
        }
    }

    fn apply_metadata(&self, response: MetadataResponse) -> ClusterMetadata {
        for broker in &response.brokers {
            let broker_id = broker.node_id.0;
            let address = format!("{}:{}", broker.host.as_str(), broker.port);
            let known = self
                .brokers
                .get(&broker_id)
                .is_some_and(|conn| conn.address() == address);
            if !known {
                debug!(broker_id, address = %address, "registered broker");
                self.brokers
                    .insert(broker_id, Arc::new(self.create_connection(broker_id, address)));
            }
        }

        let controller_id = response.controller_id.0;
        self.controller_id.store(controller_id, Ordering::Relaxed);

        let topics = response
            .topics
            .into_iter()
            .filter_map(|topic| {
                let name = topic.name?.0.to_string();
                let partitions = topic
                    .partitions
                    .iter()
                    .map(|p| PartitionInfo {
                        topic: name.clone(),
                        partition: p.partition_index,
                        leader: (p.leader_id.0 >= 0).then_some(p.leader_id.0),
                    })
                    .collect();
                Some(TopicMetadata {
                    name,
                    error_code: topic.error_code,
                    is_internal: topic.is_internal,
                    partitions,
                })
            })
            .collect::<Vec<_>>();

        debug!(
            broker_count = response.brokers.len(),
            topic_count = topics.len(),
            controller_id,
            "metadata refreshed"
        );

        ClusterMetadata {
            controller_id: (controller_id >= 0).then_some(controller_id),
            topics,
        }
    }

    /// Number of brokers learned from metadata.
    #[must_use]
    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> LogResult<()> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        Ok(())
    }

    /// Drop every broker connection. Later calls fail with [`LogError::Closed`].
    ///
    /// Requests already holding a connection finish on it; the socket closes
    /// with the last reference.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.drop_bootstrap();
        self.brokers.clear();
        debug!("cluster connections closed");
    }
}

impl Drop for KafkaCluster {
    fn drop(&mut self) {
        self.close();
    }
}
