//! Kafka wire-protocol backend.
//!
//! Every producer, consumer and admin session owns its own set of broker
//! connections, so closing one never disturbs another:
//! - [`KafkaProducer`] routes each send to the partition leader as its own task
//! - [`KafkaConsumer`] resolves positions with ListOffsets
//! - [`KafkaAdmin`] creates and deletes topics through the controller

pub mod admin;
pub mod cluster;
pub mod connection;
pub mod consumer;
pub mod producer;
pub mod protocol;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

pub use admin::KafkaAdmin;
pub use cluster::{ClusterMetadata, ConnectionSettings, KafkaCluster, TopicMetadata};
pub use connection::BrokerConnection;
pub use consumer::KafkaConsumer;
pub use producer::KafkaProducer;

use crate::config::RepositoryConfig;
use crate::error::{LogError, LogResult};
use crate::log::LogClient;

/// [`LogClient`] over the Kafka protocol.
pub struct KafkaLogClient {
    bootstrap_servers: Vec<String>,
    settings: ConnectionSettings,
    acks: i16,
    /// Connections used for topic listing.
    metadata: Arc<KafkaCluster>,
}

impl KafkaLogClient {
    #[must_use]
    pub fn new(bootstrap_servers: Vec<String>, settings: ConnectionSettings, acks: i16) -> Self {
        let metadata = Arc::new(KafkaCluster::new(bootstrap_servers.clone(), settings.clone()));
        Self {
            bootstrap_servers,
            settings,
            acks,
            metadata,
        }
    }

    /// Build a client from the `kafka` and `publish` config sections.
    #[must_use]
    pub fn from_config(config: &RepositoryConfig) -> Self {
        let settings = ConnectionSettings {
            client_id: config.kafka.client_id.clone(),
            connect_timeout: config.kafka.connection_timeout(),
            request_timeout: config.kafka.request_timeout(),
        };
        Self::new(config.kafka.bootstrap_servers(), settings, config.publish.acks)
    }

    #[must_use]
    pub fn bootstrap_servers(&self) -> &[String] {
        &self.bootstrap_servers
    }

    async fn open_cluster(&self, servers: Vec<String>) -> LogResult<KafkaCluster> {
        let cluster = KafkaCluster::new(servers, self.settings.clone());
        cluster.connect().await?;
        Ok(cluster)
    }
}

/// Split a comma-separated connection string into broker addresses.
fn split_connection_string(connection_string: &str) -> Vec<String> {
    connection_string
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[async_trait]
impl LogClient for KafkaLogClient {
    type Producer = KafkaProducer;
    type Consumer = KafkaConsumer;
    type Admin = KafkaAdmin;

    async fn list_topics(&self) -> LogResult<Vec<String>> {
        let metadata = self.metadata.fetch_metadata(None).await?;
        Ok(metadata
            .topics
            .into_iter()
            .filter(|t| !t.is_internal)
            .map(|t| t.name)
            .collect())
    }

    #[instrument(skip(self))]
    async fn open_producer(&self) -> LogResult<KafkaProducer> {
        let cluster = self.open_cluster(self.bootstrap_servers.clone()).await?;
        debug!("producer connection opened");
        Ok(KafkaProducer::new(cluster, self.acks))
    }

    async fn open_consumer(&self) -> LogResult<KafkaConsumer> {
        let cluster = self.open_cluster(self.bootstrap_servers.clone()).await?;
        Ok(KafkaConsumer::new(cluster))
    }

    #[instrument(skip(self))]
    async fn open_admin(&self, connection_string: &str) -> LogResult<KafkaAdmin> {
        let servers = split_connection_string(connection_string);
        if servers.is_empty() {
            return Err(LogError::NoBrokersAvailable);
        }
        let cluster = self.open_cluster(servers).await?;
        Ok(KafkaAdmin::new(cluster))
    }
}
