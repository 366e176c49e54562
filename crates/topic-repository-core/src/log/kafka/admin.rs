//! Administrative session: topic creation and deletion via the controller.

use async_trait::async_trait;
use kafka_protocol::messages::create_topics_request::{CreatableTopic, CreateableTopicConfig};
use kafka_protocol::messages::{CreateTopicsRequest, DeleteTopicsRequest};
use kafka_protocol::protocol::StrBytes;
use tracing::{debug, info};

use crate::error::{LogError, LogResult};
use crate::log::{NewTopic, TopicAdmin};

use super::cluster::KafkaCluster;
use super::protocol::{self, error_codes, versions};

/// Metadata request naming no topics: brokers and controller only.
const NO_TOPICS: &[&str] = &[];

/// Admin session over its own broker connections.
pub struct KafkaAdmin {
    cluster: KafkaCluster,
}

impl KafkaAdmin {
    pub(crate) fn new(cluster: KafkaCluster) -> Self {
        Self { cluster }
    }

    fn timeout_ms(&self) -> i32 {
        i32::try_from(self.cluster.settings().request_timeout.as_millis()).unwrap_or(i32::MAX)
    }
}

#[async_trait]
impl TopicAdmin for KafkaAdmin {
    async fn create_topic(&mut self, topic: &NewTopic) -> LogResult<()> {
        self.cluster.fetch_metadata(Some(NO_TOPICS)).await?;

        let configs = topic
            .configs()
            .into_iter()
            .map(|(name, value)| {
                CreateableTopicConfig::default()
                    .with_name(StrBytes::from_static_str(name))
                    .with_value(Some(StrBytes::from_string(value)))
            })
            .collect();
        let request = CreateTopicsRequest::default()
            .with_topics(vec![CreatableTopic::default()
                .with_name(protocol::topic_name(&topic.name))
                .with_num_partitions(topic.partitions)
                .with_replication_factor(topic.replication_factor)
                .with_configs(configs)])
            .with_timeout_ms(self.timeout_ms());

        let controller = self.cluster.controller().await?;
        let response = controller.request(&request, versions::CREATE_TOPICS).await?;
        let result = response
            .topics
            .iter()
            .find(|t| t.name.as_str() == topic.name)
            .ok_or_else(|| LogError::Protocol {
                message: format!("create topics response has no entry for {}", topic.name),
            })?;

        if result.error_code == error_codes::TOPIC_ALREADY_EXISTS {
            return Err(LogError::TopicAlreadyExists(topic.name.clone()));
        }
        protocol::check_error(result.error_code, result.error_message.as_ref())?;

        info!(
            topic = %topic.name,
            partitions = topic.partitions,
            replication_factor = topic.replication_factor,
            broker_id = controller.broker_id(),
            "topic created"
        );
        Ok(())
    }

    async fn delete_topic(&mut self, name: &str) -> LogResult<()> {
        self.cluster.fetch_metadata(Some(NO_TOPICS)).await?;

        let request = DeleteTopicsRequest::default()
            .with_topic_names(vec![protocol::topic_name(name)])
            .with_timeout_ms(self.timeout_ms());

        let controller = self.cluster.controller().await?;
        let response = controller.request(&request, versions::DELETE_TOPICS).await?;
        let result = response
            .responses
            .iter()
            .find(|r| r.name.as_ref().is_some_and(|n| n.as_str() == name))
            .ok_or_else(|| LogError::Protocol {
                message: format!("delete topics response has no entry for {name}"),
            })?;

        if result.error_code == error_codes::UNKNOWN_TOPIC_OR_PARTITION {
            return Err(LogError::UnknownTopic(name.to_string()));
        }
        protocol::check_error(result.error_code, None)?;

        debug!(topic = %name, broker_id = controller.broker_id(), "topic deletion triggered");
        Ok(())
    }

    fn close(&mut self) {
        self.cluster.close();
    }
}
