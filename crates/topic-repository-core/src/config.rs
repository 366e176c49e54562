//! Configuration types for the topic repository.
//!
//! Configuration is loaded from YAML files and validated before use.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Root configuration for the repository.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepositoryConfig {
    /// Kafka cluster connection configuration.
    pub kafka: KafkaConfig,

    /// Publish pipeline configuration.
    #[serde(default)]
    pub publish: PublishConfig,

    /// Topic creation defaults.
    #[serde(default)]
    pub topics: TopicsConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Kafka cluster connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Bootstrap server addresses.
    /// Supports environment variable expansion: "${KAFKA_BROKERS}"
    pub bootstrap_servers: Vec<String>,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Client id sent in every request header.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl KafkaConfig {
    /// Bootstrap servers with environment variables expanded.
    ///
    /// An entry expanding to a comma-separated list contributes every address.
    #[must_use]
    pub fn bootstrap_servers(&self) -> Vec<String> {
        self.bootstrap_servers
            .iter()
            .flat_map(|s| {
                expand_env_vars(s)
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// The bootstrap servers as one connection string.
    #[must_use]
    pub fn connection_string(&self) -> String {
        self.bootstrap_servers().join(",")
    }

    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Publish pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublishConfig {
    /// Time allowed for sends to be handed to the log, in milliseconds.
    /// The batch budget is this plus `kafka.request_timeout_ms`.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Maximum number of producer connections.
    #[serde(default = "default_producer_pool_size")]
    pub producer_pool_size: usize,

    /// Required acknowledgments: -1 for all in-sync replicas, 1 for the leader.
    #[serde(default = "default_acks")]
    pub acks: i16,
}

impl PublishConfig {
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Topic creation defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicsConfig {
    /// Partition count used when no capacity hint is given.
    #[serde(default = "default_partition_count")]
    pub default_partition_count: u32,

    /// Upper bound on the partition count of a new topic.
    #[serde(default = "default_max_partition_count")]
    pub max_partition_count: u32,

    /// Replication factor of new topics.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i16,

    /// `segment.ms` of new topics.
    #[serde(default = "default_segment_ms")]
    pub segment_ms: i64,

    /// Per-partition throughput by message size.
    #[serde(default = "default_load_table")]
    pub load_table: Vec<LoadTableRow>,
}

/// Sustained throughput a single partition handles for messages of a size.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct LoadTableRow {
    pub message_size_bytes: u32,
    pub partition_throughput_mb_per_sec: f64,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics are recorded.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

// Default value functions

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_client_id() -> String {
    "topic-repository".to_string()
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_producer_pool_size() -> usize {
    4
}

fn default_acks() -> i16 {
    -1
}

fn default_partition_count() -> u32 {
    8
}

fn default_max_partition_count() -> u32 {
    64
}

fn default_replication_factor() -> i16 {
    3
}

fn default_segment_ms() -> i64 {
    3_600_000 // 1 hour
}

fn default_load_table() -> Vec<LoadTableRow> {
    [(100, 2.5), (1_024, 10.0), (10_240, 25.0), (102_400, 40.0)]
        .into_iter()
        .map(|(size, mb)| LoadTableRow {
            message_size_bytes: size,
            partition_throughput_mb_per_sec: mb,
        })
        .collect()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            producer_pool_size: default_producer_pool_size(),
            acks: default_acks(),
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            default_partition_count: default_partition_count(),
            max_partition_count: default_max_partition_count(),
            replication_factor: default_replication_factor(),
            segment_ms: default_segment_ms(),
            load_table: default_load_table(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Configuration loading and validation

impl RepositoryConfig {
    /// Configuration with defaults for everything but the bootstrap servers.
    #[must_use]
    pub fn with_bootstrap_servers(servers: Vec<String>) -> Self {
        Self {
            kafka: KafkaConfig {
                bootstrap_servers: servers,
                connection_timeout_ms: default_connection_timeout_ms(),
                request_timeout_ms: default_request_timeout_ms(),
                client_id: default_client_id(),
            },
            publish: PublishConfig::default(),
            topics: TopicsConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        self.kafka.validate()?;
        self.publish.validate()?;
        self.topics.validate()
    }
}

impl KafkaConfig {
    /// Validate the connection configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no bootstrap server is configured or an address
    /// is not `host:port`.
    pub fn validate(&self) -> ConfigResult<()> {
        let servers = self.bootstrap_servers();
        if servers.is_empty() {
            return Err(ConfigError::NoBootstrapServers);
        }
        for server in &servers {
            parse_address(server)?;
        }
        Ok(())
    }
}

impl PublishConfig {
    /// Validate the publish configuration.
    ///
    /// # Errors
    ///
    /// Returns an error on an empty pool or an unsupported `acks` value.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.producer_pool_size == 0 {
            return Err(ConfigError::EmptyProducerPool);
        }
        // acks=0 would never produce an acknowledgment to wait on
        if self.acks != -1 && self.acks != 1 {
            return Err(ConfigError::UnsupportedAcks(self.acks));
        }
        Ok(())
    }
}

impl TopicsConfig {
    /// Validate the topic defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `default_partition_count` is zero or above `max_partition_count`
    /// - `replication_factor` is not positive
    /// - a load table row has a zero size or non-positive throughput
    pub fn validate(&self) -> ConfigResult<()> {
        if self.default_partition_count == 0
            || self.default_partition_count > self.max_partition_count
        {
            return Err(ConfigError::InvalidPartitionCounts {
                default_count: self.default_partition_count,
                max_count: self.max_partition_count,
            });
        }

        if self.replication_factor < 1 {
            return Err(ConfigError::InvalidReplicationFactor(self.replication_factor));
        }

        for row in &self.load_table {
            if row.message_size_bytes == 0
                || !(row.partition_throughput_mb_per_sec.is_finite()
                    && row.partition_throughput_mb_per_sec > 0.0)
            {
                return Err(ConfigError::InvalidLoadTableRow {
                    message_size_bytes: row.message_size_bytes,
                    throughput_mb_per_sec: row.partition_throughput_mb_per_sec,
                });
            }
        }

        Ok(())
    }
}

/// Split a `host:port` address.
///
/// # Errors
///
/// Returns an error if the address cannot be parsed.
pub fn parse_address(addr: &str) -> ConfigResult<(String, i32)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))?;
    let port: i32 = port
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
    if host.is_empty() || !(1..=65_535).contains(&port) {
        return Err(ConfigError::InvalidAddress(addr.to_string()));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RepositoryConfig {
        RepositoryConfig::with_bootstrap_servers(vec!["localhost:9092".to_string()])
    }

    #[test]
    fn test_valid_config_passes_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_from_yaml_string() {
        let yaml = r"
kafka:
  bootstrap_servers:
    - 'broker-1:9092'
    - 'broker-2:9092'
  client_id: 'events'
publish:
  send_timeout_ms: 1000
  producer_pool_size: 2
topics:
  max_partition_count: 32
  load_table:
    - message_size_bytes: 512
      partition_throughput_mb_per_sec: 4.0
";
        let config = RepositoryConfig::from_str(yaml).unwrap();
        assert_eq!(config.kafka.bootstrap_servers().len(), 2);
        assert_eq!(config.kafka.client_id, "events");
        assert_eq!(config.publish.send_timeout(), Duration::from_secs(1));
        assert_eq!(config.publish.producer_pool_size, 2);
        assert_eq!(config.topics.max_partition_count, 32);
        assert_eq!(config.topics.load_table.len(), 1);
    }

    #[test]
    fn test_default_values_applied() {
        let yaml = r"
kafka:
  bootstrap_servers:
    - 'localhost:9092'
";
        let config = RepositoryConfig::from_str(yaml).unwrap();
        assert_eq!(config.kafka.request_timeout_ms, 30_000);
        assert_eq!(config.publish.acks, -1);
        assert_eq!(config.topics.default_partition_count, 8);
        assert_eq!(config.topics.max_partition_count, 64);
        assert_eq!(config.topics.segment_ms, 3_600_000);
        assert!(!config.topics.load_table.is_empty());
        assert!(config.metrics.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_empty_bootstrap_servers() {
        let mut config = valid_config();
        config.kafka.bootstrap_servers.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoBootstrapServers)
        ));
    }

    #[test]
    fn test_invalid_address() {
        let mut config = valid_config();
        config.kafka.bootstrap_servers = vec!["localhost".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_zero_pool_size() {
        let mut config = valid_config();
        config.publish.producer_pool_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyProducerPool)
        ));
    }

    #[test]
    fn test_unsupported_acks() {
        let mut config = valid_config();
        config.publish.acks = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedAcks(0))
        ));
    }

    #[test]
    fn test_default_above_max_partitions() {
        let mut config = valid_config();
        config.topics.default_partition_count = 100;
        config.topics.max_partition_count = 30;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPartitionCounts { .. })
        ));
    }

    #[test]
    fn test_bad_load_table_row() {
        let mut config = valid_config();
        config.topics.load_table.push(LoadTableRow {
            message_size_bytes: 10,
            partition_throughput_mb_per_sec: 0.0,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLoadTableRow { .. })
        ));
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TEST_TOPIC_REPO_BROKERS", "kafka-a:9092, kafka-b:9093");

        let mut config = valid_config();
        config.kafka.bootstrap_servers = vec!["${TEST_TOPIC_REPO_BROKERS}".to_string()];

        assert_eq!(
            config.kafka.bootstrap_servers(),
            vec!["kafka-a:9092".to_string(), "kafka-b:9093".to_string()]
        );
        assert_eq!(config.kafka.connection_string(), "kafka-a:9092,kafka-b:9093");

        std::env::remove_var("TEST_TOPIC_REPO_BROKERS");
    }

    #[test]
    fn test_env_var_expansion_missing_var() {
        let mut config = valid_config();
        config.kafka.bootstrap_servers = vec!["${NONEXISTENT_TOPIC_REPO_VAR}".to_string()];
        assert!(config.kafka.bootstrap_servers().is_empty());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoBootstrapServers)
        ));
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("kafka.internal:9093").unwrap(),
            ("kafka.internal".to_string(), 9093)
        );
        assert!(parse_address(":9092").is_err());
        assert!(parse_address("host:0").is_err());
        assert!(parse_address("host:port").is_err());
    }
}
