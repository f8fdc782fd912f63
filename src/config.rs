use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub create_topic: bool,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

/// Where a group starts reading a partition it has never committed on.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    /// Skip history and only see records written after the first join.
    #[default]
    Newest,
    /// Replay the partition from its beginning.
    Oldest,
}

impl InitialOffset {
    pub fn as_auto_offset_reset(&self) -> &'static str {
        match self {
            InitialOffset::Newest => "latest",
            InitialOffset::Oldest => "earliest",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default)]
    pub initial_offset: InitialOffset,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_rejoin_backoff_ms")]
    pub rejoin_backoff_ms: u64,
    /// Consecutive failed joins tolerated before the session gives up. 0 retries forever.
    #[serde(default = "default_max_rejoin_attempts")]
    pub max_rejoin_attempts: u32,
    #[serde(default = "default_handler_retry_backoff_ms")]
    pub handler_retry_backoff_ms: u64,
    #[serde(default = "default_revoke_timeout_ms")]
    pub revoke_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            initial_offset: InitialOffset::default(),
            session_timeout_ms: default_session_timeout_ms(),
            rejoin_backoff_ms: default_rejoin_backoff_ms(),
            max_rejoin_attempts: default_max_rejoin_attempts(),
            handler_retry_backoff_ms: default_handler_retry_backoff_ms(),
            revoke_timeout_ms: default_revoke_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Config {
    /// Loads a config file, letting `EVENT_GATEWAY_*` variables override it
    /// (`EVENT_GATEWAY_KAFKA__TOPIC=orders`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("EVENT_GATEWAY")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from the flat `KAFKA_BROKERS`, `KAFKA_TOPIC`,
    /// `KAFKA_GROUP_ID` and `PORT` variables, falling back to defaults.
    ///
    /// Topic and group default to the names env-only deployments have always
    /// used, so an unset variable never moves them to a different topic.
    pub fn from_env() -> Result<Self> {
        let brokers = std::env::var("KAFKA_BROKERS")
            .ok()
            .filter(|value| !value.is_empty())
            .map(|value| split_brokers(&value))
            .unwrap_or_else(|| vec!["localhost:9092".to_string()]);

        let settings = config::Config::builder()
            .set_default("kafka.brokers", brokers)
            .and_then(|b| b.set_default("kafka.topic", LEGACY_TOPIC))
            .and_then(|b| b.set_default("consumer.group_id", LEGACY_GROUP_ID))
            .and_then(|b| b.set_override_option("kafka.topic", non_empty_var("KAFKA_TOPIC")))
            .and_then(|b| {
                b.set_override_option("consumer.group_id", non_empty_var("KAFKA_GROUP_ID"))
            })
            .and_then(|b| b.set_override_option("server.port", non_empty_var("PORT")))
            .map_err(|e| Error::Config(e.to_string()))?
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::Config("kafka.brokers must not be empty".to_string()));
        }
        if self.kafka.topic.is_empty() {
            return Err(Error::Config("kafka.topic must not be empty".to_string()));
        }
        if self.consumer.group_id.is_empty() {
            return Err(Error::Config("consumer.group_id must not be empty".to_string()));
        }
        if self.kafka.partitions < 1 {
            return Err(Error::Config(format!(
                "kafka.partitions must be at least 1, got {}",
                self.kafka.partitions
            )));
        }
        Ok(())
    }

    pub fn bootstrap_servers(&self) -> String {
        self.kafka.brokers.join(",")
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

const LEGACY_TOPIC: &str = "babylon-events";
const LEGACY_GROUP_ID: &str = "babylon-consumer-group";

fn split_brokers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn default_topic() -> String {
    "events".to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_linger_ms() -> u32 {
    5
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_partitions() -> i32 {
    3
}

fn default_replication_factor() -> i32 {
    1
}

fn default_group_id() -> String {
    "event-gateway".to_string()
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_rejoin_backoff_ms() -> u64 {
    2_000
}

fn default_max_rejoin_attempts() -> u32 {
    10
}

fn default_handler_retry_backoff_ms() -> u64 {
    1_000
}

fn default_revoke_timeout_ms() -> u64 {
    30_000
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toml_file() -> NamedTempFile {
        tempfile::Builder::new().suffix(".toml").tempfile().unwrap()
    }

    #[test]
    fn test_from_file_applies_defaults() {
        let mut file = toml_file();
        writeln!(
            file,
            r#"
[kafka]
brokers = ["kafka-1:9092", "kafka-2:9092"]
topic = "orders"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.bootstrap_servers(), "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.kafka.topic, "orders");
        assert_eq!(config.kafka.compression, "snappy");
        assert_eq!(config.kafka.retries, 5);
        assert_eq!(config.consumer.group_id, "event-gateway");
        assert_eq!(config.consumer.initial_offset, InitialOffset::Newest);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_from_file_reads_consumer_section() {
        let mut file = toml_file();
        writeln!(
            file,
            r#"
[kafka]
brokers = ["localhost:9092"]

[consumer]
group_id = "billing"
initial_offset = "oldest"
max_rejoin_attempts = 0
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.consumer.group_id, "billing");
        assert_eq!(config.consumer.initial_offset, InitialOffset::Oldest);
        assert_eq!(config.consumer.max_rejoin_attempts, 0);
        assert_eq!(config.consumer.initial_offset.as_auto_offset_reset(), "earliest");
    }

    #[test]
    fn test_validate_rejects_empty_brokers() {
        let mut file = toml_file();
        writeln!(file, "[kafka]\nbrokers = []\n").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_env_keeps_legacy_topic_and_group() {
        std::env::remove_var("KAFKA_TOPIC");
        std::env::remove_var("KAFKA_GROUP_ID");

        let config = Config::from_env().unwrap();

        assert_eq!(config.kafka.topic, "babylon-events");
        assert_eq!(config.consumer.group_id, "babylon-consumer-group");
        assert_eq!(config.kafka.compression, "snappy");
    }

    #[test]
    fn test_split_brokers() {
        assert_eq!(
            split_brokers("a:9092, b:9092,,"),
            vec!["a:9092".to_string(), "b:9092".to_string()]
        );
    }
}
