use crate::broker::{Delivery, EventPublisher};
use crate::config::KafkaConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::debug;

/// Acknowledgment mode is not configurable: a write only counts once the
/// whole in-sync replica set has it.
const ACKS: &str = "all";

#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    message_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(brokers: &[String], config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("acks", ACKS)
            .set("message.send.max.retries", config.retries.to_string())
            .set("retry.backoff.ms", config.retry_backoff_ms.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("compression.type", &config.compression)
            .set("linger.ms", config.linger_ms.to_string())
            .create()
            .map_err(Error::Kafka)?;

        Ok(Self {
            producer,
            message_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaProducer {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.message_timeout))
            .await
            .map_err(|(e, _)| Error::Kafka(e))?;

        Ok(Delivery { partition, offset })
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| Error::Timeout {
                message: format!("producer flush task failed: {}", e),
            })?
            .map_err(Error::Kafka)
    }

    async fn check_reachable(&self, topic: &str, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        let topic = topic.to_string();

        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&topic), Timeout::After(timeout))
        })
        .await
        .map_err(|e| Error::Timeout {
            message: format!("metadata task failed: {}", e),
        })?
        .map_err(Error::Kafka)?;

        debug!(
            brokers = metadata.brokers().len(),
            topics = metadata.topics().len(),
            "Broker metadata fetched"
        );
        Ok(())
    }
}
