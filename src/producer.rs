//! Synchronous publish path.

use crate::broker::{Delivery, EventPublisher};
use crate::event::EventRecord;
use crate::serializer::JsonSerializer;
use crate::stats::Stats;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

/// Publishes events to the configured topic, keyed by event id so that every
/// event with the same id lands on the same partition.
pub struct Producer {
    publisher: Arc<dyn EventPublisher>,
    topic: String,
    stats: Arc<Stats>,
}

impl Producer {
    pub fn new(publisher: Arc<dyn EventPublisher>, topic: impl Into<String>, stats: Arc<Stats>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            stats,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Writes `event` and waits for the broker's acknowledgment.
    ///
    /// # Errors
    ///
    /// - [`Error::Marshal`] if the event cannot be encoded; the broker is not contacted.
    /// - [`Error::Publish`] once the client has given up retrying.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn publish(&self, event: &EventRecord) -> Result<Delivery> {
        let payload = JsonSerializer::serialize(event)?;

        let delivery = self
            .publisher
            .send(&self.topic, &event.id, &payload)
            .await
            .map_err(|e| {
                error!("Failed to publish event: {}", e);
                Error::Publish {
                    message: e.to_string(),
                }
            })?;

        self.stats.increment_produced();
        info!(
            partition = delivery.partition,
            offset = delivery.offset,
            "Produced event"
        );
        Ok(delivery)
    }

    /// Flushes sends that are still waiting for acknowledgment.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        self.publisher.flush(timeout).await
    }

    pub async fn check_reachable(&self, timeout: Duration) -> Result<()> {
        self.publisher.check_reachable(&self.topic, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use chrono::Utc;

    fn event(id: &str) -> EventRecord {
        EventRecord {
            id: id.to_string(),
            event_type: "order.created".to_string(),
            timestamp: Utc::now(),
            payload: Default::default(),
        }
    }

    fn producer(broker: &MemoryBroker, retries: u32) -> (Producer, Arc<Stats>) {
        broker.create_topic("events", 4);
        let stats = Arc::new(Stats::new());
        let producer = Producer::new(Arc::new(broker.publisher(retries)), "events", stats.clone());
        (producer, stats)
    }

    #[tokio::test]
    async fn test_publish_counts_once_per_success() {
        let broker = MemoryBroker::new();
        let (producer, stats) = producer(&broker, 5);
        let before = Utc::now();

        producer.publish(&event("evt_1")).await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_produced, 1);
        assert!(snapshot.last_message_time.unwrap() >= before);
    }

    #[tokio::test]
    async fn test_retried_success_counts_once() {
        let broker = MemoryBroker::new();
        let (producer, stats) = producer(&broker, 5);

        broker.fail_next_sends(3);
        producer.publish(&event("evt_1")).await.unwrap();

        assert_eq!(stats.snapshot().messages_produced, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_publish_error() {
        let broker = MemoryBroker::new();
        let (producer, stats) = producer(&broker, 2);

        broker.fail_next_sends(10);
        let err = producer.publish(&event("evt_1")).await.unwrap_err();

        assert!(matches!(err, Error::Publish { .. }));
        assert_eq!(stats.snapshot().messages_produced, 0);
        assert_eq!(stats.snapshot().last_message_time, None);
    }

    #[tokio::test]
    async fn test_same_id_same_partition() {
        let broker = MemoryBroker::new();
        let (producer, _stats) = producer(&broker, 0);

        let first = producer.publish(&event("order-42")).await.unwrap();
        let second = producer.publish(&event("order-42")).await.unwrap();

        assert_eq!(first.partition, second.partition);
        assert!(second.offset > first.offset);
    }
}
