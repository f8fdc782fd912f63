//! rdkafka implementation of [`GroupMember`].
//!
//! librdkafka runs the group protocol itself. Rebalance callbacks fire on
//! whichever thread polls the main consumer queue, so a driver task keeps
//! polling it and [`GatewayContext`] forwards assignments and revocations to
//! the session as [`GroupEvent`]s. Every claimed partition is split into its
//! own queue, which gives the session one independent pull loop per claim.
//!
//! Commits store `offset + 1` and let the auto-commit timer flush them;
//! revocation and leave force a synchronous commit of everything stored.
//!
//! The revoke callback blocks its thread until the claims have stopped, so the
//! member only runs on a multi-threaded tokio runtime.

use crate::broker::{BrokerRecord, GroupEvent, GroupMember, PartitionStream, RevokeAck};
use crate::config::Config;
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Events = mpsc::UnboundedSender<Result<GroupEvent>>;

pub struct GatewayContext {
    events: Events,
    generation: AtomicI32,
    revoke_timeout: Duration,
    closing: AtomicBool,
}

impl ClientContext for GatewayContext {}

impl ConsumerContext for GatewayContext {
    fn pre_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let Rebalance::Revoke(tpl) = rebalance else {
            return;
        };
        let partitions = partitions_of(tpl);
        info!(partitions = ?partitions, "Partitions revoked");

        if !self.closing.load(Ordering::Acquire) {
            let (ack, waiter) = RevokeAck::channel();
            let sent = self
                .events
                .send(Ok(GroupEvent::Revoked {
                    partitions: partitions.clone(),
                    ack,
                }))
                .is_ok();
            // Blocks this polling thread until the partition loops have stopped.
            if sent && !block_on_worker(|| waiter.wait(self.revoke_timeout)) {
                warn!(partitions = ?partitions, "Timed out waiting for partition loops to stop");
            }
        }

        match consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => debug!("Committed stored offsets before revocation"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!("Failed to commit offsets before revocation: {}", e),
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                let partitions = partitions_of(tpl);
                info!(generation, partitions = ?partitions, "Partitions assigned");
                let _ = self.events.send(Ok(GroupEvent::Assigned {
                    generation,
                    partitions,
                }));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                error!("Rebalance failed: {}", e);
                let _ = self.events.send(Err(Error::Coordination {
                    message: format!("rebalance failed: {}", e),
                }));
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "Offsets committed"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!("Offset commit failed: {}", e),
        }
    }
}

/// Runs a blocking wait, moving other tasks off this worker first.
fn block_on_worker<T>(wait: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(wait),
        _ => wait(),
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<i32> {
    let mut partitions: Vec<i32> = tpl.elements().iter().map(|e| e.partition()).collect();
    partitions.sort_unstable();
    partitions
}

pub struct KafkaGroupMember {
    consumer: Arc<StreamConsumer<GatewayContext>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<GroupEvent>>>,
    topic: Mutex<Option<String>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl KafkaGroupMember {
    pub fn new(config: &Config) -> Result<Self> {
        if let Ok(handle) = Handle::try_current() {
            if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
                return Err(Error::Config(
                    "the Kafka consumer needs a multi-threaded tokio runtime".to_string(),
                ));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let context = GatewayContext {
            events: tx,
            generation: AtomicI32::new(0),
            revoke_timeout: Duration::from_millis(config.consumer.revoke_timeout_ms),
            closing: AtomicBool::new(false),
        };

        let consumer: StreamConsumer<GatewayContext> = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("group.id", &config.consumer.group_id)
            .set("partition.assignment.strategy", "roundrobin")
            .set(
                "auto.offset.reset",
                config.consumer.initial_offset.as_auto_offset_reset(),
            )
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", config.consumer.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false")
            .create_with_context(context)
            .map_err(Error::Kafka)?;

        Ok(Self {
            consumer: Arc::new(consumer),
            events: tokio::sync::Mutex::new(rx),
            topic: Mutex::new(None),
            driver: Mutex::new(None),
        })
    }

    fn topic(&self) -> Result<String> {
        self.topic
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| Error::Coordination {
                message: "member has not joined a topic".to_string(),
            })
    }

    fn spawn_driver(&self) {
        let mut driver = self.driver.lock().unwrap_or_else(|p| p.into_inner());
        if driver.is_some() {
            return;
        }

        let consumer = Arc::clone(&self.consumer);
        *driver = Some(tokio::spawn(async move {
            loop {
                match consumer.recv().await {
                    // Fetched before its partition queue was split off.
                    Ok(message) => {
                        let (topic, partition, offset) =
                            (message.topic().to_string(), message.partition(), message.offset());
                        drop(message);
                        debug!(partition, offset, "Rewinding record seen on the main queue");
                        if let Err(e) = consumer.seek(
                            &topic,
                            partition,
                            Offset::Offset(offset),
                            Duration::from_secs(1),
                        ) {
                            warn!(partition, offset, "Failed to rewind partition: {}", e);
                        }
                    }
                    Err(e) => {
                        let error = Error::Kafka(e);
                        if error.is_fatal() {
                            error!("Fatal consumer error: {}", error);
                            let _ = consumer.context().events.send(Err(error));
                        } else {
                            warn!("Consumer error: {}", error);
                        }
                    }
                }
            }
        }));
    }

    /// Keeps the driver polling until librdkafka has served the revocation
    /// queued by `unsubscribe`, which is when it sends LeaveGroup.
    async fn wait_until_unassigned(&self) {
        let unassigned = async {
            loop {
                match self.consumer.assignment() {
                    Ok(tpl) if tpl.count() == 0 => return,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Failed to read assignment while leaving: {}", e);
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        let timeout = self.consumer.context().revoke_timeout;
        if tokio::time::timeout(timeout, unassigned).await.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "Partitions still assigned after leaving");
        }
    }

    fn stop_driver(&self) {
        if let Some(driver) = self.driver.lock().unwrap_or_else(|p| p.into_inner()).take() {
            driver.abort();
        }
    }
}

#[async_trait]
impl GroupMember for KafkaGroupMember {
    async fn join(&self, topic: &str) -> Result<()> {
        self.consumer.context().closing.store(false, Ordering::Release);
        self.consumer.subscribe(&[topic]).map_err(Error::Kafka)?;
        *self.topic.lock().unwrap_or_else(|p| p.into_inner()) = Some(topic.to_string());
        self.spawn_driver();
        info!(topic, "Subscribed to topic");
        Ok(())
    }

    async fn next_event(&self) -> Result<GroupEvent> {
        self.events
            .lock()
            .await
            .recv()
            .await
            .unwrap_or_else(|| {
                Err(Error::Coordination {
                    message: "consumer context dropped".to_string(),
                })
            })
    }

    async fn open_partition(&self, partition: i32) -> Result<Box<dyn PartitionStream>> {
        let topic = self.topic()?;
        let queue = self
            .consumer
            .split_partition_queue(&topic, partition)
            .ok_or(Error::NotAssigned { partition })?;
        Ok(Box::new(KafkaPartitionStream { queue }))
    }

    async fn commit(&self, partition: i32, next_offset: i64) -> Result<()> {
        let topic = self.topic()?;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&topic, partition, Offset::Offset(next_offset))
            .map_err(Error::Kafka)?;
        self.consumer.store_offsets(&tpl).map_err(Error::Kafka)
    }

    async fn leave(&self) -> Result<()> {
        self.consumer.context().closing.store(true, Ordering::Release);

        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!("Failed to commit offsets on leave: {}", e),
        }

        self.consumer.unsubscribe();
        self.wait_until_unassigned().await;
        self.stop_driver();
        info!("Left consumer group");
        Ok(())
    }
}

impl Drop for KafkaGroupMember {
    fn drop(&mut self) {
        self.stop_driver();
    }
}

struct KafkaPartitionStream {
    queue: StreamPartitionQueue<GatewayContext>,
}

#[async_trait]
impl PartitionStream for KafkaPartitionStream {
    async fn next_record(&mut self) -> Result<BrokerRecord> {
        let message = self.queue.recv().await.map_err(Error::Kafka)?;
        Ok(BrokerRecord {
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        serde_json::from_value(serde_json::json!({
            "kafka": { "brokers": ["localhost:9092"] }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_current_thread_runtime_is_rejected() {
        let err = KafkaGroupMember::new(&test_config()).err().unwrap();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_created_on_multi_thread_runtime() {
        assert!(KafkaGroupMember::new(&test_config()).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[ignore] // Requires running Kafka
    async fn test_leave_serves_revocation_before_returning() {
        let brokers =
            std::env::var("TEST_KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
        let config: Config = serde_json::from_value(serde_json::json!({
            "kafka": { "brokers": [brokers], "partitions": 2 },
            "consumer": { "group_id": format!("event-gateway-leave-{}", std::process::id()) }
        }))
        .unwrap();
        let topic = format!("event-gateway-leave-{}", std::process::id());
        let manager = crate::kafka::TopicManager::new(&config.kafka).unwrap();
        manager.ensure_topic_exists(&topic).await.unwrap();

        let member = KafkaGroupMember::new(&config).unwrap();
        member.join(&topic).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(30), member.next_event())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, GroupEvent::Assigned { .. }));

        member.leave().await.unwrap();

        assert_eq!(member.consumer.assignment().unwrap().count(), 0);
        drop(member);
        manager.delete_topic(&topic).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_revoke_wait_runs_on_worker() {
        let (ack, waiter) = RevokeAck::channel();
        let waited = tokio::spawn(async move {
            block_on_worker(|| waiter.wait(Duration::from_secs(5)))
        });
        ack.done();
        assert!(waited.await.unwrap());
    }
}
