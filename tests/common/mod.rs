#![allow(dead_code)]

use async_trait::async_trait;
use event_gateway::broker::{EventPublisher, MemoryBroker};
use event_gateway::config::{Config, ConsumerConfig, InitialOffset, KafkaConfig, ServerConfig};
use event_gateway::consumer::{ConsumerGroupSession, EventHandler, SessionConfig, SessionState};
use event_gateway::serializer::JsonSerializer;
use event_gateway::{Backends, EventRecord, Gateway, Stats};
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const TOPIC: &str = "events";
pub const GROUP: &str = "test-group";

/// Configuration for gateways running on a `MemoryBroker`.
pub fn get_test_config() -> Config {
    Config {
        kafka: KafkaConfig {
            brokers: vec!["memory".to_string()],
            topic: TOPIC.to_string(),
            compression: "none".to_string(),
            retries: 3,
            retry_backoff_ms: 10,
            message_timeout_ms: 5_000,
            linger_ms: 0,
            request_timeout_ms: 1_000,
            create_topic: false,
            partitions: 4,
            replication_factor: 1,
        },
        consumer: ConsumerConfig {
            group_id: GROUP.to_string(),
            initial_offset: InitialOffset::Newest,
            session_timeout_ms: 6_000,
            rejoin_backoff_ms: 20,
            max_rejoin_attempts: 0,
            handler_retry_backoff_ms: 10,
            revoke_timeout_ms: 5_000,
        },
        server: ServerConfig {
            port: 0,
            shutdown_timeout_secs: 5,
        },
    }
}

/// Configuration for the ignored tests that need a running Kafka.
pub fn get_kafka_test_config() -> Config {
    let mut config = get_test_config();
    config.kafka.brokers = env::var("TEST_KAFKA_BROKERS")
        .unwrap_or_else(|_| "localhost:9092".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();
    config.kafka.topic = format!("event_gateway_test_{}", std::process::id());
    config.kafka.create_topic = true;
    config.kafka.partitions = 3;
    config.consumer.group_id = format!("event_gateway_test_group_{}", std::process::id());
    // Fresh topic, so reading from the start only sees this test's events.
    config.consumer.initial_offset = InitialOffset::Oldest;
    config
}

pub fn session_config() -> SessionConfig {
    SessionConfig::from_config(&get_test_config())
}

/// Records handler calls across every member that shares it.
#[derive(Default)]
pub struct DeliveryLog {
    active: Mutex<HashSet<String>>,
    deliveries: Mutex<Vec<(String, EventRecord)>>,
    attempts: AtomicUsize,
    overlaps: AtomicUsize,
}

impl DeliveryLog {
    pub fn deliveries(&self) -> Vec<(String, EventRecord)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.deliveries().into_iter().map(|(_, event)| event).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.id).collect()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Times an event was being handled by two calls at once.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

pub struct RecordingHandler {
    name: String,
    log: Arc<DeliveryLog>,
    delay: Duration,
    failures_left: AtomicUsize,
}

impl RecordingHandler {
    pub fn new(name: &str, log: Arc<DeliveryLog>) -> Self {
        Self {
            name: name.to_string(),
            log,
            delay: Duration::ZERO,
            failures_left: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails the next `failures` calls.
    pub fn failing(self, failures: usize) -> Self {
        self.failures_left.store(failures, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &EventRecord) -> anyhow::Result<()> {
        self.log.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.log.active.lock().unwrap().insert(event.id.clone()) {
            self.log.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        self.log.active.lock().unwrap().remove(&event.id);
        if failed {
            anyhow::bail!("simulated handler failure for {}", event.id);
        }

        self.log
            .deliveries
            .lock()
            .unwrap()
            .push((self.name.clone(), event.clone()));
        Ok(())
    }
}

pub fn event(id: &str, seq: u64) -> EventRecord {
    EventRecord {
        id: id.to_string(),
        event_type: "order.created".to_string(),
        timestamp: Utc::now(),
        payload: json!({ "seq": seq }).as_object().cloned().unwrap(),
    }
}

/// Writes an event straight to the broker, bypassing the gateway.
pub async fn publish(broker: &MemoryBroker, event: &EventRecord) {
    let bytes = JsonSerializer::serialize(event).unwrap();
    broker
        .publisher(0)
        .send(TOPIC, &event.id, &bytes)
        .await
        .unwrap();
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_consuming(state: &mut watch::Receiver<SessionState>) -> SessionState {
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| matches!(s, SessionState::Consuming { .. })),
    )
    .await
    .expect("session did not start consuming")
    .expect("session ended")
    .clone()
}

pub fn new_session(
    broker: &MemoryBroker,
    handler: Arc<dyn EventHandler>,
    stats: Arc<Stats>,
) -> ConsumerGroupSession {
    let member = broker.member(GROUP, InitialOffset::Newest);
    ConsumerGroupSession::new(Arc::new(member), handler, stats, session_config())
}

/// Starts a gateway on `broker` and waits until its session consumes.
pub async fn start_gateway(broker: &MemoryBroker, handler: Arc<dyn EventHandler>) -> Gateway {
    let config = get_test_config();
    let backends = Backends::memory(broker, &config);
    let gateway = Gateway::start(config, backends, handler).await.unwrap();
    wait_for_consuming(&mut gateway.watch_session()).await;
    gateway
}
