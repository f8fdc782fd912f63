//! Composition root: producer, consumer group session and stats behind the
//! submit/health/stats operations, plus the ordered shutdown sequence.

use crate::broker::{EventPublisher, GroupMember, MemoryBroker};
use crate::config::Config;
use crate::consumer::{ConsumerGroupSession, EventHandler, SessionConfig, SessionState};
use crate::event::{EventSubmission, IdGenerator};
use crate::kafka::{KafkaGroupMember, KafkaProducer, TopicManager};
use crate::producer::Producer;
use crate::stats::{Stats, StatsSnapshot};
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, instrument, warn};

pub const SERVICE_NAME: &str = "event-gateway";

/// Broker clients the gateway runs on.
pub struct Backends {
    pub publisher: Arc<dyn EventPublisher>,
    pub member: Arc<dyn GroupMember>,
}

impl Backends {
    /// rdkafka clients. Creates the topic first when `kafka.create_topic` is set.
    pub async fn kafka(config: &Config) -> Result<Self> {
        if config.kafka.create_topic {
            TopicManager::new(&config.kafka)?
                .ensure_topic_exists(&config.kafka.topic)
                .await?;
        }

        let publisher = KafkaProducer::new(&config.kafka.brokers, &config.kafka)?;
        let member = KafkaGroupMember::new(config)?;
        Ok(Self {
            publisher: Arc::new(publisher),
            member: Arc::new(member),
        })
    }

    /// Clients of an in-process broker. The topic is created if missing.
    pub fn memory(broker: &MemoryBroker, config: &Config) -> Self {
        broker.create_topic(&config.kafka.topic, config.kafka.partitions);
        Self {
            publisher: Arc::new(broker.publisher(config.kafka.retries)),
            member: Arc::new(broker.member(&config.consumer.group_id, config.consumer.initial_offset)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub success: bool,
    pub event_id: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub broker_reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.broker_reachable
    }
}

/// Steps of [`Gateway::shutdown`] that overran their timeout or failed.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub warnings: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, warning: String) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }
}

pub struct Gateway {
    producer: std::sync::Mutex<Option<Arc<Producer>>>,
    stats: Arc<Stats>,
    ids: IdGenerator,
    request_timeout: Duration,
    accepting: AtomicBool,
    requests: TaskTracker,
    cancel: CancellationToken,
    session: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
    session_state: watch::Receiver<SessionState>,
    backends: std::sync::Mutex<Option<Backends>>,
}

impl Gateway {
    pub async fn start(
        config: Config,
        backends: Backends,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        Self::start_with_stats(config, backends, handler, Arc::new(Stats::new())).await
    }

    /// Starts the gateway and its consumer group session in the background.
    pub async fn start_with_stats(
        config: Config,
        backends: Backends,
        handler: Arc<dyn EventHandler>,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        config.validate()?;

        let producer = Producer::new(
            Arc::clone(&backends.publisher),
            config.kafka.topic.clone(),
            Arc::clone(&stats),
        );
        let session = ConsumerGroupSession::new(
            Arc::clone(&backends.member),
            handler,
            Arc::clone(&stats),
            SessionConfig::from_config(&config),
        );
        let session_state = session.state();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(session.run(cancel.clone()));

        info!(
            topic = %config.kafka.topic,
            group_id = %config.consumer.group_id,
            "Gateway started"
        );

        Ok(Self {
            producer: std::sync::Mutex::new(Some(Arc::new(producer))),
            stats,
            ids: IdGenerator::new(),
            request_timeout: Duration::from_millis(config.kafka.request_timeout_ms),
            accepting: AtomicBool::new(true),
            requests: TaskTracker::new(),
            cancel,
            session: tokio::sync::Mutex::new(Some(task)),
            session_state,
            backends: std::sync::Mutex::new(Some(backends)),
        })
    }

    /// Normalizes and publishes one event.
    ///
    /// # Errors
    ///
    /// - [`Error::Shutdown`] once shutdown has begun.
    /// - [`Error::Validation`] if `type` is missing.
    /// - [`Error::Publish`] if the broker did not acknowledge the write.
    pub async fn submit(&self, submission: EventSubmission) -> Result<SubmitReceipt> {
        // Tracked before the accepting check so shutdown cannot miss it.
        self.requests.track_future(self.submit_tracked(submission)).await
    }

    /// Same as [`Gateway::submit`] for a raw JSON body.
    pub async fn submit_json(&self, body: &[u8]) -> Result<SubmitReceipt> {
        let submission = EventSubmission::from_json(body)?;
        self.submit(submission).await
    }

    #[instrument(skip_all)]
    async fn submit_tracked(&self, submission: EventSubmission) -> Result<SubmitReceipt> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let producer = self.producer().ok_or(Error::Shutdown)?;
        let event = submission.normalize(&self.ids, Utc::now())?;
        let delivery = producer.publish(&event).await?;

        Ok(SubmitReceipt {
            success: true,
            event_id: event.id,
            partition: delivery.partition,
            offset: delivery.offset,
        })
    }

    pub async fn health(&self) -> HealthReport {
        let reachable = match self.producer() {
            Some(producer) => producer.check_reachable(self.request_timeout).await,
            None => Err(Error::Shutdown),
        };
        match reachable {
            Ok(()) => HealthReport {
                status: "healthy",
                service: SERVICE_NAME,
                broker_reachable: true,
                error: None,
            },
            Err(e) => {
                warn!("Broker health check failed: {}", e);
                HealthReport {
                    status: "unhealthy",
                    service: SERVICE_NAME,
                    broker_reachable: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn producer(&self) -> Option<Arc<Producer>> {
        self.producer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state.borrow().clone()
    }

    pub fn watch_session(&self) -> watch::Receiver<SessionState> {
        self.session_state.clone()
    }

    /// Runs the shutdown sequence. Each step gets `timeout`; a step that
    /// overruns or fails is recorded in the report and the next one runs anyway.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        info!(timeout_ms = timeout.as_millis() as u64, "Shutting down gateway");

        // 1. Stop accepting submits and drain the ones in flight.
        self.accepting.store(false, Ordering::SeqCst);
        self.requests.close();
        match tokio::time::timeout(timeout, self.requests.wait()).await {
            Ok(()) => info!("In-flight submits drained"),
            Err(_) => report.warn(format!(
                "{} submit requests still in flight after {:?}",
                self.requests.len(),
                timeout
            )),
        }

        // 2. Stop the consumer session; it finishes in-flight handler calls
        //    and leaves the group.
        self.cancel.cancel();
        let task = self.session.lock().await.take();
        if let Some(mut task) = task {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(Ok(()))) => info!("Consumer group session stopped"),
                Ok(Ok(Err(e))) => {
                    report.warn(format!("consumer group session ended with error: {}", e))
                }
                Ok(Err(e)) => report.warn(format!("consumer group session panicked: {}", e)),
                Err(_) => {
                    task.abort();
                    report.warn(format!(
                        "consumer group session did not stop within {:?}",
                        timeout
                    ));
                }
            }
        }

        // 3. Flush the producer.
        if let Some(producer) = self.producer() {
            match tokio::time::timeout(timeout, producer.close(timeout)).await {
                Ok(Ok(())) => info!("Producer flushed"),
                Ok(Err(e)) => report.warn(format!("producer flush failed: {}", e)),
                Err(_) => {
                    report.warn(format!("producer flush did not finish within {:?}", timeout))
                }
            }
        }

        // 4. Release broker clients, the producer's included. Dropping
        //    rdkafka clients blocks.
        let producer = self.producer.lock().unwrap_or_else(|p| p.into_inner()).take();
        let backends = self
            .backends
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if producer.is_some() || backends.is_some() {
            let release = tokio::task::spawn_blocking(move || {
                drop(producer);
                drop(backends);
            });
            match tokio::time::timeout(timeout, release).await {
                Ok(_) => info!("Broker clients released"),
                Err(_) => report.warn(format!(
                    "broker clients not released within {:?}",
                    timeout
                )),
            }
        }

        if report.is_clean() {
            info!("Gateway shut down cleanly");
        } else {
            warn!(warnings = report.warnings.len(), "Gateway shut down with warnings");
        }
        report
    }
}
