use super::claim::PartitionClaim;
use super::handler::EventHandler;
use crate::broker::{GroupEvent, GroupMember};
use crate::config::Config;
use crate::stats::Stats;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const FETCH_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Lifecycle of a [`ConsumerGroupSession`], observable through [`ConsumerGroupSession::state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Joining,
    Consuming { generation: i32, partitions: Vec<i32> },
    Revoking,
    Closed,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub topic: String,
    pub rejoin_backoff: Duration,
    /// Consecutive failures tolerated before giving up. 0 never gives up.
    pub max_rejoin_attempts: u32,
    pub handler_retry_backoff: Duration,
    pub fetch_retry_backoff: Duration,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            topic: config.kafka.topic.clone(),
            rejoin_backoff: Duration::from_millis(config.consumer.rejoin_backoff_ms),
            max_rejoin_attempts: config.consumer.max_rejoin_attempts,
            handler_retry_backoff: Duration::from_millis(config.consumer.handler_retry_backoff_ms),
            fetch_retry_backoff: FETCH_RETRY_BACKOFF,
        }
    }
}

struct ClaimHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Long-running membership in the consumer group.
///
/// Joins, runs one [`PartitionClaim`] per assigned partition, releases claims
/// before acknowledging a revocation and rejoins after transient coordination
/// failures. A fatal broker error ends the session with an error.
pub struct ConsumerGroupSession {
    member: Arc<dyn GroupMember>,
    handler: Arc<dyn EventHandler>,
    stats: Arc<Stats>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
}

impl ConsumerGroupSession {
    pub fn new(
        member: Arc<dyn GroupMember>,
        handler: Arc<dyn EventHandler>,
        stats: Arc<Stats>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Joining);
        Self {
            member,
            handler,
            stats,
            config,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Runs until `shutdown` is cancelled or a fatal error occurs. Always
    /// leaves the group before returning.
    #[instrument(skip_all, fields(topic = %self.config.topic))]
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let result = self.run_until_stopped(&shutdown).await;

        if let Err(e) = self.member.leave().await {
            warn!("Failed to leave consumer group cleanly: {}", e);
        }

        match &result {
            Ok(()) => {
                info!("Consumer group session closed");
                self.set_state(SessionState::Closed);
            }
            Err(e) => {
                error!("Consumer group session failed: {}", e);
                self.set_state(SessionState::Failed {
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_until_stopped(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut failures = 0u32;

        loop {
            self.set_state(SessionState::Joining);
            info!("Joining consumer group");

            let joined = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                joined = self.member.join(&self.config.topic) => joined,
            };

            let outcome = match joined {
                Ok(()) => self.consume(shutdown, &mut failures).await,
                Err(e) => Err(e),
            };

            let error = match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => e,
            };

            failures += 1;
            let max = self.config.max_rejoin_attempts;
            if max > 0 && failures >= max {
                return Err(Error::Coordination {
                    message: format!("giving up after {} consecutive failures: {}", failures, error),
                });
            }

            warn!(
                attempt = failures,
                backoff_ms = self.config.rejoin_backoff.as_millis() as u64,
                "Group coordination failed, rejoining: {}",
                error
            );
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.rejoin_backoff) => {}
            }
        }
    }

    /// Follows assignments until shutdown or an error. All claims are
    /// stopped before this returns.
    async fn consume(&self, shutdown: &CancellationToken, failures: &mut u32) -> Result<()> {
        let mut claims: HashMap<i32, ClaimHandle> = HashMap::new();
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                Some(error) = failure_rx.recv() => break Err(error),
                event = self.member.next_event() => match event {
                    Ok(GroupEvent::Assigned { generation, partitions }) => {
                        *failures = 0;
                        if let Err(e) = self
                            .claim(generation, &partitions, &mut claims, shutdown, &failure_tx)
                            .await
                        {
                            break Err(e);
                        }
                        let mut claimed: Vec<i32> = claims.keys().copied().collect();
                        claimed.sort_unstable();
                        info!(generation, partitions = ?claimed, "Consuming");
                        self.set_state(SessionState::Consuming {
                            generation,
                            partitions: claimed,
                        });
                    }
                    Ok(GroupEvent::Revoked { partitions, ack }) => {
                        self.set_state(SessionState::Revoking);
                        info!(partitions = ?partitions, "Releasing revoked partitions");
                        release(&mut claims, Some(partitions.as_slice())).await;
                        ack.done();
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        release(&mut claims, None).await;
        result
    }

    async fn claim(
        &self,
        generation: i32,
        partitions: &[i32],
        claims: &mut HashMap<i32, ClaimHandle>,
        shutdown: &CancellationToken,
        failures: &mpsc::UnboundedSender<Error>,
    ) -> Result<()> {
        let stale: Vec<i32> = claims
            .keys()
            .filter(|partition| !partitions.contains(partition))
            .copied()
            .collect();
        if !stale.is_empty() {
            release(claims, Some(stale.as_slice())).await;
        }

        for &partition in partitions {
            if claims.contains_key(&partition) {
                continue;
            }
            // A partition that cannot be opened sends the session back to joining.
            let stream = self.member.open_partition(partition).await?;

            let token = shutdown.child_token();
            let claim = PartitionClaim {
                partition,
                generation,
                member: Arc::clone(&self.member),
                handler: Arc::clone(&self.handler),
                stats: Arc::clone(&self.stats),
                token: token.clone(),
                failures: failures.clone(),
                handler_retry_backoff: self.config.handler_retry_backoff,
                fetch_retry_backoff: self.config.fetch_retry_backoff,
            };
            let task = tokio::spawn(claim.run(stream));
            claims.insert(partition, ClaimHandle { token, task });
        }
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}

/// Stops the claims on `only` (or all of them) and waits until each has
/// finished its in-flight record.
async fn release(claims: &mut HashMap<i32, ClaimHandle>, only: Option<&[i32]>) {
    let partitions: Vec<i32> = match only {
        Some(partitions) => partitions.to_vec(),
        None => claims.keys().copied().collect(),
    };

    let stopping: Vec<(i32, ClaimHandle)> = partitions
        .into_iter()
        .filter_map(|partition| claims.remove(&partition).map(|handle| (partition, handle)))
        .collect();

    for (_, handle) in &stopping {
        handle.token.cancel();
    }
    for (partition, handle) in stopping {
        if let Err(e) = handle.task.await {
            error!(partition, "Partition claim panicked: {}", e);
        }
    }
}
