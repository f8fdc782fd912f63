use super::handler::EventHandler;
use crate::broker::{BrokerRecord, GroupMember, PartitionStream};
use crate::serializer::JsonSerializer;
use crate::stats::Stats;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive fetch failures after which the claim hands the error to the
/// session, which then rejoins the group.
const MAX_FETCH_FAILURES: u32 = 3;

/// Pull loop for one partition owned by this member in the current generation.
///
/// Records are handled strictly in offset order. The offset is committed only
/// after the handler succeeded, so anything not committed when the claim stops
/// is delivered again to whoever owns the partition next.
pub(crate) struct PartitionClaim {
    pub(crate) partition: i32,
    pub(crate) generation: i32,
    pub(crate) member: Arc<dyn GroupMember>,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) token: CancellationToken,
    pub(crate) failures: mpsc::UnboundedSender<Error>,
    pub(crate) handler_retry_backoff: Duration,
    pub(crate) fetch_retry_backoff: Duration,
}

impl PartitionClaim {
    pub(crate) async fn run(self, mut stream: Box<dyn PartitionStream>) {
        info!(
            partition = self.partition,
            generation = self.generation,
            "Partition claimed"
        );

        let mut fetch_failures = 0u32;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = stream.next_record() => next,
            };

            match next {
                Ok(record) => {
                    fetch_failures = 0;
                    if !self.deliver(record).await {
                        break;
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(partition = self.partition, "Fatal fetch error: {}", e);
                    let _ = self.failures.send(e);
                    break;
                }
                Err(e) => {
                    fetch_failures += 1;
                    if fetch_failures >= MAX_FETCH_FAILURES {
                        warn!(
                            partition = self.partition,
                            attempts = fetch_failures,
                            "Fetch keeps failing, giving up the claim: {}",
                            e
                        );
                        let _ = self.failures.send(e);
                        break;
                    }
                    warn!(partition = self.partition, "Fetch failed, retrying: {}", e);
                    if !self.pause(self.fetch_retry_backoff).await {
                        break;
                    }
                }
            }
        }

        info!(
            partition = self.partition,
            generation = self.generation,
            "Partition released"
        );
    }

    /// Handles one record and commits it. Returns `false` if the claim was
    /// cancelled while the record was still unhandled.
    async fn deliver(&self, record: BrokerRecord) -> bool {
        let event = match JsonSerializer::deserialize(
            record.payload.as_deref(),
            record.partition,
            record.offset,
        ) {
            Ok(event) => event,
            Err(e) => {
                // Not committed: the position only moves past it once a later
                // record on this partition is handled.
                warn!("Skipping undecodable record: {}", e);
                return true;
            }
        };

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            partition = record.partition,
            offset = record.offset,
            "Consumed event"
        );

        // The handler is never raced against cancellation; an in-flight call
        // always runs to completion before the claim lets go.
        while let Err(e) = self.handler.handle(&event).await {
            let error = Error::Handler(format!("{:#}", e));
            warn!(
                event_id = %event.id,
                partition = record.partition,
                offset = record.offset,
                "{}, redelivering",
                error
            );
            if !self.pause(self.handler_retry_backoff).await {
                return false;
            }
        }

        self.stats.increment_consumed();
        if let Err(e) = self.commit(record.partition, record.offset + 1).await {
            if e.is_fatal() {
                let _ = self.failures.send(e);
                return false;
            }
            warn!(
                partition = record.partition,
                offset = record.offset,
                "Failed to commit offset: {}",
                e
            );
        }
        true
    }

    async fn commit(&self, partition: i32, next_offset: i64) -> Result<()> {
        self.member.commit(partition, next_offset).await?;
        debug!(partition, next_offset, "Offset committed");
        Ok(())
    }

    /// Sleeps unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, backoff: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(backoff) => true,
        }
    }
}
