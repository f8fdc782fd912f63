//! Broker capabilities the gateway depends on.
//!
//! The core never talks to a client library directly. Publishing goes through
//! [`EventPublisher`], group consumption through [`GroupMember`] and
//! [`PartitionStream`]. Retry, backoff and compression are the client's
//! business; the core only configures them.
//!
//! Two implementations exist: [`crate::kafka`] (rdkafka) and
//! [`memory::MemoryBroker`] (in-process, used by tests and `--in-memory`).

pub mod memory;

use crate::Result;
use async_trait::async_trait;
use std::sync::mpsc;
use std::time::Duration;

pub use memory::MemoryBroker;

/// Where an acknowledged write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// A record pulled from a claimed partition.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// Membership changes reported by the group coordinator.
#[derive(Debug)]
pub enum GroupEvent {
    /// A new generation started and these partitions now belong to this member.
    Assigned { generation: i32, partitions: Vec<i32> },
    /// These partitions are being taken away. The coordinator waits for
    /// `ack` before handing them to anyone else.
    Revoked { partitions: Vec<i32>, ack: RevokeAck },
}

/// Completion signal for a revocation.
///
/// This is a std channel rather than a tokio one because the Kafka
/// implementation waits on it from inside a synchronous rebalance callback.
/// Dropping the ack without calling [`RevokeAck::done`] releases the waiter
/// as well.
#[derive(Debug)]
pub struct RevokeAck(mpsc::Sender<()>);

#[derive(Debug)]
pub struct RevokeWaiter(mpsc::Receiver<()>);

impl RevokeAck {
    pub fn channel() -> (RevokeAck, RevokeWaiter) {
        let (tx, rx) = mpsc::channel();
        (RevokeAck(tx), RevokeWaiter(rx))
    }

    pub fn done(self) {
        let _ = self.0.send(());
    }
}

impl RevokeWaiter {
    /// Blocks until acknowledged or abandoned. Returns `false` on timeout.
    pub fn wait(self, timeout: Duration) -> bool {
        !matches!(
            self.0.recv_timeout(timeout),
            Err(mpsc::RecvTimeoutError::Timeout)
        )
    }
}

/// Producer side of the broker client.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Writes one record and waits for the full in-sync replica set to
    /// acknowledge it. Transient failures are retried by the client.
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery>;

    /// Waits for buffered sends to be acknowledged.
    async fn flush(&self, timeout: Duration) -> Result<()>;

    /// Checks that the broker answers a metadata request for `topic`.
    async fn check_reachable(&self, topic: &str, timeout: Duration) -> Result<()>;
}

/// One member of a consumer group.
#[async_trait]
pub trait GroupMember: Send + Sync {
    /// Asks the coordinator to (re)join the group for `topic`. Assignments
    /// arrive through [`GroupMember::next_event`].
    async fn join(&self, topic: &str) -> Result<()>;

    /// Waits for the next assignment or revocation.
    async fn next_event(&self) -> Result<GroupEvent>;

    /// Opens a pull stream on a partition this member currently holds. The
    /// stream resumes at the group's committed offset, or at the configured
    /// initial offset when nothing was committed yet.
    async fn open_partition(&self, partition: i32) -> Result<Box<dyn PartitionStream>>;

    /// Records `next_offset` (last handled offset + 1) as the group's position.
    async fn commit(&self, partition: i32, next_offset: i64) -> Result<()>;

    /// Leaves the group so its partitions can be reassigned immediately.
    async fn leave(&self) -> Result<()>;
}

/// Ordered records of a single claimed partition.
#[async_trait]
pub trait PartitionStream: Send {
    /// Waits for the next record.
    async fn next_record(&mut self) -> Result<BrokerRecord>;
}
