//! In-process broker with a group coordinator.
//!
//! Topics are vectors of partition logs. Groups follow the eager rebalance
//! protocol: every membership change first revokes all current assignments,
//! waits for each member to acknowledge, then deals partitions round-robin
//! over the members sorted by id and starts a new generation.
//!
//! Fault injection (`set_reachable`, `fail_next_sends`) lets tests drive the
//! error paths of the producer and the session.

use super::{
    BrokerRecord, Delivery, EventPublisher, GroupEvent, GroupMember, PartitionStream, RevokeAck,
    RevokeWaiter,
};
use crate::config::InitialOffset;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

const DEFAULT_REVOKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<BrokerState>,
    appended: Notify,
    rebalance_lock: tokio::sync::Mutex<()>,
    revoke_timeout: Duration,
}

struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    groups: HashMap<String, GroupState>,
    reachable: bool,
    failing_sends: u32,
    next_member: u64,
}

struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

#[derive(Default)]
struct GroupState {
    generation: i32,
    topic: Option<String>,
    members: BTreeMap<String, MemberSlot>,
    committed: HashMap<(String, i32), i64>,
}

struct MemberSlot {
    events: mpsc::UnboundedSender<GroupEvent>,
    assigned: Vec<i32>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_revoke_timeout(DEFAULT_REVOKE_TIMEOUT)
    }

    /// `revoke_timeout` bounds how long a rebalance waits for a member to
    /// release its partitions.
    pub fn with_revoke_timeout(revoke_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState {
                    topics: HashMap::new(),
                    groups: HashMap::new(),
                    reachable: true,
                    failing_sends: 0,
                    next_member: 0,
                }),
                appended: Notify::new(),
                rebalance_lock: tokio::sync::Mutex::new(()),
                revoke_timeout,
            }),
        }
    }

    pub fn create_topic(&self, name: &str, partitions: i32) {
        let mut state = self.inner.lock();
        state
            .topics
            .entry(name.to_string())
            .or_insert_with(|| (0..partitions.max(1)).map(|_| Vec::new()).collect());
    }

    /// A producer handle whose client absorbs up to `retries` failed attempts per send.
    pub fn publisher(&self, retries: u32) -> MemoryPublisher {
        MemoryPublisher {
            inner: self.inner.clone(),
            retries,
        }
    }

    pub fn member(&self, group_id: &str, initial_offset: InitialOffset) -> MemoryMember {
        let member_id = {
            let mut state = self.inner.lock();
            state.next_member += 1;
            format!("member-{:04}", state.next_member)
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        MemoryMember {
            inner: self.inner.clone(),
            group_id: group_id.to_string(),
            member_id,
            initial_offset,
            events_tx,
            events: tokio::sync::Mutex::new(events_rx),
        }
    }

    /// Appends bytes to a partition as-is, bypassing the producer path.
    pub fn append_raw(&self, topic: &str, partition: i32, payload: &[u8]) -> Result<i64> {
        let offset = {
            let mut state = self.inner.lock();
            let log = state
                .topics
                .get_mut(topic)
                .and_then(|partitions| partitions.get_mut(partition as usize))
                .ok_or_else(|| Error::UnknownTopic(format!("{}/{}", topic, partition)))?;
            log.push(StoredRecord {
                key: None,
                payload: Some(payload.to_vec()),
            });
            log.len() as i64 - 1
        };
        self.inner.appended.notify_waiters();
        Ok(offset)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
        self.inner.appended.notify_waiters();
    }

    /// Makes the next `attempts` send attempts fail.
    pub fn fail_next_sends(&self, attempts: u32) {
        self.inner.lock().failing_sends = attempts;
    }

    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.inner.lock();
        state
            .groups
            .get(group_id)
            .and_then(|group| group.committed.get(&(topic.to_string(), partition)))
            .copied()
    }

    pub fn end_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        let state = self.inner.lock();
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|log| log.len() as i64)
    }

    pub fn assignments(&self, group_id: &str) -> BTreeMap<String, Vec<i32>> {
        let state = self.inner.lock();
        state
            .groups
            .get(group_id)
            .map(|group| {
                group
                    .members
                    .iter()
                    .map(|(id, slot)| (id.clone(), slot.assigned.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn group_members(&self, group_id: &str) -> Vec<String> {
        self.assignments(group_id).into_keys().collect()
    }

    pub fn generation(&self, group_id: &str) -> i32 {
        let state = self.inner.lock();
        state.groups.get(group_id).map_or(0, |group| group.generation)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // State is only mutated in short non-panicking sections.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn rebalance(&self, group_id: &str) {
        let _guard = self.rebalance_lock.lock().await;

        let waiters: Vec<RevokeWaiter> = {
            let state = self.lock();
            let Some(group) = state.groups.get(group_id) else {
                return;
            };
            group
                .members
                .values()
                .filter(|slot| !slot.assigned.is_empty())
                .filter_map(|slot| {
                    let (ack, waiter) = RevokeAck::channel();
                    slot.events
                        .send(GroupEvent::Revoked {
                            partitions: slot.assigned.clone(),
                            ack,
                        })
                        .ok()
                        .map(|_| waiter)
                })
                .collect()
        };

        for waiter in waiters {
            let timeout = self.revoke_timeout;
            let released = tokio::task::spawn_blocking(move || waiter.wait(timeout))
                .await
                .unwrap_or(false);
            if !released {
                warn!(group = %group_id, "Member did not release its partitions in time");
            }
        }

        let mut state = self.lock();
        let BrokerState { topics, groups, .. } = &mut *state;
        let Some(group) = groups.get_mut(group_id) else {
            return;
        };

        group.members.retain(|_, slot| !slot.events.is_closed());
        group.generation += 1;

        let partition_count = group
            .topic
            .as_ref()
            .and_then(|topic| topics.get(topic))
            .map_or(0, |partitions| partitions.len() as i32);
        let member_ids: Vec<String> = group.members.keys().cloned().collect();
        let mut plan: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
        if !member_ids.is_empty() {
            for partition in 0..partition_count {
                let owner = &member_ids[partition as usize % member_ids.len()];
                plan.entry(owner.as_str()).or_default().push(partition);
            }
        }

        let generation = group.generation;
        for (member_id, slot) in group.members.iter_mut() {
            slot.assigned = plan.remove(member_id.as_str()).unwrap_or_default();
            let _ = slot.events.send(GroupEvent::Assigned {
                generation,
                partitions: slot.assigned.clone(),
            });
        }

        info!(
            group = %group_id,
            generation,
            members = member_ids.len(),
            "Group rebalanced"
        );
    }
}

fn partition_for(key: &str, partitions: usize) -> usize {
    // FNV-1a
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash as usize % partitions
}

#[derive(Clone)]
pub struct MemoryPublisher {
    inner: Arc<Inner>,
    retries: u32,
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery> {
        let delivery = {
            let mut state = self.inner.lock();
            if !state.reachable {
                return Err(Error::Unavailable("broker is not reachable".to_string()));
            }

            let attempts = state.failing_sends.min(self.retries.saturating_add(1));
            state.failing_sends -= attempts;
            if attempts > self.retries {
                return Err(Error::Unavailable(format!(
                    "send failed after {} retries",
                    self.retries
                )));
            }

            let partitions = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;
            let partition = partition_for(key, partitions.len());
            let log = &mut partitions[partition];
            log.push(StoredRecord {
                key: Some(key.as_bytes().to_vec()),
                payload: Some(payload.to_vec()),
            });

            Delivery {
                partition: partition as i32,
                offset: log.len() as i64 - 1,
            }
        };

        self.inner.appended.notify_waiters();
        Ok(delivery)
    }

    async fn flush(&self, _timeout: Duration) -> Result<()> {
        if self.inner.lock().reachable {
            Ok(())
        } else {
            Err(Error::Unavailable("broker is not reachable".to_string()))
        }
    }

    async fn check_reachable(&self, topic: &str, _timeout: Duration) -> Result<()> {
        let state = self.inner.lock();
        if !state.reachable {
            return Err(Error::Unavailable("broker is not reachable".to_string()));
        }
        if !state.topics.contains_key(topic) {
            return Err(Error::UnknownTopic(topic.to_string()));
        }
        Ok(())
    }
}

pub struct MemoryMember {
    inner: Arc<Inner>,
    group_id: String,
    member_id: String,
    initial_offset: InitialOffset,
    events_tx: mpsc::UnboundedSender<GroupEvent>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<GroupEvent>>,
}

impl MemoryMember {
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    fn check_assigned<'a>(
        &self,
        state: &'a mut BrokerState,
        partition: i32,
    ) -> Result<&'a mut GroupState> {
        let group = state
            .groups
            .get_mut(&self.group_id)
            .ok_or(Error::NotAssigned { partition })?;
        let holds = group
            .members
            .get(&self.member_id)
            .map_or(false, |slot| slot.assigned.contains(&partition));
        if !holds {
            return Err(Error::NotAssigned { partition });
        }
        Ok(group)
    }
}

#[async_trait]
impl GroupMember for MemoryMember {
    async fn join(&self, topic: &str) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if !state.reachable {
                return Err(Error::Unavailable("group coordinator is not reachable".to_string()));
            }
            if !state.topics.contains_key(topic) {
                return Err(Error::UnknownTopic(topic.to_string()));
            }

            let group = state.groups.entry(self.group_id.clone()).or_default();
            group.topic = Some(topic.to_string());
            // A rejoining member has already dropped its claims.
            group
                .members
                .entry(self.member_id.clone())
                .and_modify(|slot| slot.assigned.clear())
                .or_insert_with(|| MemberSlot {
                    events: self.events_tx.clone(),
                    assigned: Vec::new(),
                });
        }

        debug!(group = %self.group_id, member = %self.member_id, "Joining group");
        self.inner.rebalance(&self.group_id).await;
        Ok(())
    }

    async fn next_event(&self) -> Result<GroupEvent> {
        self.events
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Coordination {
                message: "group event channel closed".to_string(),
            })
    }

    async fn open_partition(&self, partition: i32) -> Result<Box<dyn PartitionStream>> {
        let mut state = self.inner.lock();
        let initial_offset = self.initial_offset;
        let group = self.check_assigned(&mut state, partition)?;
        let topic = group.topic.clone().ok_or(Error::NotAssigned { partition })?;
        let committed = group.committed.get(&(topic.clone(), partition)).copied();

        let start = match committed {
            Some(offset) => offset,
            None => match initial_offset {
                InitialOffset::Oldest => 0,
                InitialOffset::Newest => state
                    .topics
                    .get(&topic)
                    .and_then(|partitions| partitions.get(partition as usize))
                    .map_or(0, |log| log.len() as i64),
            },
        };

        Ok(Box::new(MemoryPartitionStream {
            inner: self.inner.clone(),
            topic,
            partition,
            next: start,
        }))
    }

    async fn commit(&self, partition: i32, next_offset: i64) -> Result<()> {
        let mut state = self.inner.lock();
        let group = self.check_assigned(&mut state, partition)?;
        let topic = group.topic.clone().ok_or(Error::NotAssigned { partition })?;
        group.committed.insert((topic, partition), next_offset);
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        let removed = {
            let mut state = self.inner.lock();
            state
                .groups
                .get_mut(&self.group_id)
                .map_or(false, |group| group.members.remove(&self.member_id).is_some())
        };

        // Release revocations that were sent before we left.
        {
            let mut events = self.events.lock().await;
            while let Ok(event) = events.try_recv() {
                if let GroupEvent::Revoked { ack, .. } = event {
                    ack.done();
                }
            }
        }

        if removed {
            info!(group = %self.group_id, member = %self.member_id, "Left group");
            self.inner.rebalance(&self.group_id).await;
        }
        Ok(())
    }
}

struct MemoryPartitionStream {
    inner: Arc<Inner>,
    topic: String,
    partition: i32,
    next: i64,
}

#[async_trait]
impl PartitionStream for MemoryPartitionStream {
    async fn next_record(&mut self) -> Result<BrokerRecord> {
        loop {
            let appended = self.inner.appended.notified();
            {
                let state = self.inner.lock();
                if !state.reachable {
                    return Err(Error::Unavailable("broker is not reachable".to_string()));
                }
                let stored = state
                    .topics
                    .get(&self.topic)
                    .and_then(|partitions| partitions.get(self.partition as usize))
                    .and_then(|log| log.get(self.next as usize));
                if let Some(stored) = stored {
                    let record = BrokerRecord {
                        partition: self.partition,
                        offset: self.next,
                        key: stored.key.clone(),
                        payload: stored.payload.clone(),
                    };
                    self.next += 1;
                    return Ok(record);
                }
            }
            appended.await;
        }
    }
}
