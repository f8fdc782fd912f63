use crate::event::EventRecord;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info};

/// Application logic invoked for every consumed event.
///
/// Delivery is at-least-once: after a crash or a rebalance the same event can
/// arrive again, so implementations must be idempotent. Returning an error
/// leaves the offset uncommitted and the same event is offered again.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventRecord) -> anyhow::Result<()>;
}

/// Logs every event and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &EventRecord) -> anyhow::Result<()> {
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            timestamp = %event.timestamp,
            payload_keys = event.payload.len(),
            "Processing event"
        );
        Ok(())
    }
}

/// Skips events whose id was already handled successfully.
///
/// Remembers the most recent `capacity` ids; older ones are forgotten first.
pub struct DedupHandler<H> {
    inner: H,
    capacity: usize,
    seen: Mutex<SeenIds>,
}

#[derive(Default)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl<H: EventHandler> DedupHandler<H> {
    pub fn new(inner: H, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            seen: Mutex::new(SeenIds::default()),
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    fn already_seen(&self, id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .ids
            .contains(id)
    }

    fn remember(&self, id: &str) {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        if !seen.ids.insert(id.to_string()) {
            return;
        }
        seen.order.push_back(id.to_string());
        while seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
    }
}

#[async_trait]
impl<H: EventHandler> EventHandler for DedupHandler<H> {
    async fn handle(&self, event: &EventRecord) -> anyhow::Result<()> {
        if self.already_seen(&event.id) {
            debug!(event_id = %event.id, "Skipping redelivered event");
            return Ok(());
        }
        self.inner.handle(event).await?;
        self.remember(&event.id);
        Ok(())
    }
}
