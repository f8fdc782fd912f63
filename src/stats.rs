//! Throughput counters shared by the produce and consume paths.
//!
//! [`Stats`] is the only mutable state shared between request handlers and
//! partition loops. Both counters are plain atomics; the last-activity time
//! is kept as Unix nanoseconds and only ever moves forward (`fetch_max`), so a
//! late writer with an older clock reading cannot drag it backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Receives every counter increment, e.g. to forward it to a metrics exporter.
pub trait StatsSink: Send + Sync {
    fn produced(&self);
    fn consumed(&self);
}

/// Point-in-time copy of the counters.
///
/// The two counters are read independently; a snapshot taken while both
/// paths are busy may pair a fresh produced count with a slightly older
/// consumed count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub messages_produced: u64,
    pub messages_consumed: u64,
    pub last_message_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct Stats {
    produced: AtomicU64,
    consumed: AtomicU64,
    last_activity_nanos: AtomicI64,
    sink: Option<Arc<dyn StatsSink>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn StatsSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::default()
        }
    }

    pub fn increment_produced(&self) {
        self.produced.fetch_add(1, Ordering::SeqCst);
        self.touch();
        if let Some(sink) = &self.sink {
            sink.produced();
        }
    }

    pub fn increment_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::SeqCst);
        self.touch();
        if let Some(sink) = &self.sink {
            sink.consumed();
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last = self.last_activity_nanos.load(Ordering::SeqCst);
        StatsSnapshot {
            messages_produced: self.produced.load(Ordering::SeqCst),
            messages_consumed: self.consumed.load(Ordering::SeqCst),
            last_message_time: (last > 0).then(|| DateTime::from_timestamp_nanos(last)),
        }
    }

    fn touch(&self) {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        self.last_activity_nanos.fetch_max(now, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stats")
            .field("snapshot", &self.snapshot())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}
