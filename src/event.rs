//! Event records and their inbound form.
//!
//! An [`EventSubmission`] is what a caller sends; every field is optional so
//! that validation can report precisely what is missing. [`EventSubmission::normalize`]
//! turns it into an immutable [`EventRecord`], generating an id and a timestamp
//! when the caller left them out.

use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};

/// Free-form event payload. Keys are unique, order is irrelevant.
pub type Payload = Map<String, Value>;

/// The unit of data published to and consumed from the event topic.
///
/// Records written by older producers used `event_id`/`event_type`; both
/// spellings are accepted when decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(alias = "event_id")]
    pub id: String,
    #[serde(rename = "type", alias = "event_type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Payload,
}

/// An event as submitted through the request interface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventSubmission {
    #[serde(default, alias = "event_id")]
    pub id: Option<String>,
    #[serde(default, rename = "type", alias = "event_type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Option<Payload>,
}

impl EventSubmission {
    pub fn new(event_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_type: Some(event_type.into()),
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Parses a request body. Empty and malformed bodies are validation errors.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::Validation("request body is empty".to_string()));
        }
        serde_json::from_slice(body)
            .map_err(|e| Error::Validation(format!("invalid request body: {}", e)))
    }

    /// Fills in a missing id or timestamp and freezes the event for publishing.
    pub fn normalize(self, ids: &IdGenerator, now: DateTime<Utc>) -> Result<EventRecord> {
        let event_type = match self.event_type {
            Some(t) if !t.trim().is_empty() => t,
            _ => return Err(Error::Validation("event type is required".to_string())),
        };

        let id = match self.id {
            Some(id) if !id.is_empty() => id,
            _ => ids.next_id(),
        };

        let timestamp = match self.timestamp {
            Some(ts) if !is_zero_time(&ts) => ts,
            _ => now,
        };

        Ok(EventRecord {
            id,
            event_type,
            timestamp,
            payload: self.payload.unwrap_or_default(),
        })
    }
}

/// Unix epoch and `0001-01-01T00:00:00Z` both mean "not set".
fn is_zero_time(ts: &DateTime<Utc>) -> bool {
    *ts == DateTime::UNIX_EPOCH
        || Utc
            .with_ymd_and_hms(1, 1, 1, 0, 0, 0)
            .single()
            .map_or(false, |zero| *ts == zero)
}

/// Hands out `evt_<nanos>` ids, strictly increasing within the process.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev.saturating_add(1)))
            })
            .unwrap_or_else(|prev| prev);
        format!("evt_{}", now.max(previous.saturating_add(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_normalize_generates_id_and_timestamp() {
        let ids = IdGenerator::new();
        let now = Utc::now();
        let submission = EventSubmission::new("order.created", payload(json!({"order_id": "42"})));

        let event = submission.normalize(&ids, now).unwrap();

        assert!(event.id.starts_with("evt_"));
        assert!(event.id["evt_".len()..].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(event.event_type, "order.created");
        assert_eq!(event.timestamp, now);
        assert_eq!(event.payload["order_id"], "42");
    }

    #[test]
    fn test_normalize_keeps_caller_values() {
        let ids = IdGenerator::new();
        let supplied = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let submission = EventSubmission::new("user.signup", Payload::new())
            .with_id("abc-123")
            .with_timestamp(supplied);

        let event = submission.normalize(&ids, Utc::now()).unwrap();

        assert_eq!(event.id, "abc-123");
        assert_eq!(event.timestamp, supplied);
    }

    #[test]
    fn test_zero_timestamps_are_replaced() {
        let ids = IdGenerator::new();
        let now = Utc::now();

        let epoch = EventSubmission::new("a", Payload::new()).with_timestamp(DateTime::UNIX_EPOCH);
        assert_eq!(epoch.normalize(&ids, now).unwrap().timestamp, now);

        let body = br#"{"type":"a","timestamp":"0001-01-01T00:00:00Z"}"#;
        let go_zero = EventSubmission::from_json(body).unwrap();
        assert_eq!(go_zero.normalize(&ids, now).unwrap().timestamp, now);
    }

    #[test]
    fn test_missing_type_is_rejected() {
        let ids = IdGenerator::new();
        let submission = EventSubmission::from_json(br#"{"payload":{"x":1}}"#).unwrap();
        let err = submission.normalize(&ids, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let blank = EventSubmission::new("  ", Payload::new());
        assert!(blank.normalize(&ids, Utc::now()).is_err());
    }

    #[test]
    fn test_from_json_rejects_empty_and_malformed_bodies() {
        assert!(matches!(
            EventSubmission::from_json(b""),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            EventSubmission::from_json(b"  \n"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            EventSubmission::from_json(b"{\"type\":"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            EventSubmission::from_json(br#"{"type":"a","payload":[1,2]}"#),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_from_json_accepts_legacy_field_names() {
        let body = br#"{"event_id":"e-1","event_type":"legacy","payload":{"k":"v"}}"#;
        let submission = EventSubmission::from_json(body).unwrap();
        assert_eq!(submission.id.as_deref(), Some("e-1"));
        assert_eq!(submission.event_type.as_deref(), Some("legacy"));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids = IdGenerator::new();
        let generated: HashSet<String> = (0..1000).map(|_| ids.next_id()).collect();
        assert_eq!(generated.len(), 1000);
    }

    #[test]
    fn test_generated_ids_are_unique_across_threads() {
        let ids = std::sync::Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..250).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        assert_eq!(all.len(), 1000);
    }
}
