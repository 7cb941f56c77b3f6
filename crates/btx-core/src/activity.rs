//! Bounded per-key activity logs used for diagnostics.
//!
//! Recording is best-effort: it never returns an error to the caller.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

use crate::{security::RateLimitKey, utils::now_ms};

pub const DEFAULT_MAX_ENTRIES: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActivityRecord {
    pub timestamp: u64,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
struct ActivityLog {
    entries: VecDeque<ActivityRecord>,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct ActivityRecorder {
    max_entries: usize,
    ttl: Duration,
    logs: DashMap<RateLimitKey, ActivityLog>,
}

impl Default for ActivityRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
    }
}

impl ActivityRecorder {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            logs: DashMap::new(),
        }
    }

    pub fn record_activity(&self, limit_type: &str, identifier: &str, metadata: serde_json::Value) {
        self.record_activity_at(limit_type, identifier, metadata, Instant::now(), now_ms());
    }

    /// Append `{timestamp, ...metadata}` to the key's log, evicting the oldest
    /// entries past the cap. Each write refreshes the log's expiry.
    pub fn record_activity_at(
        &self,
        limit_type: &str,
        identifier: &str,
        metadata: serde_json::Value,
        now: Instant,
        timestamp_ms: u64,
    ) {
        let metadata = match metadata {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                warn!(
                    limit_type,
                    identifier, "activity metadata is not an object, wrapping it"
                );
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let mut log = self
            .logs
            .entry(RateLimitKey::new(limit_type, identifier))
            .or_insert_with(|| ActivityLog {
                entries: VecDeque::with_capacity(self.max_entries.min(16)),
                expires_at: now + self.ttl,
            });

        if now >= log.expires_at {
            log.entries.clear();
        }
        log.expires_at = now + self.ttl;

        log.entries.push_back(ActivityRecord {
            timestamp: timestamp_ms,
            metadata,
        });
        while log.entries.len() > self.max_entries {
            log.entries.pop_front();
        }
    }

    /// Snapshot of a key's log, oldest first. Expired logs read as empty.
    pub fn activity(&self, limit_type: &str, identifier: &str) -> Vec<ActivityRecord> {
        self.activity_at(limit_type, identifier, Instant::now())
    }

    pub fn activity_at(&self, limit_type: &str, identifier: &str, now: Instant) -> Vec<ActivityRecord> {
        self.logs
            .get(&RateLimitKey::new(limit_type, identifier))
            .filter(|log| now < log.expires_at)
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.logs.len();
        self.logs.retain(|_, log| now < log.expires_at);
        before.saturating_sub(self.logs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_is_capped_fifo() {
        let rec = ActivityRecorder::default();
        let now = Instant::now();
        for i in 0..101u64 {
            rec.record_activity_at("chat", "42", json!({ "seq": i }), now, i);
        }

        let log = rec.activity_at("chat", "42", now);
        assert_eq!(log.len(), 100);
        assert_eq!(log[0].metadata["seq"], json!(1));
        assert_eq!(log[99].metadata["seq"], json!(100));
    }

    #[test]
    fn records_timestamp_and_flattened_metadata() {
        let rec = ActivityRecorder::default();
        rec.record_activity_at(
            "chat",
            "1",
            json!({ "command": "/predict", "userId": 7 }),
            Instant::now(),
            1234,
        );
        let log = rec.activity("chat", "1");
        let v = serde_json::to_value(&log[0]).unwrap();
        assert_eq!(v, json!({ "timestamp": 1234, "command": "/predict", "userId": 7 }));
    }

    #[test]
    fn non_object_metadata_is_wrapped() {
        let rec = ActivityRecorder::default();
        rec.record_activity("webhook", "1.2.3.4", json!("raw"));
        let log = rec.activity("webhook", "1.2.3.4");
        assert_eq!(log[0].metadata["value"], json!("raw"));
    }

    #[test]
    fn expired_logs_restart_empty() {
        let rec = ActivityRecorder::new(100, Duration::from_secs(10));
        let start = Instant::now();
        rec.record_activity_at("chat", "1", json!({}), start, 0);
        rec.record_activity_at("chat", "1", json!({}), start, 1);

        let later = start + Duration::from_secs(11);
        assert!(rec.activity_at("chat", "1", later).is_empty());

        rec.record_activity_at("chat", "1", json!({}), later, 2);
        assert_eq!(rec.activity_at("chat", "1", later).len(), 1);
        assert_eq!(rec.purge_expired(later + Duration::from_secs(11)), 1);
    }
}
