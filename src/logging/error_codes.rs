//! Error-code deduplication
//!
//! Recurring errors carry an `error_code` field on their log event. The
//! registry suppresses repeats inside the re-alert interval, emits a
//! clear message when the code is explicitly cleared, and persists the
//! episode history for later inspection.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::db::schemas::ErrorCodeDoc;
use crate::db::MongoCollection;

/// What the caller should do with an error-coded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitDecision {
    /// First occurrence of an episode: emit
    First,
    /// Interval elapsed since the last emit: emit again
    ReAlert,
    /// Inside the suppression window: drop
    Suppressed,
}

#[derive(Debug, Clone)]
struct Episode {
    start_time: DateTime<Utc>,
    last_emit: DateTime<Utc>,
}

/// In-memory dedup state plus optional persistence
#[derive(Clone)]
pub struct ErrorCodeRegistry {
    inner: Arc<Mutex<HashMap<String, Episode>>>,
    machine_id: String,
    re_alert_interval: ChronoDuration,
    /// Attached once the document store is up; the registry works
    /// in-memory before that
    store: Arc<Mutex<Option<MongoCollection<ErrorCodeDoc>>>>,
}

impl ErrorCodeRegistry {
    pub fn new(machine_id: &str, re_alert_interval: std::time::Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            machine_id: machine_id.to_string(),
            re_alert_interval: ChronoDuration::from_std(re_alert_interval)
                .unwrap_or_else(|_| ChronoDuration::hours(1)),
            store: Arc::new(Mutex::new(None)),
        }
    }

    /// Enable history persistence
    pub fn attach_store(&self, store: MongoCollection<ErrorCodeDoc>) {
        *self.store.lock() = Some(store);
    }

    /// Decide whether an occurrence of `code` should be emitted now
    pub fn should_emit(&self, code: &str, now: DateTime<Utc>) -> EmitDecision {
        let mut inner = self.inner.lock();
        match inner.get_mut(code) {
            None => {
                inner.insert(
                    code.to_string(),
                    Episode {
                        start_time: now,
                        last_emit: now,
                    },
                );
                EmitDecision::First
            }
            Some(episode) => {
                if now - episode.last_emit >= self.re_alert_interval {
                    episode.last_emit = now;
                    EmitDecision::ReAlert
                } else {
                    EmitDecision::Suppressed
                }
            }
        }
    }

    /// Clear an episode; returns its duration when one was active
    pub fn record_clear(&self, code: &str, now: DateTime<Utc>) -> Option<ChronoDuration> {
        let episode = self.inner.lock().remove(code)?;
        Some(now - episode.start_time)
    }

    /// Persist the first occurrence of an episode. Spawned
    /// fire-and-forget by the logging layer when a runtime is available.
    pub async fn persist_occurrence(&self, code: &str, message: &str) {
        let Some(store) = self.store.lock().clone() else { return };
        let doc = ErrorCodeDoc::new(
            code,
            &self.machine_id,
            message,
            self.re_alert_interval.num_seconds(),
        );
        if let Err(e) = store.insert_one(doc).await {
            warn!(notify = false, "Error-code persist failed: {e}");
        }
    }

    /// Persist a clear event
    pub async fn persist_clear(&self, code: &str) {
        let Some(store) = self.store.lock().clone() else { return };
        let result = store
            .update_one(
                bson::doc! { "code": code, "machine_id": &self.machine_id, "active": true },
                bson::doc! { "$set": {
                    "active": false,
                    "cleared_at": bson::DateTime::now(),
                    "metadata.updated_at": bson::DateTime::now(),
                }},
            )
            .await;
        if let Err(e) = result {
            warn!(notify = false, "Error-code clear persist failed: {e}");
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ErrorCodeRegistry {
        ErrorCodeRegistry::new("test-host", std::time::Duration::from_secs(3600))
    }

    #[test]
    fn first_occurrence_emits_then_suppresses() {
        let reg = registry();
        let now = Utc::now();
        assert_eq!(reg.should_emit("lnd_down", now), EmitDecision::First);
        assert_eq!(
            reg.should_emit("lnd_down", now + ChronoDuration::minutes(5)),
            EmitDecision::Suppressed
        );
    }

    #[test]
    fn re_alerts_after_interval() {
        let reg = registry();
        let now = Utc::now();
        reg.should_emit("lnd_down", now);
        assert_eq!(
            reg.should_emit("lnd_down", now + ChronoDuration::hours(2)),
            EmitDecision::ReAlert
        );
        // And suppresses again inside the fresh window
        assert_eq!(
            reg.should_emit("lnd_down", now + ChronoDuration::hours(2)),
            EmitDecision::Suppressed
        );
    }

    #[test]
    fn distinct_codes_do_not_suppress_each_other() {
        let reg = registry();
        let now = Utc::now();
        assert_eq!(reg.should_emit("lnd_down", now), EmitDecision::First);
        assert_eq!(reg.should_emit("hive_down", now), EmitDecision::First);
    }

    #[test]
    fn clear_reports_episode_duration_and_resets() {
        let reg = registry();
        let start = Utc::now();
        reg.should_emit("lnd_down", start);
        let elapsed = reg
            .record_clear("lnd_down", start + ChronoDuration::minutes(30))
            .unwrap();
        assert_eq!(elapsed, ChronoDuration::minutes(30));
        // Reappearance after clear starts a new episode
        assert_eq!(
            reg.should_emit("lnd_down", start + ChronoDuration::minutes(31)),
            EmitDecision::First
        );
        // Clearing an unknown code yields nothing
        assert!(reg.record_clear("never_seen", start).is_none());
    }
}
