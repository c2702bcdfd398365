//! Duplicate suppression for at-least-once webhook delivery.
//!
//! Keys are `job_id:event:timestamp`, not a payload digest, so two distinct
//! events of the same kind for the same job with the same reported timestamp
//! collapse into one. Entries live for the TTL and are swept periodically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

pub struct IdempotencyTracker {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Default for IdempotencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl IdempotencyTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_from(job_id: &str, event: &str, timestamp: &str) -> String {
        format!("{}:{}:{}", job_id, event, timestamp)
    }

    /// Returns `true` if `key` was already recorded within the TTL.
    /// The first call for a key records it and returns `false`.
    pub fn is_duplicate(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match seen.get(key) {
            Some(at) if now.duration_since(*at) < self.ttl => true,
            _ => {
                seen.insert(key.to_string(), now);
                false
            }
        }
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = seen.len();
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic sweep. The task ends when the tracker is dropped.
    pub fn start_cleanup_task(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tracker) = weak.upgrade() else {
                    break;
                };
                let removed = tracker.cleanup();
                if removed > 0 {
                    tracing::debug!(removed, remaining = tracker.len(), "Swept idempotency keys");
                }
            }
        })
    }
}
