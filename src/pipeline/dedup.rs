//! TTL cache of recently seen inbound message ids.
//!
//! Gateways redeliver webhooks on slow acknowledgements, so the same message id
//! can arrive several times within seconds. Time is always passed in by the
//! caller; production code uses `tokio::time::Instant::now()`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub const DEDUP_TTL: Duration = Duration::from_secs(60);

pub struct DedupCache {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false if `message_id` was seen less than one TTL ago, otherwise
    /// records it and returns true.
    pub fn should_process(&self, message_id: &str, now: Instant) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());

        let fresh = seen
            .get(message_id)
            .is_some_and(|last_seen| now.saturating_duration_since(*last_seen) < self.ttl);
        if fresh {
            return false;
        }

        seen.insert(message_id.to_string(), now);
        true
    }

    /// Drop entries older than the TTL.
    pub fn sweep(&self, now: Instant) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        seen.retain(|_, last_seen| now.saturating_duration_since(*last_seen) < ttl);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEDUP_TTL)
    }
}
