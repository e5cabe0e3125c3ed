use dashmap::DashMap;
use gatehouse_core::{GatewayResponse, SharedClock};
use http::Method;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

struct CacheEntry {
    response: GatewayResponse,
    expires_at: u64,
    seq: u64,
}

/// TTL cache of successful GET responses with FIFO eviction.
///
/// Entries live in a sharded map; a separate queue remembers insertion order
/// so that exceeding `capacity` evicts the oldest insertion, not the least
/// recently read entry.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    order: Mutex<VecDeque<(String, u64)>>,
    next_seq: AtomicU64,
    capacity: usize,
    ttl: Duration,
    clock: SharedClock,
}

/// Cache key for a request: method, path and query, never the body.
pub fn cache_key(method: &Method, path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{method} {path}?{q}"),
        _ => format!("{method} {path}"),
    }
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            capacity,
            ttl,
            clock,
        }
    }

    /// The configured default TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fetch a live entry. Expired entries are dropped on the way.
    pub fn get(&self, key: &str) -> Option<GatewayResponse> {
        let now = self.clock.now_millis();
        {
            let entry = self.entries.get(key)?;
            if now < entry.expires_at {
                return Some(entry.response.clone());
            }
        }
        self.entries.remove_if(key, |_, e| now >= e.expires_at);
        None
    }

    /// Store a response for `ttl`.
    pub fn put(&self, key: &str, response: &GatewayResponse, ttl: Duration) {
        if self.capacity == 0 {
            return;
        }
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let expires_at = self.clock.now_millis().saturating_add(ttl_ms);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut order = self.order.lock();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                response: response.clone(),
                expires_at,
                seq,
            },
        );
        order.push_back((key.to_string(), seq));

        while self.entries.len() > self.capacity {
            let Some((oldest, oldest_seq)) = order.pop_front() else {
                break;
            };
            if self
                .entries
                .remove_if(&oldest, |_, e| e.seq == oldest_seq)
                .is_some()
            {
                debug!(key = %oldest, "Cache entry evicted");
            }
        }

        // Overwrites and purges leave stale markers behind.
        if order.len() > self.capacity.saturating_mul(2) {
            order.retain(|(k, s)| self.entries.get(k).is_some_and(|e| e.seq == *s));
        }
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, e| now < e.expires_at);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use gatehouse_core::ManualClock;
    use http::StatusCode;
    use serde_json::json;

    fn response(n: u32) -> GatewayResponse {
        GatewayResponse::json(StatusCode::OK, &json!({"n": n}))
    }

    #[test]
    fn test_capacity_evicts_first_inserted() {
        let clock = ManualClock::new(0);
        let cache = ResponseCache::new(2, Duration::from_secs(30), clock);
        let ttl = cache.ttl();
        cache.put("a", &response(1), ttl);
        cache.put("b", &response(2), ttl);
        // Reads do not refresh position
        assert!(cache.get("a").is_some());
        cache.put("c", &response(3), ttl);

        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(response(2)));
        assert_eq!(cache.get("c"), Some(response(3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_entry_expires_at_ttl() {
        let clock = ManualClock::new(1_000);
        let cache = ResponseCache::new(10, Duration::from_secs(30), clock.clone());
        cache.put("k", &response(7), Duration::from_secs(30));

        clock.advance(Duration::from_millis(29_999));
        assert_eq!(cache.get("k").unwrap().body, response(7).body);
        clock.advance(Duration::from_millis(1));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overwrite_moves_to_back() {
        let clock = ManualClock::new(0);
        let cache = ResponseCache::new(2, Duration::from_secs(30), clock);
        let ttl = cache.ttl();
        cache.put("a", &response(1), ttl);
        cache.put("b", &response(2), ttl);
        cache.put("a", &response(10), ttl);
        cache.put("c", &response(3), ttl);

        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a"), Some(response(10)));
    }

    #[test]
    fn test_purge_expired() {
        let clock = ManualClock::new(0);
        let cache = ResponseCache::new(10, Duration::from_secs(30), clock.clone());
        cache.put("short", &response(1), Duration::from_secs(1));
        cache.put("long", &response(2), Duration::from_secs(60));
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_key_ignores_missing_query() {
        assert_eq!(cache_key(&Method::GET, "/plugin/list", None), "GET /plugin/list");
        assert_eq!(
            cache_key(&Method::GET, "/plugin/list", Some("page=2")),
            "GET /plugin/list?page=2"
        );
        assert_eq!(cache_key(&Method::GET, "/p", Some("")), "GET /p");
    }
}
