// Stale-while-revalidate cache seam for the strand client.
//
// The registry consults an adapter when a fresh consumer subscribes to a
// key it has no in-memory value for, and writes through on subscribe and
// on every delivered push. Lookups are synchronous and must never perform
// I/O; adapters fronting slow stores belong outside this seam.
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub trait CacheAdapter: Debug + Send + Sync {
    fn get(&self, item: &str, parameters: &[Value]) -> Option<Value>;

    fn put(&self, item: &str, parameters: &[Value], value: Value);
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    item: String,
    parameters: String,
}

impl CacheKey {
    pub fn new(item: impl Into<String>, parameters: &[Value]) -> Self {
        Self {
            item: item.into(),
            parameters: strand_wire::parameters_key(parameters),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    // Stored value plus optional expiration.
    value: Value,
    expires_at: Option<Instant>,
}

/// In-memory cache with optional TTL expiry.
///
/// ```
/// use serde_json::json;
/// use strand_cache::{CacheAdapter, EphemeralCache};
///
/// let cache = EphemeralCache::new();
/// cache.put("weather/current", &[json!("berlin")], json!({"r": "1"}));
/// assert_eq!(
///     cache.get("weather/current", &[json!("berlin")]),
///     Some(json!({"r": "1"}))
/// );
/// ```
#[derive(Debug, Default)]
pub struct EphemeralCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    ttl: Option<Duration>,
}

impl EphemeralCache {
    pub fn new() -> Self {
        Self::default()
    }

    // Entries older than the TTL are dropped lazily on lookup.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheAdapter for EphemeralCache {
    fn get(&self, item: &str, parameters: &[Value]) -> Option<Value> {
        let key = CacheKey::new(item, parameters);
        let mut entries = self.entries.lock().expect("cache lock");
        let entry = entries.get(&key)?;
        if let Some(expires_at) = entry.expires_at
            && Instant::now() >= expires_at
        {
            entries.remove(&key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn put(&self, item: &str, parameters: &[Value], value: Value) {
        let key = CacheKey::new(item, parameters);
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .expect("cache lock")
            .insert(key, CacheEntry { value, expires_at });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_round_trip() {
        let cache = EphemeralCache::new();
        cache.put("weather/current", &[json!("berlin")], json!({"r": "1"}));
        assert_eq!(
            cache.get("weather/current", &[json!("berlin")]),
            Some(json!({"r": "1"}))
        );
        assert_eq!(cache.get("weather/current", &[json!("paris")]), None);
    }

    #[test]
    fn put_overwrites_previous_value() {
        let cache = EphemeralCache::new();
        cache.put("counters/value", &[json!("hits")], json!(1));
        cache.put("counters/value", &[json!("hits")], json!(2));
        assert_eq!(cache.get("counters/value", &[json!("hits")]), Some(json!(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn ttl_expires_entries() {
        // Ensure TTL logic expires keys after the deadline.
        let cache = EphemeralCache::with_ttl(Duration::from_millis(10));
        cache.put("time/now", &[], json!("t0"));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get("time/now", &[]), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_distinguish_parameter_order() {
        let cache = EphemeralCache::new();
        cache.put("pairs/sum", &[json!(1), json!(2)], json!(3));
        assert_eq!(cache.get("pairs/sum", &[json!(2), json!(1)]), None);
    }
}
