//! Local subscription bookkeeping: consumer multiset plus last-value cache.
//!
//! # Purpose
//! Deduplicates subscriptions by `(item, parameters)` across consumers so
//! at most one server-side subscription exists per key, caches the last
//! observed value, and answers whether an unsubscribe removed the final
//! consumer (the only signal that a server-side unsubscribe is due).
//!
//! # Design notes
//! One mutex serializes the whole table. Consumer callbacks always run
//! outside the lock, over a snapshot of the consumer list, so a consumer
//! that synchronously unsubscribes itself cannot corrupt iteration.
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use strand_cache::CacheAdapter;
use tracing::debug;

/// Consumer callback handle. Unsubscribe matches by `Arc::ptr_eq`, so the
/// caller must retain the same handle across subscribe and unsubscribe.
pub type Consumer = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub(crate) struct SubscriptionKey {
    pub(crate) item: String,
    pub(crate) parameters: String,
}

impl SubscriptionKey {
    pub(crate) fn new(item: &str, parameters: &[Value]) -> Self {
        Self {
            item: item.to_string(),
            parameters: strand_wire::parameters_key(parameters),
        }
    }
}

struct SubscriptionRecord {
    // Original parameter array, kept for the resubscribe pass.
    parameters: Vec<Value>,
    // Ordered multiset: the same handle may appear more than once and each
    // occurrence needs its own unsubscribe.
    consumers: Vec<Consumer>,
    last_value: Option<Value>,
}

pub(crate) struct SubscriptionSnapshot {
    pub(crate) item: String,
    pub(crate) parameters: Vec<Value>,
    pub(crate) consumers: Vec<Consumer>,
}

pub(crate) struct SubscriptionRegistry {
    records: Mutex<HashMap<SubscriptionKey, SubscriptionRecord>>,
    cache: Option<Arc<dyn CacheAdapter>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(cache: Option<Arc<dyn CacheAdapter>>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            cache,
        }
    }

    /// Last observed value for the key, falling back to the external cache
    /// adapter. Never performs I/O.
    pub(crate) fn get_cached(&self, item: &str, parameters: &[Value]) -> Option<Value> {
        let key = SubscriptionKey::new(item, parameters);
        if let Some(value) = self
            .records
            .lock()
            .expect("registry lock")
            .get(&key)
            .and_then(|record| record.last_value.clone())
        {
            return Some(value);
        }
        self.cache
            .as_ref()
            .and_then(|cache| cache.get(item, parameters))
    }

    /// Record a consumer for the key and hand it the initial value.
    pub(crate) fn subscribe(
        &self,
        initial_value: Value,
        item: &str,
        parameters: Vec<Value>,
        consumer: Consumer,
    ) {
        let key = SubscriptionKey::new(item, &parameters);
        {
            let mut records = self.records.lock().expect("registry lock");
            let record = records.entry(key).or_insert_with(|| SubscriptionRecord {
                parameters: parameters.clone(),
                consumers: Vec::new(),
                last_value: None,
            });
            record.consumers.push(Arc::clone(&consumer));
            record.last_value = Some(initial_value.clone());
            metrics::gauge!("strand_client_subscription_keys").set(records.len() as f64);
        }
        self.write_through(item, &parameters, &initial_value);
        consumer(initial_value);
    }

    /// Remove exactly one occurrence of the consumer. Returns true iff the
    /// record is now empty (and has been dropped), which is the signal to
    /// send a server-side unsubscribe.
    pub(crate) fn unsubscribe(&self, item: &str, parameters: &[Value], consumer: &Consumer) -> bool {
        let key = SubscriptionKey::new(item, parameters);
        let mut records = self.records.lock().expect("registry lock");
        let Some(record) = records.get_mut(&key) else {
            return false;
        };
        if let Some(position) = record
            .consumers
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, consumer))
        {
            record.consumers.remove(position);
        }
        if record.consumers.is_empty() {
            records.remove(&key);
            metrics::gauge!("strand_client_subscription_keys").set(records.len() as f64);
            return true;
        }
        false
    }

    /// Deliver a pushed value: update the cached value and fan out to a
    /// snapshot of the current consumers. Unknown keys are discarded
    /// silently (a push racing with the last unsubscribe).
    pub(crate) fn consume(&self, item: &str, parameters: &[Value], data: Value) {
        let key = SubscriptionKey::new(item, parameters);
        let snapshot = {
            let mut records = self.records.lock().expect("registry lock");
            let Some(record) = records.get_mut(&key) else {
                debug!(item, "discarding push for unknown subscription key");
                metrics::counter!("strand_client_push_discarded_total").increment(1);
                return;
            };
            record.last_value = Some(data.clone());
            record.consumers.clone()
        };
        self.write_through(item, parameters, &data);
        metrics::counter!("strand_client_push_delivered_total")
            .increment(snapshot.len() as u64);
        for consumer in snapshot {
            consumer(data.clone());
        }
    }

    /// Snapshot of every live key, used by the resubscribe pass.
    pub(crate) fn all_subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        self.records
            .lock()
            .expect("registry lock")
            .iter()
            .map(|(key, record)| SubscriptionSnapshot {
                item: key.item.clone(),
                parameters: record.parameters.clone(),
                consumers: record.consumers.clone(),
            })
            .collect()
    }

    pub(crate) fn key_count(&self) -> usize {
        self.records.lock().expect("registry lock").len()
    }

    pub(crate) fn has_consumers(&self, item: &str, parameters: &[Value]) -> bool {
        let key = SubscriptionKey::new(item, parameters);
        self.records
            .lock()
            .expect("registry lock")
            .get(&key)
            .is_some_and(|record| !record.consumers.is_empty())
    }

    /// Drop a whole key. Used when a resubscribe attempt fails and the key
    /// is irrecoverable for this connection generation.
    pub(crate) fn detach_all(&self, item: &str, parameters: &[Value]) -> usize {
        let key = SubscriptionKey::new(item, parameters);
        let mut records = self.records.lock().expect("registry lock");
        let detached = records
            .remove(&key)
            .map(|record| record.consumers.len())
            .unwrap_or(0);
        metrics::gauge!("strand_client_subscription_keys").set(records.len() as f64);
        detached
    }

    /// Write-through to the external cache adapter, when one is configured.
    pub(crate) fn write_through(&self, item: &str, parameters: &[Value], value: &Value) {
        if let Some(cache) = &self.cache {
            cache.put(item, parameters, value.clone());
        }
    }
}
