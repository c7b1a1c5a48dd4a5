use super::*;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::core::PendingSubscribes;
use crate::client::push::next_backoff_delay;
use crate::registry::{SubscriptionKey, SubscriptionRegistry};
use strand_cache::{CacheAdapter, EphemeralCache};

fn recording_consumer() -> (Consumer, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let consumer: Consumer = Arc::new(move |value| sink.lock().expect("seen lock").push(value));
    (consumer, seen)
}

#[test]
fn registry_counts_duplicate_consumers_separately() {
    // The same handle registered twice is two logical entries; two
    // unsubscribes are needed to empty the key.
    let registry = SubscriptionRegistry::new(None);
    let (consumer, seen) = recording_consumer();
    registry.subscribe(json!(1), "demo/item", vec![], Arc::clone(&consumer));
    registry.subscribe(json!(2), "demo/item", vec![], Arc::clone(&consumer));
    assert_eq!(seen.lock().expect("seen lock").len(), 2);

    assert!(!registry.unsubscribe("demo/item", &[], &consumer));
    assert!(registry.unsubscribe("demo/item", &[], &consumer));
    assert!(!registry.has_consumers("demo/item", &[]));
}

#[test]
fn registry_unsubscribe_unknown_consumer_is_noop() {
    let registry = SubscriptionRegistry::new(None);
    let (consumer, _) = recording_consumer();
    let (stranger, _) = recording_consumer();
    registry.subscribe(json!(1), "demo/item", vec![], Arc::clone(&consumer));

    assert!(!registry.unsubscribe("demo/item", &[], &stranger));
    assert!(registry.has_consumers("demo/item", &[]));
    assert!(!registry.unsubscribe("missing/item", &[], &consumer));
}

#[test]
fn registry_consume_unknown_key_discards_silently() {
    let registry = SubscriptionRegistry::new(None);
    registry.consume("nobody/cares", &[], json!(42));
}

#[test]
fn registry_consume_dispatches_in_insertion_order() {
    let registry = SubscriptionRegistry::new(None);
    let order = Arc::new(Mutex::new(Vec::new()));
    let first_order = Arc::clone(&order);
    let second_order = Arc::clone(&order);
    let first: Consumer = Arc::new(move |_| first_order.lock().expect("order").push("first"));
    let second: Consumer = Arc::new(move |_| second_order.lock().expect("order").push("second"));
    registry.subscribe(json!(0), "demo/item", vec![], first);
    order.lock().expect("order").clear();
    registry.subscribe(json!(0), "demo/item", vec![], second);
    order.lock().expect("order").clear();

    registry.consume("demo/item", &[], json!(1));
    assert_eq!(*order.lock().expect("order"), vec!["first", "second"]);
}

#[test]
fn registry_survives_consumer_unsubscribing_itself_mid_dispatch() {
    // A consumer that synchronously removes itself while being invoked
    // must not corrupt the dispatch iteration.
    let registry = Arc::new(SubscriptionRegistry::new(None));
    let self_slot: Arc<Mutex<Option<Consumer>>> = Arc::new(Mutex::new(None));
    let registry_in_consumer = Arc::clone(&registry);
    let slot_in_consumer = Arc::clone(&self_slot);
    let hits = Arc::new(Mutex::new(0usize));
    let hits_in_consumer = Arc::clone(&hits);
    let consumer: Consumer = Arc::new(move |_| {
        *hits_in_consumer.lock().expect("hits") += 1;
        let me = slot_in_consumer.lock().expect("slot").clone();
        if let Some(me) = me {
            registry_in_consumer.unsubscribe("demo/item", &[], &me);
        }
    });
    *self_slot.lock().expect("slot") = Some(Arc::clone(&consumer));

    registry.subscribe(json!(0), "demo/item", vec![], Arc::clone(&consumer));
    // The initial delivery already ran the self-unsubscribe.
    assert!(!registry.has_consumers("demo/item", &[]));
    registry.consume("demo/item", &[], json!(1));
    assert_eq!(*hits.lock().expect("hits"), 1);
}

#[test]
fn registry_prefers_in_memory_value_over_adapter() {
    let adapter = Arc::new(EphemeralCache::new());
    adapter.put("demo/item", &[], json!("stale"));
    let registry = SubscriptionRegistry::new(Some(adapter.clone()));
    assert_eq!(registry.get_cached("demo/item", &[]), Some(json!("stale")));

    let (consumer, _) = recording_consumer();
    registry.subscribe(json!("fresh"), "demo/item", vec![], consumer);
    assert_eq!(registry.get_cached("demo/item", &[]), Some(json!("fresh")));
}

#[test]
fn registry_writes_through_on_subscribe_and_consume() {
    let adapter = Arc::new(EphemeralCache::new());
    let registry = SubscriptionRegistry::new(Some(adapter.clone()));
    let (consumer, _) = recording_consumer();

    registry.subscribe(json!("v1"), "demo/item", vec![json!("p")], consumer);
    assert_eq!(adapter.get("demo/item", &[json!("p")]), Some(json!("v1")));

    registry.consume("demo/item", &[json!("p")], json!("v2"));
    assert_eq!(adapter.get("demo/item", &[json!("p")]), Some(json!("v2")));
}

#[test]
fn registry_detach_all_reports_consumer_count() {
    let registry = SubscriptionRegistry::new(None);
    let (first, _) = recording_consumer();
    let (second, _) = recording_consumer();
    registry.subscribe(json!(0), "demo/item", vec![], first);
    registry.subscribe(json!(0), "demo/item", vec![], second);

    assert_eq!(registry.detach_all("demo/item", &[]), 2);
    assert_eq!(registry.detach_all("demo/item", &[]), 0);
    assert!(registry.all_subscriptions().is_empty());
}

#[test]
fn registry_snapshot_covers_all_keys() {
    let registry = SubscriptionRegistry::new(None);
    let (consumer, _) = recording_consumer();
    registry.subscribe(json!(0), "a/one", vec![json!(1)], Arc::clone(&consumer));
    registry.subscribe(json!(0), "b/two", vec![json!(2)], consumer);

    let mut items: Vec<String> = registry
        .all_subscriptions()
        .into_iter()
        .map(|snapshot| snapshot.item)
        .collect();
    items.sort();
    assert_eq!(items, vec!["a/one".to_string(), "b/two".to_string()]);
}

#[test]
fn pending_cancel_marks_exactly_one_entry() {
    let pending = PendingSubscribes::default();
    let (consumer, _) = recording_consumer();
    let key = SubscriptionKey::new("demo/item", &[]);
    let first = pending.begin(&key, &consumer);
    let second = pending.begin(&key, &consumer);

    assert!(pending.cancel(&key, &consumer));
    // One of the two entries is cancelled, the other still live.
    let outcomes = (pending.finish(&key, first), pending.finish(&key, second));
    assert!(outcomes.0 ^ outcomes.1, "exactly one entry cancelled: {outcomes:?}");
}

#[test]
fn pending_cancel_without_inflight_entry_is_false() {
    let pending = PendingSubscribes::default();
    let (consumer, _) = recording_consumer();
    let key = SubscriptionKey::new("demo/item", &[]);
    assert!(!pending.cancel(&key, &consumer));

    let token = pending.begin(&key, &consumer);
    assert!(!pending.finish(&key, token));
    // Finished entries are gone; a late cancel finds nothing.
    assert!(!pending.cancel(&key, &consumer));
}

#[test]
fn pending_orphan_mark_is_taken_exactly_once() {
    let pending = PendingSubscribes::default();
    let key = SubscriptionKey::new("demo/item", &[]);
    assert!(!pending.clear_orphaned(&key));
    pending.mark_orphaned(&key);
    assert!(pending.clear_orphaned(&key));
    assert!(!pending.clear_orphaned(&key));
}

#[test]
fn backoff_doubles_and_caps() {
    let max = Duration::from_millis(2_000);
    let mut delay = Duration::from_millis(250);
    delay = next_backoff_delay(delay, max);
    assert_eq!(delay, Duration::from_millis(500));
    delay = next_backoff_delay(delay, max);
    assert_eq!(delay, Duration::from_millis(1_000));
    delay = next_backoff_delay(delay, max);
    assert_eq!(delay, Duration::from_millis(2_000));
    delay = next_backoff_delay(delay, max);
    assert_eq!(delay, Duration::from_millis(2_000));
}

#[test]
fn config_defaults_are_sane() {
    let config = ClientConfig::new("http://127.0.0.1:4000");
    assert_eq!(config.call_timeout, Duration::from_millis(5_000));
    assert_eq!(config.reconnect_delay, Duration::from_millis(250));
    assert!(config.push_enabled);
    assert!(!config.connect_on_create);
}

#[test]
fn config_env_overrides_apply() {
    unsafe {
        std::env::set_var("STRAND_CALL_TIMEOUT_MS", "750");
        std::env::set_var("STRAND_PUSH_ENABLED", "false");
    }
    let config = ClientConfig::from_env("http://127.0.0.1:4000");
    unsafe {
        std::env::remove_var("STRAND_CALL_TIMEOUT_MS");
        std::env::remove_var("STRAND_PUSH_ENABLED");
    }
    assert_eq!(config.call_timeout, Duration::from_millis(750));
    assert!(!config.push_enabled);
}

#[test]
fn config_yaml_override_wins_over_defaults() {
    let path = std::env::temp_dir().join(format!(
        "strand-client-config-{}.yaml",
        std::process::id()
    ));
    std::fs::write(
        &path,
        "call_timeout_ms: 1234\nping_interval_ms: 99\nconnect_on_create: true\n",
    )
    .expect("write override");
    let config = ClientConfig::from_env_or_yaml(
        "http://127.0.0.1:4000",
        Some(path.to_str().expect("utf8 path")),
    )
    .expect("load config");
    std::fs::remove_file(&path).ok();

    assert_eq!(config.call_timeout, Duration::from_millis(1_234));
    assert_eq!(config.ping_interval, Duration::from_millis(99));
    assert!(config.connect_on_create);
}

#[test]
fn config_missing_yaml_file_is_an_error() {
    let err = ClientConfig::from_env_or_yaml("http://127.0.0.1:4000", Some("/nonexistent/x.yaml"))
        .expect_err("missing file");
    assert!(err.to_string().contains("read client config"));
}

#[test]
fn events_url_swaps_scheme_and_carries_client_id() {
    let config = ClientConfig::new("http://127.0.0.1:4000/");
    let id = strand_common::ClientId::new();
    let url = config.events_url(id);
    assert_eq!(url, format!("ws://127.0.0.1:4000/rpc/events?client-id={id}"));

    let secure = ClientConfig::new("https://rpc.example.com");
    assert!(secure.events_url(id).starts_with("wss://rpc.example.com/"));
}
