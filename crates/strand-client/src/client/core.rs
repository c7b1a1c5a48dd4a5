//! Client orchestration: routes consumer-facing operations into the right
//! sequence of registry, HTTP, and push-channel actions.
//!
//! # Design notes
//! The registry answers first/last-consumer questions; this module decides
//! what to do about them. An in-flight-subscribe tracker covers the window
//! between issuing the HTTP subscribe and recording the consumer, so an
//! unsubscribe landing inside that window results in a compensating
//! server-side unsubscribe instead of a leaked subscription.
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use strand_cache::CacheAdapter;
use strand_common::ClientId;

use crate::client::http::HttpChannel;
use crate::client::push::{PushChannel, PushChannelConfig, PushState};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::middleware::{
    InvocationContext, InvocationType, Middleware, Terminal, with_middlewares,
};
use crate::registry::{Consumer, SubscriptionKey, SubscriptionRegistry};

/// Per-invocation options; anything unset falls back to the client config.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
}

// Which HTTP route the terminal step hits. Distinct from the invocation
// type: a degraded subscribe (push disabled) still enters middleware as a
// subscribe but rides the call route.
#[derive(Clone, Copy)]
enum Route {
    Call,
    Subscribe,
    Unsubscribe,
}

struct PendingEntry {
    token: u64,
    consumer: Consumer,
    cancelled: bool,
}

/// Tracks subscribes whose HTTP leg has not resolved yet.
#[derive(Default)]
pub(crate) struct PendingSubscribes {
    next_token: AtomicU64,
    entries: Mutex<HashMap<SubscriptionKey, Vec<PendingEntry>>>,
    // Keys the server recorded for a subscribe that was cancelled while in
    // flight. The mark waits for a surviving in-flight subscribe to adopt
    // the key or, failing that, release it on the server.
    orphaned: Mutex<HashSet<SubscriptionKey>>,
}

impl PendingSubscribes {
    pub(crate) fn begin(&self, key: &SubscriptionKey, consumer: &Consumer) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .expect("pending lock")
            .entry(key.clone())
            .or_default()
            .push(PendingEntry {
                token,
                consumer: Arc::clone(consumer),
                cancelled: false,
            });
        token
    }

    /// Mark one live in-flight entry for this consumer as cancelled.
    /// Returns false when nothing is in flight, i.e. the normal
    /// registry-backed unsubscribe path applies.
    pub(crate) fn cancel(&self, key: &SubscriptionKey, consumer: &Consumer) -> bool {
        let mut entries = self.entries.lock().expect("pending lock");
        let Some(pending) = entries.get_mut(key) else {
            return false;
        };
        match pending
            .iter_mut()
            .find(|entry| !entry.cancelled && Arc::ptr_eq(&entry.consumer, consumer))
        {
            Some(entry) => {
                entry.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Whether any non-cancelled subscribe is still in flight for the key.
    pub(crate) fn has_live(&self, key: &SubscriptionKey) -> bool {
        self.entries
            .lock()
            .expect("pending lock")
            .get(key)
            .is_some_and(|pending| pending.iter().any(|entry| !entry.cancelled))
    }

    /// Retire an in-flight entry, reporting whether it was cancelled while
    /// the HTTP subscribe was still running.
    pub(crate) fn finish(&self, key: &SubscriptionKey, token: u64) -> bool {
        let mut entries = self.entries.lock().expect("pending lock");
        let Some(pending) = entries.get_mut(key) else {
            return false;
        };
        let cancelled = match pending.iter().position(|entry| entry.token == token) {
            Some(position) => pending.remove(position).cancelled,
            None => false,
        };
        if pending.is_empty() {
            entries.remove(key);
        }
        cancelled
    }

    pub(crate) fn mark_orphaned(&self, key: &SubscriptionKey) {
        self.orphaned
            .lock()
            .expect("pending lock")
            .insert(key.clone());
    }

    /// Take the orphan mark for the key. Returns whether it was set.
    pub(crate) fn clear_orphaned(&self, key: &SubscriptionKey) -> bool {
        self.orphaned.lock().expect("pending lock").remove(key)
    }
}

struct ClientShared {
    client_id: ClientId,
    config: ClientConfig,
    http: HttpChannel,
    registry: SubscriptionRegistry,
    pending: PendingSubscribes,
    middleware: Vec<Arc<dyn Middleware>>,
}

/// Handle to one RPC client. Cheap to clone; all clones share the same
/// registry, channels, and client id.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<ClientShared>,
    push: Option<PushChannel>,
}

pub struct RpcClientBuilder {
    config: ClientConfig,
    cache: Option<Arc<dyn CacheAdapter>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl RpcClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            cache: None,
            middleware: Vec::new(),
        }
    }

    /// External stale-while-revalidate source consulted for fresh
    /// consumers and written through on every observed value.
    pub fn cache(mut self, cache: Arc<dyn CacheAdapter>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Append a middleware; the chain runs in registration order.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn build(self) -> Result<RpcClient> {
        let client_id = ClientId::new();
        let http = HttpChannel::new(&self.config.base_url, client_id, self.config.call_timeout)?;
        let shared = Arc::new(ClientShared {
            client_id,
            config: self.config.clone(),
            http,
            registry: SubscriptionRegistry::new(self.cache),
            pending: PendingSubscribes::default(),
            middleware: self.middleware,
        });
        let push = if self.config.push_enabled {
            let frame_shared = Arc::clone(&shared);
            let reconnect_shared = Arc::clone(&shared);
            Some(PushChannel::new(PushChannelConfig {
                url: self.config.events_url(client_id),
                reconnect_delay: self.config.reconnect_delay,
                error_delay_max: self.config.error_delay_max,
                ping_interval: self.config.ping_interval,
                on_frame: Arc::new(move |frame| {
                    frame_shared
                        .registry
                        .consume(&frame.item, &frame.parameters, frame.data);
                }),
                on_reconnected: Arc::new(move || {
                    tokio::spawn(run_resubscribe(Arc::clone(&reconnect_shared)));
                }),
            }))
        } else {
            None
        };
        if let Some(push) = &push
            && self.config.connect_on_create
        {
            push.connect();
        }
        Ok(RpcClient { shared, push })
    }
}

impl RpcClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        RpcClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> RpcClientBuilder {
        RpcClientBuilder::new(config)
    }

    /// Stable for the lifetime of this client; sent on every HTTP request
    /// and embedded in the push handshake.
    pub fn client_id(&self) -> ClientId {
        self.shared.client_id
    }

    pub async fn call(&self, item: &str, parameters: Vec<Value>) -> Result<Value> {
        self.call_with_options(item, parameters, CallOptions::default())
            .await
    }

    pub async fn call_with_options(
        &self,
        item: &str,
        parameters: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value> {
        self.invoke(Route::Call, InvocationType::Call, item, parameters, options)
            .await
    }

    pub async fn subscribe(
        &self,
        item: &str,
        parameters: Vec<Value>,
        consumer: Consumer,
    ) -> Result<()> {
        self.subscribe_with_options(item, parameters, consumer, CallOptions::default())
            .await
    }

    /// Attach a consumer to a subscription key.
    ///
    /// Delivery order per consumer: the cached value (if any) first and
    /// synchronously, then the authoritative initial value from the HTTP
    /// subscribe, then pushes. If the HTTP subscribe fails nothing is
    /// recorded and the error surfaces to the caller.
    pub async fn subscribe_with_options(
        &self,
        item: &str,
        parameters: Vec<Value>,
        consumer: Consumer,
        options: CallOptions,
    ) -> Result<()> {
        if let Some(cached) = self.shared.registry.get_cached(item, &parameters) {
            consumer(cached);
        }
        if !self.shared.config.push_enabled {
            return self
                .subscribe_one_shot(item, parameters, consumer, options)
                .await;
        }
        if let Some(push) = &self.push {
            // Fire-and-forget: a socket failure must not fail the
            // subscribe; pushes resume after reconnect + resubscribe.
            push.connect();
        }
        let key = SubscriptionKey::new(item, &parameters);
        let token = self.shared.pending.begin(&key, &consumer);
        let result = self
            .invoke(
                Route::Subscribe,
                InvocationType::Subscribe,
                item,
                parameters.clone(),
                options,
            )
            .await;
        let cancelled = self.shared.pending.finish(&key, token);
        let initial = match result {
            Ok(initial) => initial,
            Err(err) => {
                // A cancelled sibling may have deferred its server cleanup
                // to this subscribe; being the last one out means doing
                // that cleanup before surfacing the error.
                self.reconcile_orphaned(&key, item, &parameters).await;
                return Err(err);
            }
        };
        if cancelled {
            // The consumer unsubscribed while the HTTP leg was in flight,
            // and the server recorded the subscription.
            if self.shared.registry.has_consumers(item, &parameters) {
                // Another consumer owns the key; the server state stays.
                return Ok(());
            }
            // Publish the cleanup duty before checking for takers, so a
            // sibling subscribe finishing concurrently cannot miss it.
            self.shared.pending.mark_orphaned(&key);
            if self.shared.pending.has_live(&key) {
                // The sibling still in flight adopts the key on success or
                // takes the mark and releases it on failure.
                return Ok(());
            }
            if self.shared.pending.clear_orphaned(&key)
                && let Err(err) = self.shared.http.unsubscribe(item, &parameters).await
            {
                warn!(item, error = %err, "compensating unsubscribe failed");
            }
            return Ok(());
        }
        // Registered: the server subscription is owned again and the
        // normal unsubscribe path will release it.
        self.shared.pending.clear_orphaned(&key);
        self.shared
            .registry
            .subscribe(initial, item, parameters, consumer);
        Ok(())
    }

    // Release a server subscription left behind by a cancelled sibling,
    // but only when nothing local still wants the key.
    async fn reconcile_orphaned(&self, key: &SubscriptionKey, item: &str, parameters: &[Value]) {
        if self.shared.registry.has_consumers(item, parameters)
            || self.shared.pending.has_live(key)
        {
            return;
        }
        if self.shared.pending.clear_orphaned(key)
            && let Err(err) = self.shared.http.unsubscribe(item, parameters).await
        {
            warn!(item, error = %err, "compensating unsubscribe failed");
        }
    }

    // Push disabled: degrade to a one-shot call. The consumer sees the
    // value exactly once and is never registered.
    async fn subscribe_one_shot(
        &self,
        item: &str,
        parameters: Vec<Value>,
        consumer: Consumer,
        options: CallOptions,
    ) -> Result<()> {
        let value = self
            .invoke(
                Route::Call,
                InvocationType::Subscribe,
                item,
                parameters.clone(),
                options,
            )
            .await?;
        self.shared.registry.write_through(item, &parameters, &value);
        consumer(value);
        Ok(())
    }

    /// Detach one occurrence of the consumer. When the last consumer for
    /// the key goes away the server-side subscription is released; errors
    /// on that HTTP leg are logged, never surfaced, since local state is
    /// already reconciled.
    pub async fn unsubscribe(
        &self,
        item: &str,
        parameters: &[Value],
        consumer: &Consumer,
    ) -> Result<()> {
        let key = SubscriptionKey::new(item, parameters);
        if self.shared.pending.cancel(&key, consumer) {
            // Still in flight; the subscribe path compensates on arrival.
            return Ok(());
        }
        let none_left = self.shared.registry.unsubscribe(item, parameters, consumer);
        if none_left
            && let Err(err) = self
                .invoke(
                    Route::Unsubscribe,
                    InvocationType::Unsubscribe,
                    item,
                    parameters.to_vec(),
                    CallOptions::default(),
                )
                .await
        {
            warn!(item, error = %err, "server unsubscribe failed");
        }
        Ok(())
    }

    /// Observe the push channel state machine; `None` when push delivery
    /// is disabled.
    pub fn push_state(&self) -> Option<watch::Receiver<PushState>> {
        self.push.as_ref().map(|push| push.state())
    }

    /// Number of locally-live subscription keys.
    pub fn active_subscription_keys(&self) -> usize {
        self.shared.registry.key_count()
    }

    /// Release the socket. Deliberately leaves the registry intact:
    /// consumers keep their handlers and cached values across transport
    /// outages, and the next connect rebuilds server state.
    pub fn close(&self) {
        if let Some(push) = &self.push {
            push.close();
        }
    }

    async fn invoke(
        &self,
        route: Route,
        invocation_type: InvocationType,
        item: &str,
        parameters: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value> {
        let ctx = InvocationContext {
            client_id: self.shared.client_id,
            item: item.to_string(),
            invocation_type,
        };
        let http = self.shared.http.clone();
        let item = item.to_string();
        let timeout = options.timeout;
        let terminal: Terminal<'_> = Box::new(move |params| {
            Box::pin(async move {
                match route {
                    Route::Call => http.call(&item, &params, timeout).await,
                    Route::Subscribe => http.subscribe(&item, &params, timeout).await,
                    Route::Unsubscribe => http
                        .unsubscribe(&item, &params)
                        .await
                        .map(|_| Value::Null),
                }
            })
        });
        with_middlewares(&ctx, &self.shared.middleware, parameters, terminal).await
    }
}

/// Post-reconnect pass: re-register every locally-live key and feed the
/// fresh value through the registry. A key whose re-subscribe fails is
/// irrecoverable for this generation; its consumers are detached locally.
async fn run_resubscribe(shared: Arc<ClientShared>) {
    let snapshots = shared.registry.all_subscriptions();
    debug!(keys = snapshots.len(), "resubscribing after reconnect");
    for snapshot in snapshots {
        match shared
            .http
            .subscribe(&snapshot.item, &snapshot.parameters, None)
            .await
        {
            Ok(value) => {
                shared
                    .registry
                    .consume(&snapshot.item, &snapshot.parameters, value);
            }
            Err(err) => {
                warn!(
                    item = %snapshot.item,
                    consumers = snapshot.consumers.len(),
                    error = %err,
                    "resubscribe failed, detaching consumers"
                );
                let detached = shared
                    .registry
                    .detach_all(&snapshot.item, &snapshot.parameters);
                metrics::counter!("strand_client_resubscribe_detached_total")
                    .increment(detached as u64);
            }
        }
    }
}
