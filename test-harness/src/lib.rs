//! In-process RPC server used by the strand integration tests.
//!
//! Speaks the same protocol as a production peer: the three `/rpc/*` HTTP
//! routes keyed by the `x-rpc-client-id` header, and a `/rpc/events`
//! WebSocket endpoint that pushes data frames to the socket paired with
//! each client id. Tests register items, mutate topic values, trigger
//! pushes, and assert on the server-side subscription table.
//
// Test HTTP/WS servers here avoid hangs the same way the rest of the
// workspace's test support does: readiness polling instead of sleeps and
// graceful shutdown so servers don't linger between tests.
use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use strand_common::ClientId;
use strand_common::ids::SessionId;
use strand_wire::{DataFrame, ErrorEnvelope, PING_TEXT, PONG_TEXT, PushMessage, parameters_key};

pub const CLIENT_ID_HEADER: &str = "x-rpc-client-id";

/// Item supplier: computes the current value for a parameter tuple.
pub type ItemHandler = Arc<
    dyn Fn(Vec<Value>) -> BoxFuture<'static, std::result::Result<Value, ErrorEnvelope>>
        + Send
        + Sync,
>;

/// Supplier that always returns a fixed value.
pub fn fixed(value: Value) -> ItemHandler {
    Arc::new(move |_params| {
        let value = value.clone();
        Box::pin(async move { Ok(value) })
    })
}

/// Supplier that sleeps before answering, for timeout scenarios.
pub fn delayed(value: Value, delay: Duration) -> ItemHandler {
    Arc::new(move |_params| {
        let value = value.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        })
    })
}

/// Supplier that always fails with the given envelope.
pub fn failing(envelope: ErrorEnvelope) -> ItemHandler {
    Arc::new(move |_params| {
        let envelope = envelope.clone();
        Box::pin(async move { Err(envelope) })
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SubscriptionEntry {
    client: String,
    item: String,
    parameters: String,
}

struct SocketHandle {
    session: SessionId,
    sender: mpsc::UnboundedSender<WsMessage>,
}

struct ServerState {
    items: Mutex<HashMap<String, ItemHandler>>,
    // Set semantics make duplicate subscribes for the same (client, key)
    // idempotent, the contract the client's resubscribe pass relies on.
    subscriptions: Mutex<HashSet<SubscriptionEntry>>,
    sockets: Mutex<HashMap<String, SocketHandle>>,
    message_counter: AtomicU64,
}

/// One running in-process server bound to an ephemeral port.
pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn spawn() -> Result<Self> {
        let state = Arc::new(ServerState {
            items: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            sockets: Mutex::new(HashMap::new()),
            message_counter: AtomicU64::new(1),
        });
        let router = Router::new()
            .route("/rpc/call/*item", post(handle_call))
            .route("/rpc/subscribe/*item", post(handle_subscribe))
            .route("/rpc/unsubscribe/*item", post(handle_unsubscribe))
            .route("/rpc/events", get(handle_events))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind test server")?;
        let addr = listener.local_addr().context("test server addr")?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router.into_make_service());
            let _ = serve
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        wait_for_listen(addr).await?;
        Ok(Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn register_item(&self, name: &str, handler: ItemHandler) {
        self.state
            .items
            .lock()
            .expect("items lock")
            .insert(name.to_string(), handler);
    }

    /// Register an item whose current value tests can mutate.
    pub fn register_topic(&self, name: &str, initial: Value) -> TopicHandle {
        let value = Arc::new(Mutex::new(initial));
        let shared = Arc::clone(&value);
        self.register_item(
            name,
            Arc::new(move |_params| {
                let current = shared.lock().expect("topic value").clone();
                Box::pin(async move { Ok(current) })
            }),
        );
        TopicHandle { value }
    }

    /// Push the item's current value to every client subscribed to the
    /// key. Returns how many sockets were pushed to.
    pub async fn trigger(&self, item: &str, parameters: &[Value]) -> Result<usize> {
        let handler = self
            .state
            .items
            .lock()
            .expect("items lock")
            .get(item)
            .cloned()
            .with_context(|| format!("unknown item: {item}"))?;
        let data = handler(parameters.to_vec())
            .await
            .map_err(|envelope| anyhow!("supplier failed: {}", envelope.message))?;
        let key = parameters_key(parameters);
        let clients: Vec<String> = self
            .state
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .iter()
            .filter(|entry| entry.item == item && entry.parameters == key)
            .map(|entry| entry.client.clone())
            .collect();
        let mut pushed = 0;
        let sockets = self.state.sockets.lock().expect("sockets lock");
        for client in clients {
            let Some(socket) = sockets.get(&client) else {
                continue;
            };
            let frame = PushMessage::Data(DataFrame {
                message_id: self.state.message_counter.fetch_add(1, Ordering::Relaxed),
                item: item.to_string(),
                parameters: parameters.to_vec(),
                data: data.clone(),
            });
            if socket.sender.send(WsMessage::Text(frame.encode())).is_ok() {
                pushed += 1;
            }
        }
        Ok(pushed)
    }

    /// Server-side subscription count for a key, across all clients.
    pub fn subscription_count(&self, item: &str, parameters: &[Value]) -> usize {
        let key = parameters_key(parameters);
        self.state
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .iter()
            .filter(|entry| entry.item == item && entry.parameters == key)
            .count()
    }

    pub fn connected_socket_count(&self) -> usize {
        self.state.sockets.lock().expect("sockets lock").len()
    }

    /// Close every push socket, as a crashing intermediary would. The
    /// socket tasks drop their clients' subscriptions on the way out.
    pub fn force_close_sockets(&self) {
        let sockets = self.state.sockets.lock().expect("sockets lock");
        for socket in sockets.values() {
            let _ = socket.sender.send(WsMessage::Close(None));
        }
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await.context("server task join")?;
        }
        Ok(())
    }
}

/// Mutable current value of a registered topic.
pub struct TopicHandle {
    value: Arc<Mutex<Value>>,
}

impl TopicHandle {
    pub fn set(&self, value: Value) {
        *self.value.lock().expect("topic value") = value;
    }
}

/// Install a fmt subscriber once for the whole test binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    });
}

async fn wait_for_listen(addr: SocketAddr) -> Result<()> {
    // Readiness polling instead of sleeps.
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        match tokio::net::TcpStream::connect(addr).await {
            Ok(_) => return Ok(()),
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(anyhow!("server not ready at {addr}: {err}"));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

fn client_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(CLIENT_ID_HEADER)?.to_str().ok()?;
    // Ids must parse; garbage here means a broken client.
    ClientId::from_str(raw).ok()?;
    Some(raw.to_string())
}

fn envelope_response(envelope: ErrorEnvelope) -> Response {
    let status =
        StatusCode::from_u16(envelope.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(envelope)).into_response()
}

async fn run_item(
    state: &ServerState,
    item: &str,
    parameters: Vec<Value>,
) -> std::result::Result<Value, ErrorEnvelope> {
    let handler = state
        .items
        .lock()
        .expect("items lock")
        .get(item)
        .cloned()
        .ok_or_else(|| ErrorEnvelope::new(404, format!("no such item: {item}")))?;
    handler(parameters).await
}

async fn handle_call(
    State(state): State<Arc<ServerState>>,
    Path(item): Path<String>,
    headers: HeaderMap,
    Json(parameters): Json<Vec<Value>>,
) -> Response {
    if client_from_headers(&headers).is_none() {
        return envelope_response(ErrorEnvelope::new(400, "missing or invalid client id"));
    }
    match run_item(&state, &item, parameters).await {
        Ok(value) => Json(value).into_response(),
        Err(envelope) => envelope_response(envelope),
    }
}

async fn handle_subscribe(
    State(state): State<Arc<ServerState>>,
    Path(item): Path<String>,
    headers: HeaderMap,
    Json(parameters): Json<Vec<Value>>,
) -> Response {
    let Some(client) = client_from_headers(&headers) else {
        return envelope_response(ErrorEnvelope::new(400, "missing or invalid client id"));
    };
    // Supplier first: a failing subscribe must leave no subscription.
    match run_item(&state, &item, parameters.clone()).await {
        Ok(value) => {
            state
                .subscriptions
                .lock()
                .expect("subscriptions lock")
                .insert(SubscriptionEntry {
                    client,
                    item,
                    parameters: parameters_key(&parameters),
                });
            Json(value).into_response()
        }
        Err(envelope) => envelope_response(envelope),
    }
}

async fn handle_unsubscribe(
    State(state): State<Arc<ServerState>>,
    Path(item): Path<String>,
    headers: HeaderMap,
    Json(parameters): Json<Vec<Value>>,
) -> Response {
    let Some(client) = client_from_headers(&headers) else {
        return envelope_response(ErrorEnvelope::new(400, "missing or invalid client id"));
    };
    state
        .subscriptions
        .lock()
        .expect("subscriptions lock")
        .remove(&SubscriptionEntry {
            client,
            item,
            parameters: parameters_key(&parameters),
        });
    Json(Value::Null).into_response()
}

async fn handle_events(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(client) = query
        .get("client-id")
        .filter(|raw| ClientId::from_str(raw).is_ok())
        .cloned()
    else {
        return envelope_response(ErrorEnvelope::new(400, "missing or invalid client id"));
    };
    ws.on_upgrade(move |socket| run_socket(state, client, socket))
}

async fn run_socket(state: Arc<ServerState>, client: String, socket: WebSocket) {
    let session = SessionId::new();
    debug!(%session, client, "push socket connected");
    let (sender, mut queued_rx) = mpsc::unbounded_channel::<WsMessage>();
    state
        .sockets
        .lock()
        .expect("sockets lock")
        .insert(client.clone(), SocketHandle { session, sender });
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            queued = queued_rx.recv() => match queued {
                Some(message) => {
                    let closing = matches!(message, WsMessage::Close(_));
                    if sink.send(message).await.is_err() || closing {
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = sink.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Text(text))) if text == PING_TEXT => {
                    let _ = sink.send(WsMessage::Text(PONG_TEXT.to_string())).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%session, error = %err, "push socket error");
                    break;
                }
            },
        }
    }
    // On socket close the server drops its side of this client's
    // subscriptions; the client's resubscribe pass rebuilds them. Guard on
    // the session so a fast reconnect's fresh state survives this cleanup.
    let mut sockets = state.sockets.lock().expect("sockets lock");
    let current = sockets
        .get(&client)
        .is_some_and(|handle| handle.session == session);
    if current {
        sockets.remove(&client);
        drop(sockets);
        state
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .retain(|entry| entry.client != client);
    }
    debug!(%session, client, "push socket closed");
}
