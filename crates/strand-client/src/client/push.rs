//! WebSocket push channel: reconnect supervision, liveness, dispatch.
//!
//! # Purpose
//! Owns the one socket on which the server pushes subscription data. The
//! channel never initiates subscriptions itself; it only receives frames,
//! keeps the socket alive, and tells its owner when a reconnect happened
//! so server-side state can be rebuilt.
//!
//! # Design notes
//! A single supervisor task runs the connect/backoff loop; the socket loop
//! inside it multiplexes inbound frames, the ping timer, and shutdown. A
//! connect failure is never surfaced to subscribers; pushes simply resume
//! once the socket is up and the resubscribe pass has run.
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use strand_wire::{DataFrame, PONG_TEXT, PushMessage};

/// Connection lifecycle states, observable through [`PushChannel::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Disconnected,
    Connecting,
    Open,
    Backoff,
    Closed,
}

pub(crate) type FrameHandler = Arc<dyn Fn(DataFrame) + Send + Sync>;
pub(crate) type ReconnectHandler = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct PushChannelConfig {
    pub(crate) url: String,
    pub(crate) reconnect_delay: Duration,
    pub(crate) error_delay_max: Duration,
    pub(crate) ping_interval: Duration,
    /// Invoked for every inbound data frame, on the socket task.
    pub(crate) on_frame: FrameHandler,
    /// Invoked after every successful connect except the first.
    pub(crate) on_reconnected: ReconnectHandler,
}

#[derive(Clone)]
pub(crate) struct PushChannel {
    inner: Arc<ChannelShared>,
}

struct ChannelShared {
    config: PushChannelConfig,
    state_tx: watch::Sender<PushState>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl ChannelShared {
    fn set_state(&self, state: PushState) {
        self.state_tx.send_replace(state);
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl PushChannel {
    pub(crate) fn new(config: PushChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(PushState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelShared {
                config,
                state_tx,
                shutdown_tx,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Start the supervisor if it is not already running. Never fails:
    /// connect errors feed the backoff loop, not the caller.
    pub(crate) fn connect(&self) {
        if self.inner.shutting_down() {
            return;
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.inner);
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(run_push_supervisor(shared, shutdown_rx));
    }

    /// Terminal: release the socket and stop the supervisor.
    pub(crate) fn close(&self) {
        self.inner.shutdown_tx.send_replace(true);
        if !self.inner.started.load(Ordering::SeqCst) {
            self.inner.set_state(PushState::Closed);
        }
    }

    pub(crate) fn state(&self) -> watch::Receiver<PushState> {
        self.inner.state_tx.subscribe()
    }
}

// Doubling backoff bounded by the configured ceiling.
pub(crate) fn next_backoff_delay(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

async fn run_push_supervisor(shared: Arc<ChannelShared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut delay = shared.config.reconnect_delay;
    let mut first_connect = true;
    loop {
        if shared.shutting_down() {
            break;
        }
        shared.set_state(PushState::Connecting);
        let connected = tokio::select! {
            result = connect_async(shared.config.url.as_str()) => match result {
                Ok((socket, _response)) => Some(socket),
                Err(err) => {
                    debug!(error = %err, "push connect failed");
                    None
                }
            },
            _ = shutdown_rx.changed() => break,
        };
        if let Some(socket) = connected {
            // A successful open resets the backoff schedule.
            delay = shared.config.reconnect_delay;
            metrics::counter!("strand_client_push_connects_total").increment(1);
            if !first_connect {
                metrics::counter!("strand_client_push_reconnects_total").increment(1);
                (shared.config.on_reconnected)();
            }
            first_connect = false;
            shared.set_state(PushState::Open);
            run_socket(&shared, socket, &mut shutdown_rx).await;
            if shared.shutting_down() {
                break;
            }
        }
        shared.set_state(PushState::Backoff);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
        delay = next_backoff_delay(delay, shared.config.error_delay_max);
    }
    shared.set_state(PushState::Closed);
}

async fn run_socket(
    shared: &ChannelShared,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let (mut sink, mut stream) = socket.split();
    // First probe fires one full interval after open, not immediately.
    let mut ping_timer = interval_at(
        Instant::now() + shared.config.ping_interval,
        shared.config.ping_interval,
    );
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_pending = false;
    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_push_text(shared, &text, &mut sink, &mut pong_pending).await;
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    match String::from_utf8(data) {
                        Ok(text) => {
                            handle_push_text(shared, &text, &mut sink, &mut pong_pending).await;
                        }
                        Err(_) => {
                            debug!("discarding non-utf8 binary push frame");
                            metrics::counter!("strand_client_push_decode_errors_total")
                                .increment(1);
                        }
                    }
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = sink.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    pong_pending = false;
                }
                Some(Ok(WsMessage::Close(_))) => {
                    debug!("push socket closed by server");
                    break;
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "push socket error");
                    break;
                }
                None => break,
            },
            _ = ping_timer.tick() => {
                if pong_pending {
                    // No pong since the previous probe; an intermediary has
                    // likely dropped the idle socket. Terminate and let the
                    // supervisor reconnect.
                    warn!("pong deadline missed, terminating push socket");
                    metrics::counter!("strand_client_push_ping_timeouts_total").increment(1);
                    break;
                }
                pong_pending = true;
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
}

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    WsMessage,
>;

async fn handle_push_text(
    shared: &ChannelShared,
    text: &str,
    sink: &mut WsSink,
    pong_pending: &mut bool,
) {
    match PushMessage::decode(text) {
        Ok(PushMessage::Data(frame)) => {
            (shared.config.on_frame)(frame);
        }
        // Application-level liveness fallback for restricted transports.
        Ok(PushMessage::Ping) => {
            let _ = sink.send(WsMessage::Text(PONG_TEXT.to_string())).await;
        }
        Ok(PushMessage::Pong) => {
            *pong_pending = false;
        }
        Err(err) => {
            debug!(error = %err, "discarding undecodable push frame");
            metrics::counter!("strand_client_push_decode_errors_total").increment(1);
        }
    }
}
