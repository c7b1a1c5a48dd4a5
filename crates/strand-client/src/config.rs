// Client-side defaults and configuration layering helpers.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;
use strand_common::ClientId;

pub(crate) const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;
pub(crate) const DEFAULT_RECONNECT_DELAY_MS: u64 = 250;
pub(crate) const DEFAULT_ERROR_DELAY_MAX_MS: u64 = 30_000;
pub(crate) const DEFAULT_PING_INTERVAL_MS: u64 = 15_000;

/// Consumer-facing configuration for one client.
///
/// Values layer in three steps: hard defaults, `STRAND_*` environment
/// overrides, then an optional YAML override file applied on top. The
/// cache adapter and middleware chain are builder options, not config.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base, e.g. `http://127.0.0.1:4000`. The push endpoint is
    /// derived from it by swapping the scheme to `ws`/`wss`.
    pub base_url: String,
    /// Default per-call deadline; individual invocations may override.
    pub call_timeout: Duration,
    /// Initial reconnect backoff after a socket failure.
    pub reconnect_delay: Duration,
    /// Backoff ceiling; the delay doubles until it reaches this.
    pub error_delay_max: Duration,
    /// Liveness probe period for the push socket.
    pub ping_interval: Duration,
    /// Whether push delivery is enabled at all; when false, subscribes
    /// degrade to one-shot calls.
    pub push_enabled: bool,
    /// Open the push socket eagerly at construction instead of on the
    /// first subscribe.
    pub connect_on_create: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    call_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    error_delay_max_ms: Option<u64>,
    ping_interval_ms: Option<u64>,
    push_enabled: Option<bool>,
    connect_on_create: Option<bool>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            error_delay_max: Duration::from_millis(DEFAULT_ERROR_DELAY_MAX_MS),
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            push_enabled: true,
            connect_on_create: false,
        }
    }

    pub fn from_env(base_url: impl Into<String>) -> Self {
        let mut config = Self::new(base_url);
        if let Some(value) = read_u64_env("STRAND_CALL_TIMEOUT_MS") {
            config.call_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("STRAND_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("STRAND_ERROR_DELAY_MAX_MS") {
            config.error_delay_max = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("STRAND_PING_INTERVAL_MS") {
            config.ping_interval = Duration::from_millis(value);
        }
        if let Some(value) = read_bool_env("STRAND_PUSH_ENABLED") {
            config.push_enabled = value;
        }
        if let Some(value) = read_bool_env("STRAND_CONNECT_ON_CREATE") {
            config.connect_on_create = value;
        }
        config
    }

    pub fn from_env_or_yaml(
        base_url: impl Into<String>,
        config_path: Option<&str>,
    ) -> Result<Self> {
        let mut config = Self::from_env(base_url);
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("STRAND_CLIENT_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return Err(err).with_context(|| format!("read client config: {path}"));
                }
            },
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    // Push endpoint derived from the HTTP base; the client id rides in the
    // handshake query string so the server can pair both channels.
    pub(crate) fn events_url(&self, client_id: ClientId) -> String {
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/rpc/events?client-id={client_id}")
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = self.call_timeout_ms
            && value > 0
        {
            config.call_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.reconnect_delay_ms
            && value > 0
        {
            config.reconnect_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.error_delay_max_ms
            && value > 0
        {
            config.error_delay_max = Duration::from_millis(value);
        }
        if let Some(value) = self.ping_interval_ms
            && value > 0
        {
            config.ping_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.push_enabled {
            config.push_enabled = value;
        }
        if let Some(value) = self.connect_on_create {
            config.connect_on_create = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}
