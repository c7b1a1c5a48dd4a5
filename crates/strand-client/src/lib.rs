//! Hybrid HTTP/WebSocket RPC client.
//!
//! Calls and subscription initiation travel over HTTP, carrying a stable
//! client id; subscription data is pushed over one WebSocket that the
//! client keeps alive with pings and automatic reconnect. A local registry
//! deduplicates subscriptions per `(item, parameters)` key so the server
//! holds at most one subscription per key however many consumers attach.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use strand_client::{ClientConfig, Consumer, RpcClient};
//!
//! # async fn demo() -> strand_client::Result<()> {
//! let client = RpcClient::new(ClientConfig::new("http://127.0.0.1:4000"))?;
//! let consumer: Consumer = Arc::new(|value| println!("observed {value}"));
//! client
//!     .subscribe("weather/current", vec![json!("berlin")], consumer.clone())
//!     .await?;
//! client
//!     .unsubscribe("weather/current", &[json!("berlin")], &consumer)
//!     .await?;
//! # Ok(())
//! # }
//! ```
mod client;
mod config;
mod error;
mod middleware;
mod registry;

pub use client::core::{CallOptions, RpcClient, RpcClientBuilder};
pub use client::http::CLIENT_ID_HEADER;
pub use client::push::PushState;
pub use config::ClientConfig;
pub use error::{Result, RpcError};
pub use middleware::{InvocationContext, InvocationType, Middleware, Next};
pub use registry::Consumer;

#[cfg(test)]
mod tests;
