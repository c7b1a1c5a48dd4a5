//! HTTP channel for initiating calls, subscribes, and unsubscribes.
//!
//! # Purpose
//! The request/response half of the hybrid transport. Every request
//! carries the client id header so the server can pair it with the push
//! socket; per-invocation deadlines override the configured default.
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use strand_common::ClientId;
use strand_wire::ErrorEnvelope;
use tracing::debug;

use crate::error::{Result, RpcError};

pub const CLIENT_ID_HEADER: &str = "x-rpc-client-id";

#[derive(Clone)]
pub(crate) struct HttpChannel {
    http: reqwest::Client,
    base_url: String,
    client_id: ClientId,
    call_timeout: Duration,
}

impl HttpChannel {
    pub(crate) fn new(
        base_url: &str,
        client_id: ClientId,
        call_timeout: Duration,
    ) -> Result<Self> {
        // No proxy: localhost traffic must never be hijacked by ambient
        // proxy configuration. Deadlines are applied per request.
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(RpcError::transport)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
            call_timeout,
        })
    }

    pub(crate) async fn call(
        &self,
        item: &str,
        parameters: &[Value],
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.round_trip("call", item, parameters, timeout).await
    }

    /// Requests the current value and registers the subscription on the
    /// server side, keyed by this channel's client id.
    pub(crate) async fn subscribe(
        &self,
        item: &str,
        parameters: &[Value],
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.round_trip("subscribe", item, parameters, timeout).await
    }

    pub(crate) async fn unsubscribe(&self, item: &str, parameters: &[Value]) -> Result<()> {
        self.round_trip("unsubscribe", item, parameters, None)
            .await
            .map(|_| ())
    }

    async fn round_trip(
        &self,
        operation: &str,
        item: &str,
        parameters: &[Value],
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let deadline = timeout.unwrap_or(self.call_timeout);
        let url = format!("{}/rpc/{operation}/{item}", self.base_url);
        debug!(%url, ?deadline, "http round trip");
        let response = self
            .http
            .post(&url)
            .header(CLIENT_ID_HEADER, self.client_id.to_string())
            .timeout(deadline)
            .json(parameters)
            .send()
            .await
            .map_err(|err| classify_send_error(err, deadline))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(RpcError::transport);
        }
        let body = response.text().await.map_err(RpcError::transport)?;
        Err(decode_error_body(item, status, &body))
    }
}

fn classify_send_error(err: reqwest::Error, deadline: Duration) -> RpcError {
    if err.is_timeout() {
        // Dropping the request future cancels the in-flight transfer.
        RpcError::Timeout(deadline)
    } else {
        RpcError::transport(err)
    }
}

fn decode_error_body(item: &str, status: StatusCode, body: &str) -> RpcError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => RpcError::from_envelope(item, envelope),
        // Not an envelope; forward the raw status and body.
        Err(_) => RpcError::Application {
            code: status.as_u16(),
            message: body.to_string(),
            details: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_wire::CODE_TIMEOUT;

    #[test]
    fn error_body_with_envelope_is_decoded() {
        let body = r#"{"code": 404, "message": "no such item"}"#;
        let err = decode_error_body("demo/item", StatusCode::NOT_FOUND, body);
        assert!(matches!(err, RpcError::NotFound(item) if item == "demo/item"));
    }

    #[test]
    fn error_body_without_envelope_keeps_status() {
        let err = decode_error_body("demo/item", StatusCode::BAD_GATEWAY, "upstream fell over");
        match err {
            RpcError::Application { code, message, .. } => {
                assert_eq!(code, 502);
                assert_eq!(message, "upstream fell over");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn timeout_envelope_maps_onto_application_timeout_code() {
        let body = r#"{"code": 504, "message": "supplier deadline elapsed"}"#;
        let err = decode_error_body("demo/item", StatusCode::GATEWAY_TIMEOUT, body);
        assert_eq!(err.code(), CODE_TIMEOUT);
    }
}
