// Client-visible error taxonomy with canonical numeric codes.
use serde_json::Value;
use std::time::Duration;
use strand_wire::{CODE_NOT_FOUND, CODE_TIMEOUT, CODE_TRANSPORT, ErrorEnvelope};

pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("item not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server error {code}: {message}")]
    Application {
        code: u16,
        message: String,
        details: Option<Value>,
    },
}

impl RpcError {
    pub fn code(&self) -> u16 {
        match self {
            RpcError::Timeout(_) => CODE_TIMEOUT,
            RpcError::NotFound(_) => CODE_NOT_FOUND,
            RpcError::Transport(_) => CODE_TRANSPORT,
            RpcError::Application { code, .. } => *code,
        }
    }

    // Map a decoded server envelope onto the taxonomy; unknown codes are
    // forwarded verbatim as application errors.
    pub(crate) fn from_envelope(item: &str, envelope: ErrorEnvelope) -> Self {
        match envelope.code {
            CODE_NOT_FOUND => RpcError::NotFound(item.to_string()),
            code => RpcError::Application {
                code,
                message: envelope.message,
                details: envelope.details,
            },
        }
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        RpcError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn codes_match_the_wire_constants() {
        assert_eq!(RpcError::Timeout(Duration::from_millis(200)).code(), 504);
        assert_eq!(RpcError::NotFound("x".into()).code(), 404);
        assert_eq!(RpcError::transport("boom").code(), 502);
    }

    #[test]
    fn envelope_not_found_maps_to_not_found() {
        let err = RpcError::from_envelope("demo/item", ErrorEnvelope::new(404, "missing"));
        assert!(matches!(err, RpcError::NotFound(item) if item == "demo/item"));
    }

    #[test]
    fn envelope_unknown_code_is_forwarded_verbatim() {
        let envelope = ErrorEnvelope::new(409, "conflict").with_details(json!({"hint": "retry"}));
        let err = RpcError::from_envelope("demo/item", envelope);
        match err {
            RpcError::Application {
                code,
                message,
                details,
            } => {
                assert_eq!(code, 409);
                assert_eq!(message, "conflict");
                assert_eq!(details, Some(json!({"hint": "retry"})));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
