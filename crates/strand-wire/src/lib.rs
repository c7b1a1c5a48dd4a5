// Wire format for frames pushed from server to client.
//
// Every push frame is a tagged JSON array sent as one WebSocket text
// message. The only frame a client consumes is `Data`:
//
//   [13, messageId, itemName, parameters, data]
//
// `PING`/`PONG` bare-text frames exist as an application-level liveness
// fallback for transports that cannot surface native control frames.
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const DATA_TAG: u64 = 13;

pub const PING_TEXT: &str = "PING";
pub const PONG_TEXT: &str = "PONG";

// Canonical error codes carried by the error envelope.
pub const CODE_NOT_FOUND: u16 = 404;
pub const CODE_TRANSPORT: u16 = 502;
pub const CODE_TIMEOUT: u16 = 504;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame is not a tagged array")]
    NotAnArray,
    #[error("unsupported frame tag {0}")]
    UnsupportedTag(Value),
    #[error("frame too short: expected {expected} elements, got {got}")]
    TooShort { expected: usize, got: usize },
    #[error("invalid frame field: {0}")]
    InvalidField(&'static str),
}

/// One pushed value for a subscription key.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub message_id: u64,
    pub item: String,
    pub parameters: Vec<Value>,
    pub data: Value,
}

/// Inbound WebSocket message as seen by the client.
///
/// ```
/// use strand_wire::{DataFrame, PushMessage};
/// use serde_json::json;
///
/// let frame = PushMessage::Data(DataFrame {
///     message_id: 7,
///     item: "weather/current".into(),
///     parameters: vec![json!("berlin")],
///     data: json!({"r": "1"}),
/// });
/// let encoded = frame.encode();
/// let decoded = PushMessage::decode(&encoded).expect("decode");
/// assert_eq!(decoded, frame);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    Data(DataFrame),
    Ping,
    Pong,
}

impl PushMessage {
    pub fn encode(&self) -> String {
        match self {
            PushMessage::Data(frame) => json!([
                DATA_TAG,
                frame.message_id,
                frame.item,
                frame.parameters,
                frame.data,
            ])
            .to_string(),
            PushMessage::Ping => PING_TEXT.to_string(),
            PushMessage::Pong => PONG_TEXT.to_string(),
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        // The liveness fallback frames are bare words, not json.
        match text {
            PING_TEXT => return Ok(PushMessage::Ping),
            PONG_TEXT => return Ok(PushMessage::Pong),
            _ => {}
        }
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(elements) = value else {
            return Err(Error::NotAnArray);
        };
        let Some(tag) = elements.first() else {
            return Err(Error::TooShort {
                expected: 5,
                got: 0,
            });
        };
        if tag.as_u64() != Some(DATA_TAG) {
            return Err(Error::UnsupportedTag(tag.clone()));
        }
        if elements.len() < 5 {
            return Err(Error::TooShort {
                expected: 5,
                got: elements.len(),
            });
        }
        let message_id = elements[1]
            .as_u64()
            .ok_or(Error::InvalidField("messageId"))?;
        let item = elements[2]
            .as_str()
            .ok_or(Error::InvalidField("itemName"))?
            .to_string();
        let parameters = elements[3]
            .as_array()
            .ok_or(Error::InvalidField("parameters"))?
            .clone();
        let data = elements[4].clone();
        Ok(PushMessage::Data(DataFrame {
            message_id,
            item,
            parameters,
            data,
        }))
    }
}

/// Error shape returned by either channel: a numeric code plus a message.
/// Extra fields are opaque and forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorEnvelope {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Canonical serialization of a parameter array.
///
/// Subscription equality on both sides of the protocol keys off this exact
/// string, so the scheme must not change independently on either side.
pub fn parameters_key(parameters: &[Value]) -> String {
    // Serializing a json value array cannot fail.
    serde_json::to_string(parameters).expect("parameter array serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trip() {
        // Encoding then decoding should preserve every field.
        let frame = PushMessage::Data(DataFrame {
            message_id: 42,
            item: "stocks/quote".into(),
            parameters: vec![json!({"symbol": "ACME"})],
            data: json!({"price": 12.5}),
        });
        let decoded = PushMessage::decode(&frame.encode()).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_handles_liveness_fallback() {
        assert_eq!(PushMessage::decode("PING").expect("ping"), PushMessage::Ping);
        assert_eq!(PushMessage::decode("PONG").expect("pong"), PushMessage::Pong);
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let err = PushMessage::decode(r#"[99, 1, "item", [], null]"#).expect_err("tag");
        assert!(matches!(err, Error::UnsupportedTag(_)));
    }

    #[test]
    fn decode_rejects_short_array() {
        let err = PushMessage::decode(r#"[13, 1, "item"]"#).expect_err("short");
        assert!(matches!(err, Error::TooShort { expected: 5, got: 3 }));
    }

    #[test]
    fn decode_rejects_non_array() {
        let err = PushMessage::decode(r#"{"tag": 13}"#).expect_err("object");
        assert!(matches!(err, Error::NotAnArray));
    }

    #[test]
    fn decode_rejects_bad_parameters() {
        let err =
            PushMessage::decode(r#"[13, 1, "item", "not-an-array", null]"#).expect_err("params");
        assert!(matches!(err, Error::InvalidField("parameters")));
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let err = PushMessage::decode("not json at all").expect_err("json");
        assert!(matches!(err, Error::InvalidJson(_)));
    }

    #[test]
    fn parameters_key_distinguishes_values() {
        let a = parameters_key(&[json!("berlin")]);
        let b = parameters_key(&[json!("paris")]);
        assert_ne!(a, b);
        assert_eq!(a, parameters_key(&[json!("berlin")]));
    }

    #[test]
    fn error_envelope_serializes_without_empty_details() {
        let envelope = ErrorEnvelope::new(CODE_NOT_FOUND, "no such item");
        let text = serde_json::to_string(&envelope).expect("serialize");
        assert!(!text.contains("details"));

        let detailed = ErrorEnvelope::new(CODE_TIMEOUT, "deadline elapsed")
            .with_details(json!({"after_ms": 200}));
        let parsed: ErrorEnvelope =
            serde_json::from_str(&serde_json::to_string(&detailed).expect("serialize"))
                .expect("parse");
        assert_eq!(parsed, detailed);
    }
}
