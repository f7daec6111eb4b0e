//! Protocol envelopes
//!
//! Every message on the transport is a JSON object carrying one of three
//! variants. On the wire the variants share a flat field set:
//!
//! | variant      | marker                | fields                                   |
//! |--------------|-----------------------|------------------------------------------|
//! | Request      | `id` without `ok`     | `id`, `method`, `data`                   |
//! | Response     | `ok` present          | `id`, `ok`, `data` or `errorCode`/`errorReason` |
//! | Notification | `notification: true`  | `method`, `data`                         |
//!
//! `request: true` / `response: true` flags are written for peers that key on
//! them but are not required when decoding.

use beacon_common::ErrorCode;
use beacon_common::error::{
    CONNECTION_CLOSED, HANDLER_ERROR, METHOD_NOT_FOUND, PUBLISH_FAILED, REQUEST_TIMEOUT,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque JSON payload carried by every envelope.
pub type RawMessage = serde_json::Value;

/// Correlation id linking a request to its response.
pub type CorrelationId = u64;

/// Envelope encode/decode errors
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed envelope: {0}")]
    Malformed(&'static str),
}

/// A refusal to complete a request, carried back to the caller.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("rejected [{code}] {reason}")]
pub struct Rejection {
    pub code: i32,
    pub reason: String,
}

impl Rejection {
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn from_code(code: &ErrorCode<'_>) -> Self {
        Self::new(code.code, code.message)
    }

    pub fn timeout() -> Self {
        Self::from_code(&REQUEST_TIMEOUT)
    }

    pub fn connection_closed() -> Self {
        Self::from_code(&CONNECTION_CLOSED)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            METHOD_NOT_FOUND.code,
            format!("{}: {}", METHOD_NOT_FOUND.message, method),
        )
    }

    pub fn publish_failed(reason: impl std::fmt::Display) -> Self {
        Self::new(
            PUBLISH_FAILED.code,
            format!("{}: {}", PUBLISH_FAILED.message, reason),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.code == REQUEST_TIMEOUT.code
    }

    pub fn is_connection_closed(&self) -> bool {
        self.code == CONNECTION_CLOSED.code
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub id: CorrelationId,
    pub method: String,
    pub data: RawMessage,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub id: CorrelationId,
    pub result: Result<RawMessage, Rejection>,
}

impl Response {
    pub fn accept(id: CorrelationId, data: RawMessage) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn reject(id: CorrelationId, rejection: Rejection) -> Self {
        Self {
            id,
            result: Err(rejection),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub method: String,
    pub data: RawMessage,
}

/// One message on the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Flat JSON representation shared by all variants.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "is_false")]
    request: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    response: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    notification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    data: RawMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_reason: Option<String>,
}

impl From<&Envelope> for WireEnvelope {
    fn from(envelope: &Envelope) -> Self {
        match envelope {
            Envelope::Request(req) => WireEnvelope {
                request: true,
                id: Some(req.id),
                method: Some(req.method.clone()),
                data: req.data.clone(),
                ..Default::default()
            },
            Envelope::Response(resp) => match &resp.result {
                Ok(data) => WireEnvelope {
                    response: true,
                    id: Some(resp.id),
                    ok: Some(true),
                    data: data.clone(),
                    ..Default::default()
                },
                Err(rejection) => WireEnvelope {
                    response: true,
                    id: Some(resp.id),
                    ok: Some(false),
                    error_code: Some(rejection.code),
                    error_reason: Some(rejection.reason.clone()),
                    ..Default::default()
                },
            },
            Envelope::Notification(notification) => WireEnvelope {
                notification: true,
                method: Some(notification.method.clone()),
                data: notification.data.clone(),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        if wire.notification {
            let method = wire
                .method
                .ok_or(EnvelopeError::Malformed("notification without method"))?;
            return Ok(Envelope::Notification(Notification {
                method,
                data: wire.data,
            }));
        }

        if let Some(ok) = wire.ok {
            let id = wire
                .id
                .ok_or(EnvelopeError::Malformed("response without id"))?;
            let result = if ok {
                Ok(wire.data)
            } else {
                Err(Rejection::new(
                    wire.error_code.unwrap_or(HANDLER_ERROR.code),
                    wire.error_reason.unwrap_or_default(),
                ))
            };
            return Ok(Envelope::Response(Response { id, result }));
        }

        if let Some(id) = wire.id {
            let method = wire
                .method
                .ok_or(EnvelopeError::Malformed("request without method"))?;
            return Ok(Envelope::Request(Request {
                id,
                method,
                data: wire.data,
            }));
        }

        Err(EnvelopeError::Malformed(
            "envelope is neither request, response nor notification",
        ))
    }
}

impl Envelope {
    pub fn notification(method: impl Into<String>, data: RawMessage) -> Self {
        Envelope::Notification(Notification {
            method: method.into(),
            data,
        })
    }

    pub fn request(id: CorrelationId, method: impl Into<String>, data: RawMessage) -> Self {
        Envelope::Request(Request {
            id,
            method: method.into(),
            data,
        })
    }

    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Request(_) => "request",
            Envelope::Response(_) => "response",
            Envelope::Notification(_) => "notification",
        }
    }

    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        let wire = WireEnvelope::from(self);
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        Envelope::try_from(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let envelope = Envelope::request(7, "offer", json!({"sdp": "dummy"}));
        let bytes = envelope.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["request"], json!(true));
        assert_eq!(value["id"], json!(7));
        assert_eq!(value["method"], json!("offer"));
        assert_eq!(value["data"]["sdp"], json!("dummy"));
        assert!(value.get("ok").is_none());
        assert!(value.get("notification").is_none());
    }

    #[test]
    fn test_rejected_response_wire_format() {
        let envelope = Envelope::Response(Response::reject(3, Rejection::new(404, "Not found")));
        let bytes = envelope.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["response"], json!(true));
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["errorCode"], json!(404));
        assert_eq!(value["errorReason"], json!("Not found"));
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_notification_wire_format() {
        let envelope = Envelope::notification("foo", json!({"hello": "world"}));
        let bytes = envelope.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["notification"], json!(true));
        assert_eq!(value["method"], json!("foo"));
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_decode_classifies_by_markers() {
        // No request/response flags: presence of fields decides the variant
        let req = Envelope::decode(br#"{"id": 1, "method": "ping"}"#).unwrap();
        assert!(matches!(req, Envelope::Request(Request { id: 1, .. })));

        let resp = Envelope::decode(br#"{"id": 1, "ok": true, "data": "pong"}"#).unwrap();
        match resp {
            Envelope::Response(resp) => assert_eq!(resp.result, Ok(json!("pong"))),
            other => panic!("unexpected {:?}", other),
        }

        let notification =
            Envelope::decode(br#"{"notification": true, "method": "tick"}"#).unwrap();
        assert_eq!(notification.kind(), "notification");
    }

    #[test]
    fn test_decode_rejection_without_code_defaults_to_handler_error() {
        let resp = Envelope::decode(br#"{"id": 9, "ok": false}"#).unwrap();
        match resp {
            Envelope::Response(Response { id, result }) => {
                assert_eq!(id, 9);
                assert_eq!(result.unwrap_err().code, HANDLER_ERROR.code);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            Envelope::decode(br#"{"data": 1}"#),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(br#"{"ok": true}"#),
            Err(EnvelopeError::Malformed("response without id"))
        ));
        assert!(matches!(
            Envelope::decode(br#"{"id": 4}"#),
            Err(EnvelopeError::Malformed("request without method"))
        ));
        assert!(matches!(
            Envelope::decode(b"garbage"),
            Err(EnvelopeError::Json(_))
        ));
    }

    #[test]
    fn test_rejection_helpers() {
        assert!(Rejection::timeout().is_timeout());
        assert!(Rejection::connection_closed().is_connection_closed());
        assert!(!Rejection::timeout().is_connection_closed());
        assert_eq!(Rejection::method_not_found("foo").code, 404);
        assert_eq!(
            Rejection::new(404, "Not found").to_string(),
            "rejected [404] Not found"
        );
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Envelope::decode(&bytes);
        }

        #[test]
        fn notification_flag_wins(method in "[a-z]{1,12}", id in any::<u64>()) {
            let raw = format!(r#"{{"notification": true, "id": {}, "method": "{}"}}"#, id, method);
            let decoded = Envelope::decode(raw.as_bytes()).unwrap();
            prop_assert_eq!(decoded.kind(), "notification");
        }
    }
}
