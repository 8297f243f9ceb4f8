//! JSON-RPC frame helpers.
//!
//! The relay treats payloads as opaque JSON. The only fields it reads are the
//! correlation key (`requestId`, else `id`) and `method`. Everything it
//! writes back to clients is built here so the wire shapes live in one place.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::error::{RelayError, RelayResult};

/// Error codes carried in `{"error": <code>}` frames sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    NodeIsRestarting,
    InvalidMessage,
    LightNodeNotConnected,
    RequestTimeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::NodeIsRestarting => "node_is_restarting",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::LightNodeNotConnected => "light_node_not_connected",
            ErrorCode::RequestTimeout => "request_timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a structured error frame: `{"error": "<code>"}`.
pub fn error_frame(code: ErrorCode) -> String {
    json!({ "error": code.as_str() }).to_string()
}

/// Build an error frame tied to a specific request:
/// `{"requestId": <key>, "error": "<code>"}`.
pub fn request_error_frame(key: &CorrelationKey, code: ErrorCode) -> String {
    json!({ "requestId": key.to_value(), "error": code.as_str() }).to_string()
}

/// A correlation key in canonical JSON text form.
///
/// `1` and `"1"` are distinct keys, matching how JSON-RPC peers echo ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Build a key from a JSON value. `null` is not a key.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        Some(Self(value.to_string()))
    }

    /// The key as it appeared on the wire.
    pub fn to_value(&self) -> Value {
        serde_json::from_str(&self.0).unwrap_or_else(|_| Value::String(self.0.clone()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed JSON frame from either side of the relay.
#[derive(Debug, Clone)]
pub struct RpcFrame {
    value: Value,
}

impl RpcFrame {
    /// Parse a raw text frame.
    pub fn parse(raw: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| RelayError::InvalidMessage(format!("not JSON: {e}")))?;
        Ok(Self { value })
    }

    /// The correlation key: `requestId` if present, otherwise `id`.
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        let obj = self.value.as_object()?;
        obj.get("requestId")
            .and_then(CorrelationKey::from_value)
            .or_else(|| obj.get("id").and_then(CorrelationKey::from_value))
    }

    /// The JSON-RPC method name, if any.
    pub fn method(&self) -> Option<&str> {
        self.value.get("method").and_then(Value::as_str)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// Build the frame delivered to the owner of a correlated upstream response:
/// `{"requestId": <key>, "result": ..., "error": ...}`.
///
/// Members missing from the upstream frame are omitted rather than sent as null.
pub fn correlated_response(key: &CorrelationKey, upstream: &RpcFrame) -> String {
    let mut out = Map::new();
    out.insert("requestId".into(), key.to_value());
    if let Some(result) = upstream.value().get("result") {
        out.insert("result".into(), result.clone());
    }
    if let Some(error) = upstream.value().get("error") {
        out.insert("error".into(), error.clone());
    }
    Value::Object(out).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_frame_shape() {
        let v: Value = serde_json::from_str(&error_frame(ErrorCode::NodeIsRestarting)).unwrap();
        assert_eq!(v, json!({ "error": "node_is_restarting" }));
        let v: Value =
            serde_json::from_str(&error_frame(ErrorCode::LightNodeNotConnected)).unwrap();
        assert_eq!(v, json!({ "error": "light_node_not_connected" }));
    }

    #[test]
    fn error_code_serde_matches_as_str() {
        for code in [
            ErrorCode::Unauthorized,
            ErrorCode::NodeIsRestarting,
            ErrorCode::InvalidMessage,
            ErrorCode::LightNodeNotConnected,
            ErrorCode::RequestTimeout,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn request_id_wins_over_id() {
        let frame = RpcFrame::parse(r#"{"requestId":"abc","id":7}"#).unwrap();
        assert_eq!(frame.correlation_key().unwrap().to_value(), json!("abc"));

        let frame = RpcFrame::parse(r#"{"id":7,"method":"header.Subscribe"}"#).unwrap();
        assert_eq!(frame.correlation_key().unwrap().to_value(), json!(7));
        assert_eq!(frame.method(), Some("header.Subscribe"));
    }

    #[test]
    fn numeric_and_string_ids_are_distinct() {
        let a = RpcFrame::parse(r#"{"id":1}"#).unwrap().correlation_key();
        let b = RpcFrame::parse(r#"{"id":"1"}"#).unwrap().correlation_key();
        assert!(a.is_some() && b.is_some());
        assert_ne!(a, b);
    }

    #[test]
    fn null_or_missing_id_is_not_a_key() {
        assert!(RpcFrame::parse(r#"{"id":null,"method":"x"}"#)
            .unwrap()
            .correlation_key()
            .is_none());
        assert!(RpcFrame::parse(r#"{"method":"x"}"#)
            .unwrap()
            .correlation_key()
            .is_none());
        assert!(RpcFrame::parse("[1,2]").unwrap().correlation_key().is_none());
    }

    #[test]
    fn malformed_json_is_invalid_message() {
        let err = RpcFrame::parse("{not json").unwrap_err();
        assert!(matches!(err, RelayError::InvalidMessage(_)));
    }

    #[test]
    fn correlated_response_omits_absent_error() {
        let upstream = RpcFrame::parse(r#"{"jsonrpc":"2.0","id":1,"result":"ok"}"#).unwrap();
        let key = upstream.correlation_key().unwrap();
        let v: Value = serde_json::from_str(&correlated_response(&key, &upstream)).unwrap();
        assert_eq!(v, json!({ "requestId": 1, "result": "ok" }));
    }

    #[test]
    fn correlated_response_carries_upstream_error() {
        let upstream =
            RpcFrame::parse(r#"{"id":"q","error":{"code":-32601,"message":"nope"}}"#).unwrap();
        let key = upstream.correlation_key().unwrap();
        let v: Value = serde_json::from_str(&correlated_response(&key, &upstream)).unwrap();
        assert_eq!(v["requestId"], json!("q"));
        assert_eq!(v["error"]["code"], json!(-32601));
        assert!(v.get("result").is_none());
    }

    #[test]
    fn request_error_frame_echoes_key() {
        let key = CorrelationKey::from_value(&json!(42)).unwrap();
        let v: Value =
            serde_json::from_str(&request_error_frame(&key, ErrorCode::RequestTimeout)).unwrap();
        assert_eq!(v, json!({ "requestId": 42, "error": "request_timeout" }));
    }
}
