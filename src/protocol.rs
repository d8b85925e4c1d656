//! Socket table wire protocol.
//!
//! Every frame is one compact JSON document followed by a single `\n`:
//!
//! ```text
//! Request:  {"request":"UPDATE","key":"test1","value":0}\n
//! Response: {"key":"test1","value":0}\n
//!
//! Request:  {"request":"GETALL"}\n
//! Response: [{"key":"test1","value":0},{"key":"test2","value":50}]\n
//! ```
//!
//! - GET, UPDATE and DELETE must carry a `key` field (JSON `null` is allowed)
//! - UPDATE must also carry a `value` field (any JSON value, `null` included)
//! - GETALL carries neither
//!
//! A request that cannot be decoded is answered with `null`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::{self, FromStr};
use thiserror::Error;

/// Field holding the request kind.
pub const REQUEST_FIELD: &str = "request";
/// Field holding the key.
pub const KEY_FIELD: &str = "key";
/// Field holding the value.
pub const VALUE_FIELD: &str = "value";

/// Frame terminator.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A payload could not be serialized.
    #[error("failed to encode message: {0}")]
    Encoding(#[source] serde_json::Error),

    /// Invalid syntax or a required field is missing for the stated kind.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The `request` field names a kind this server does not know.
    /// `key` is the request's key when it carried a string one.
    #[error("unknown request kind: {kind:?}")]
    UnknownKind { kind: String, key: Option<String> },
}

/// Request kinds understood by the server.
///
/// `Unknown` is only reported to callbacks, for a keyed request whose kind
/// was not recognised. It is never parsed from or written to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Get,
    GetAll,
    Update,
    Delete,
    Unknown,
}

impl RequestKind {
    /// Name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Get => "GET",
            RequestKind::GetAll => "GETALL",
            RequestKind::Update => "UPDATE",
            RequestKind::Delete => "DELETE",
            RequestKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(RequestKind::Get),
            "GETALL" => Ok(RequestKind::GetAll),
            "UPDATE" => Ok(RequestKind::Update),
            "DELETE" => Ok(RequestKind::Delete),
            other => Err(ProtocolError::UnknownKind {
                kind: other.to_string(),
                key: None,
            }),
        }
    }
}

/// A decoded client request.
///
/// A `key` of `None` means the client sent an explicit JSON `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Get { key: Option<String> },
    GetAll,
    Update { key: Option<String>, value: Value },
    Delete { key: Option<String> },
}

impl Request {
    pub fn get(key: impl Into<String>) -> Self {
        Request::Get {
            key: Some(key.into()),
        }
    }

    pub fn update(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Request::Update {
            key: Some(key.into()),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Request::Delete {
            key: Some(key.into()),
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Get { .. } => RequestKind::Get,
            Request::GetAll => RequestKind::GetAll,
            Request::Update { .. } => RequestKind::Update,
            Request::Delete { .. } => RequestKind::Delete,
        }
    }

    /// The key carried by the request, if it carries a non-null one.
    pub fn key(&self) -> Option<&str> {
        match self {
            Request::Get { key } | Request::Update { key, .. } | Request::Delete { key } => {
                key.as_deref()
            }
            Request::GetAll => None,
        }
    }
}

/// One `{key, value}` pair as it appears in responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Option<String>,
    #[serde(default)]
    pub value: Value,
}

impl Entry {
    pub fn new(key: Option<String>, value: Value) -> Self {
        Self { key, value }
    }
}

/// A server response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// Answer to GET, UPDATE and DELETE.
    Entry(Entry),
    /// Answer to GETALL: every stored key with its current value.
    All(Vec<Entry>),
    /// Answer to an empty, malformed or unknown request.
    Null,
}

impl Response {
    /// The `value` of a single-entry response.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Response::Entry(entry) => Some(&entry.value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Response::Null)
    }
}

/// Encode a request as a newline-terminated frame.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, ProtocolError> {
    let mut fields = Map::new();
    fields.insert(
        REQUEST_FIELD.to_string(),
        Value::String(request.kind().as_str().to_string()),
    );

    match request {
        Request::Get { key } | Request::Delete { key } => {
            fields.insert(KEY_FIELD.to_string(), key_to_value(key));
        }
        Request::Update { key, value } => {
            fields.insert(KEY_FIELD.to_string(), key_to_value(key));
            fields.insert(VALUE_FIELD.to_string(), value.clone());
        }
        Request::GetAll => {}
    }

    frame(&Value::Object(fields))
}

/// Decode one request frame. A trailing `\n` (or `\r\n`) is optional.
pub fn decode_request(frame: &[u8]) -> Result<Request, ProtocolError> {
    let mut fields = match parse_json(frame)? {
        Value::Object(fields) => fields,
        other => {
            return Err(ProtocolError::Malformed(format!(
                "expected a JSON object, got {}",
                json_type(&other)
            )))
        }
    };

    let kind: RequestKind = match fields.remove(REQUEST_FIELD) {
        Some(Value::String(kind)) => match kind.parse() {
            Ok(kind) => kind,
            Err(_) => {
                let key = fields
                    .get(KEY_FIELD)
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                return Err(ProtocolError::UnknownKind { kind, key });
            }
        },
        Some(other) => {
            return Err(ProtocolError::Malformed(format!(
                "`{REQUEST_FIELD}` must be a string, got {}",
                json_type(&other)
            )))
        }
        None => {
            return Err(ProtocolError::Malformed(format!(
                "missing `{REQUEST_FIELD}` field"
            )))
        }
    };

    match kind {
        RequestKind::GetAll => Ok(Request::GetAll),
        RequestKind::Get => Ok(Request::Get {
            key: take_key(&mut fields, kind)?,
        }),
        RequestKind::Delete => Ok(Request::Delete {
            key: take_key(&mut fields, kind)?,
        }),
        RequestKind::Update => {
            let key = take_key(&mut fields, kind)?;
            let value = fields.remove(VALUE_FIELD).ok_or_else(|| {
                ProtocolError::Malformed(format!("{kind} requires a `{VALUE_FIELD}` field"))
            })?;
            Ok(Request::Update { key, value })
        }
        RequestKind::Unknown => Err(ProtocolError::UnknownKind {
            kind: kind.to_string(),
            key: None,
        }),
    }
}

/// Encode a response as a newline-terminated frame.
pub fn encode_response(response: &Response) -> Result<Vec<u8>, ProtocolError> {
    frame(response)
}

/// The encoded `null` response.
pub fn null_response() -> Vec<u8> {
    b"null\n".to_vec()
}

/// Decode one response frame.
pub fn decode_response(frame: &[u8]) -> Result<Response, ProtocolError> {
    match parse_json(frame)? {
        Value::Null => Ok(Response::Null),
        Value::Array(items) => items
            .into_iter()
            .map(entry_from_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Response::All),
        value @ Value::Object(_) => entry_from_value(value).map(Response::Entry),
        other => Err(ProtocolError::Malformed(format!(
            "unexpected response {}",
            json_type(&other)
        ))),
    }
}

/// Strip the frame terminator (and a preceding carriage return, if any).
pub fn strip_delimiter(frame: &[u8]) -> &[u8] {
    let frame = frame.strip_suffix(&[FRAME_DELIMITER]).unwrap_or(frame);
    frame.strip_suffix(b"\r").unwrap_or(frame)
}

fn frame<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut encoded = serde_json::to_vec(message).map_err(ProtocolError::Encoding)?;
    encoded.push(FRAME_DELIMITER);
    Ok(encoded)
}

fn parse_json(frame: &[u8]) -> Result<Value, ProtocolError> {
    let text = str::from_utf8(strip_delimiter(frame))
        .map_err(|e| ProtocolError::Malformed(format!("invalid UTF-8: {e}")))?;
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn take_key(fields: &mut Map<String, Value>, kind: RequestKind) -> Result<Option<String>, ProtocolError> {
    match fields.remove(KEY_FIELD) {
        Some(Value::String(key)) => Ok(Some(key)),
        Some(Value::Null) => Ok(None),
        Some(other) => Err(ProtocolError::Malformed(format!(
            "`{KEY_FIELD}` must be a string or null, got {}",
            json_type(&other)
        ))),
        None => Err(ProtocolError::Malformed(format!(
            "{kind} requires a `{KEY_FIELD}` field"
        ))),
    }
}

fn key_to_value(key: &Option<String>) -> Value {
    key.clone().map(Value::String).unwrap_or(Value::Null)
}

fn entry_from_value(value: Value) -> Result<Entry, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_appends_single_newline() {
        let encoded = encode_request(&Request::get("test1")).unwrap();
        assert_eq!(encoded.last(), Some(&b'\n'));
        assert_eq!(encoded.iter().filter(|&&b| b == b'\n').count(), 1);

        let parsed: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(parsed, json!({"request": "GET", "key": "test1"}));
    }

    #[test]
    fn test_request_roundtrip_each_kind() {
        let requests = [
            Request::get("a"),
            Request::GetAll,
            Request::update("b", json!({"nested": [1, 2.5, true, null, "x"]})),
            Request::Update {
                key: None,
                value: Value::Null,
            },
            Request::delete("c"),
            Request::Get { key: None },
        ];

        for request in requests {
            let decoded = decode_request(&encode_request(&request).unwrap()).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_decode_without_newline() {
        let request = decode_request(br#"{"request": "DELETE", "key": "k"}"#).unwrap();
        assert_eq!(request, Request::delete("k"));
    }

    #[test]
    fn test_decode_tolerates_crlf_and_extra_fields() {
        let request =
            decode_request(b"{\"request\":\"GETALL\",\"timestamp\":\"2019-04-01\"}\r\n").unwrap();
        assert_eq!(request, Request::GetAll);
    }

    #[test]
    fn test_update_requires_value_field() {
        match decode_request(br#"{"request":"UPDATE","key":"k"}"#) {
            Err(ProtocolError::Malformed(msg)) => assert!(msg.contains("value")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_keyed_requests_require_key_field() {
        for kind in ["GET", "UPDATE", "DELETE"] {
            let frame = format!(r#"{{"request":"{kind}","value":1}}"#);
            assert!(matches!(
                decode_request(frame.as_bytes()),
                Err(ProtocolError::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_non_string_key_is_malformed() {
        assert!(matches!(
            decode_request(br#"{"request":"GET","key":7}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_kind() {
        match decode_request(br#"{"request":"PATCH","key":"k"}"#) {
            Err(ProtocolError::UnknownKind { kind, key }) => {
                assert_eq!(kind, "PATCH");
                assert_eq!(key.as_deref(), Some("k"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        // Kinds are case-sensitive on the wire.
        assert!(matches!(
            decode_request(br#"{"request":"get","key":"k"}"#),
            Err(ProtocolError::UnknownKind { .. })
        ));
        assert!(matches!(
            decode_request(br#"{"request":"UNKNOWN"}"#),
            Err(ProtocolError::UnknownKind { key: None, .. })
        ));
        assert!(matches!(
            decode_request(br#"{"request":"PATCH","key":3}"#),
            Err(ProtocolError::UnknownKind { key: None, .. })
        ));
    }

    #[test]
    fn test_invalid_syntax() {
        let frames: [&[u8]; 4] = [b"{not json", b"[1,2]\n", b"\xff\xfe", b"\"GET\""];
        for frame in frames {
            assert!(matches!(
                decode_request(frame),
                Err(ProtocolError::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_response_encoding() {
        let entry = Response::Entry(Entry::new(Some("k".into()), json!(5)));
        assert_eq!(encode_response(&entry).unwrap(), b"{\"key\":\"k\",\"value\":5}\n");

        let missing = Response::Entry(Entry::new(None, Value::Null));
        assert_eq!(
            encode_response(&missing).unwrap(),
            b"{\"key\":null,\"value\":null}\n"
        );

        assert_eq!(encode_response(&Response::Null).unwrap(), null_response());
        assert_eq!(encode_response(&Response::All(vec![])).unwrap(), b"[]\n");
    }

    #[test]
    fn test_response_decoding() {
        assert_eq!(decode_response(b"null\n").unwrap(), Response::Null);

        let all = decode_response(br#"[{"key":"a","value":1},{"key":"b","value":"two"}]"#)
            .unwrap();
        assert_eq!(
            all,
            Response::All(vec![
                Entry::new(Some("a".into()), json!(1)),
                Entry::new(Some("b".into()), json!("two")),
            ])
        );

        let entry = decode_response(br#"{"key":"a","value":[1,{"b":false}]}"#).unwrap();
        assert_eq!(entry.value(), Some(&json!([1, {"b": false}])));

        assert!(decode_response(b"42").is_err());
    }

    #[test]
    fn test_strip_delimiter() {
        assert_eq!(strip_delimiter(b"abc\n"), b"abc");
        assert_eq!(strip_delimiter(b"abc\r\n"), b"abc");
        assert_eq!(strip_delimiter(b"abc"), b"abc");
        assert_eq!(strip_delimiter(b"\n"), b"");
    }
}
