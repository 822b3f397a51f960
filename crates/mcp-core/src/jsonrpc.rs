use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

// JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Request identifier, echoed back verbatim in the matching response.
///
/// Integers are kept as `serde_json::Number`, which stores `i64`/`u64` values
/// exactly, so an id of `u64::MAX` survives a round trip. Non-integral ids are
/// held as `f64` and lose precision above 2^53; the protocol never needs them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl RequestId {
    /// The id as an unsigned integer, if it is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RequestId::Number(n) => n.as_u64(),
            RequestId::String(_) => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id.into())
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id.into())
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
        }
    }
}

/// A response envelope. Exactly one of `result` and `error` is populated when
/// built through [`Response::success`] or [`Response::failure`].
///
/// `id` is `None` only for errors answering a message whose id could not be
/// read; it is serialized as `null` in that case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl Response {
    /// Create a success response with the given id and result.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response. Pass `None` when the request id is unknown.
    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// An inbound message after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFailureKind {
    /// The bytes are not a JSON document.
    InvalidJson,
    /// Valid JSON, but not a request, notification or response.
    InvalidEnvelope,
}

/// A buffer that could not be classified. The offending bytes are kept for
/// diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct ParseFailure {
    pub kind: ParseFailureKind,
    pub reason: String,
    pub raw: Vec<u8>,
}

impl ParseFailure {
    fn new(kind: ParseFailureKind, reason: impl Into<String>, raw: &[u8]) -> Self {
        Self {
            kind,
            reason: reason.into(),
            raw: raw.to_vec(),
        }
    }

    pub fn raw_lossy(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }

    /// The error a peer should be answered with.
    pub fn to_error(&self) -> JsonRpcError {
        match self.kind {
            ParseFailureKind::InvalidJson => JsonRpcError::parse_error("Parse error"),
            ParseFailureKind::InvalidEnvelope => {
                JsonRpcError::invalid_request(format!("Invalid Request: {}", self.reason))
            }
        }
    }
}

/// Generic envelope used for classification. Every field is optional so that
/// a single parse covers requests, notifications and responses.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// Distinguishes `"result": null` (present) from a missing field.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Classify a raw buffer as request, notification or response.
///
/// Presence of a non-null `id` is the only thing separating a request from a
/// notification. A buffer without a method is parsed as a response.
pub fn classify(bytes: &[u8]) -> Result<Message, ParseFailure> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ParseFailure::new(ParseFailureKind::InvalidJson, e.to_string(), bytes))?;

    if !value.is_object() {
        return Err(ParseFailure::new(
            ParseFailureKind::InvalidEnvelope,
            "expected JSON object",
            bytes,
        ));
    }

    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|e| ParseFailure::new(ParseFailureKind::InvalidEnvelope, e.to_string(), bytes))?;

    match envelope.method {
        Some(method) if !method.is_empty() => Ok(match envelope.id {
            Some(id) => Message::Request(Request {
                jsonrpc: JSONRPC_VERSION.into(),
                id,
                method,
                params: envelope.params,
            }),
            None => Message::Notification(Notification {
                jsonrpc: JSONRPC_VERSION.into(),
                method,
                params: envelope.params,
            }),
        }),
        _ => match (envelope.result, envelope.error) {
            (Some(result), None) => match envelope.id {
                Some(id) => Ok(Message::Response(Response::success(id, result))),
                None => Err(ParseFailure::new(
                    ParseFailureKind::InvalidEnvelope,
                    "success response without id",
                    bytes,
                )),
            },
            (None, Some(error)) => Ok(Message::Response(Response::failure(envelope.id, error))),
            (Some(_), Some(_)) => Err(ParseFailure::new(
                ParseFailureKind::InvalidEnvelope,
                "response carries both result and error",
                bytes,
            )),
            (None, None) => Err(ParseFailure::new(
                ParseFailureKind::InvalidEnvelope,
                "missing method field",
                bytes,
            )),
        },
    }
}

/// Serialize any envelope to its wire form (no trailing newline).
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Opaque request parameters. Handlers decode them into their own shape on
/// demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Option<Value>);

impl Params {
    pub fn new(value: Option<Value>) -> Self {
        Self(value)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.0, None | Some(Value::Null))
    }

    pub fn as_value(&self) -> Option<&Value> {
        self.0.as_ref()
    }

    pub fn into_value(self) -> Option<Value> {
        self.0
    }

    /// Decode into `T`. Missing or malformed params yield `InvalidParams`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, JsonRpcError> {
        let value = self
            .0
            .clone()
            .ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
        serde_json::from_value(value)
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {}", e)))
    }

    /// Like [`Params::parse`], but absent params decode to `T::default()`.
    pub fn parse_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, JsonRpcError> {
        if self.is_empty() {
            Ok(T::default())
        } else {
            self.parse()
        }
    }
}

impl From<Option<Value>> for Params {
    fn from(value: Option<Value>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bytes(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn classify_request_with_numeric_id() {
        let msg = classify(&bytes(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})))
            .expect("should parse");
        match msg {
            Message::Request(req) => {
                assert_eq!(req.id, RequestId::from(1u64));
                assert_eq!(req.method, "ping");
                assert!(req.params.is_none());
            }
            other => panic!("expected Request, got {:?}", other),
        }
    }

    #[test]
    fn classify_request_with_string_id() {
        let msg = classify(br#"{"jsonrpc":"2.0","id":"abc","method":"tools/list"}"#)
            .expect("should parse");
        match msg {
            Message::Request(req) => {
                assert_eq!(req.id, RequestId::from("abc"));
                assert_eq!(req.method, "tools/list");
            }
            other => panic!("expected Request, got {:?}", other),
        }
    }

    #[test]
    fn classify_notification_without_id() {
        let msg = classify(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .expect("should parse");
        match msg {
            Message::Notification(n) => assert_eq!(n.method, "notifications/initialized"),
            other => panic!("expected Notification, got {:?}", other),
        }
    }

    #[test]
    fn null_id_is_treated_as_notification() {
        let msg = classify(br#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap();
        assert!(matches!(msg, Message::Notification(_)));
    }

    #[test]
    fn request_keeps_params_verbatim() {
        let msg = classify(&bytes(json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"message": "hi"}}
        })))
        .unwrap();
        let Message::Request(req) = msg else {
            panic!("expected Request");
        };
        assert_eq!(req.params.unwrap()["arguments"]["message"], "hi");
    }

    #[test]
    fn classify_success_response() {
        let msg = classify(br#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#).unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected Response");
        };
        assert_eq!(resp.id, Some(RequestId::from(7u64)));
        assert_eq!(resp.into_result().unwrap(), json!({"ok": true}));
    }

    #[test]
    fn classify_null_result_is_still_a_response() {
        let msg = classify(br#"{"jsonrpc":"2.0","id":3,"result":null}"#).unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected Response");
        };
        assert_eq!(resp.result, Some(Value::Null));
    }

    #[test]
    fn classify_error_response_with_null_id() {
        let msg = classify(
            br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected Response");
        };
        assert!(resp.id.is_none());
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);
    }

    #[test]
    fn invalid_json_is_a_parse_failure_with_raw_bytes() {
        let err = classify(b"invalid json").unwrap_err();
        assert_eq!(err.kind, ParseFailureKind::InvalidJson);
        assert_eq!(err.raw_lossy(), "invalid json");
        assert_eq!(err.to_error().code, PARSE_ERROR);
    }

    #[test]
    fn missing_method_and_outcome_is_invalid_envelope() {
        let err = classify(br#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert_eq!(err.kind, ParseFailureKind::InvalidEnvelope);
        assert_eq!(err.to_error().code, INVALID_REQUEST);
    }

    #[test]
    fn non_object_is_invalid_envelope() {
        let err = classify(br#""just a string""#).unwrap_err();
        assert_eq!(err.kind, ParseFailureKind::InvalidEnvelope);
    }

    #[test]
    fn response_with_both_outcomes_is_rejected() {
        let err = classify(
            br#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}"#,
        )
        .unwrap_err();
        assert!(err.reason.contains("both"));
    }

    #[test]
    fn success_response_serializes_result_only() {
        let resp = Response::success(RequestId::from(1u64), json!({"status": "ok"}));
        let value: Value = serde_json::from_slice(&encode(&resp).unwrap()).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 1, "result": {"status": "ok"}}));
    }

    #[test]
    fn error_response_serializes_error_only() {
        let resp = Response::failure(
            Some(RequestId::from("req-5")),
            JsonRpcError::method_not_found("foo"),
        );
        let value: Value = serde_json::from_slice(&encode(&resp).unwrap()).unwrap();
        assert_eq!(value["id"], "req-5");
        assert!(value.get("result").is_none());
        assert_eq!(value["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(value["error"]["message"], "Method not found: foo");
        assert!(value["error"].get("data").is_none());
    }

    #[test]
    fn failure_without_id_serializes_null_id() {
        let resp = Response::failure(None, JsonRpcError::parse_error("Parse error"));
        let value: Value = serde_json::from_slice(&encode(&resp).unwrap()).unwrap();
        assert!(value.get("id").is_some());
        assert!(value["id"].is_null());
    }

    #[test]
    fn integer_ids_round_trip_without_widening() {
        for raw in ["42", "4294967296", "9007199254740993", "18446744073709551615", "-12"] {
            let request = format!(r#"{{"jsonrpc":"2.0","id":{},"method":"ping"}}"#, raw);
            let Message::Request(req) = classify(request.as_bytes()).unwrap() else {
                panic!("expected Request");
            };
            let encoded = encode(&Response::success(req.id.clone(), json!({}))).unwrap();
            let Message::Response(resp) = classify(&encoded).unwrap() else {
                panic!("expected Response");
            };
            assert_eq!(resp.id, Some(req.id));
            let text = String::from_utf8(encoded).unwrap();
            assert!(text.contains(&format!(r#""id":{}"#, raw)), "{}", text);
        }
    }

    #[test]
    fn string_id_that_looks_numeric_stays_a_string() {
        let Message::Request(req) = classify(br#"{"jsonrpc":"2.0","id":"1","method":"x"}"#).unwrap()
        else {
            panic!("expected Request");
        };
        assert_eq!(req.id, RequestId::from("1"));
        assert_eq!(req.id.as_u64(), None);
        let text = String::from_utf8(encode(&Response::success(req.id, json!(null))).unwrap())
            .unwrap();
        assert!(text.contains(r#""id":"1""#));
    }

    #[test]
    fn params_parse_reports_invalid_params() {
        #[derive(Deserialize)]
        struct Echo {
            #[allow(dead_code)]
            message: String,
        }

        let params = Params::new(Some(json!({"message": 3})));
        let err = params.parse::<Echo>().err().expect("should fail");
        assert_eq!(err.code, INVALID_PARAMS);

        let missing = Params::new(None);
        assert_eq!(missing.parse::<Echo>().err().unwrap().code, INVALID_PARAMS);
    }

    #[test]
    fn params_parse_or_default_accepts_absent_params() {
        #[derive(Deserialize, Default, Debug, PartialEq)]
        struct Opts {
            #[serde(default)]
            verbose: bool,
        }

        assert_eq!(Params::new(None).parse_or_default::<Opts>().unwrap(), Opts::default());
        assert!(Params::new(Some(json!({"verbose": true})))
            .parse_or_default::<Opts>()
            .unwrap()
            .verbose);
    }
}
