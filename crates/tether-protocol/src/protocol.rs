use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Request identifier, chosen by the sender of a call and echoed back by the
/// responder. The wire form is either a JSON number or a JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// Error object carried in a call response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Raised when a line cannot be decoded into a [`Message`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame parsed as JSON but fits no message shape, e.g. it has
    /// neither a `method` nor a `result`/`error` member.
    #[error("frame is not a request, response, or notification: {0}")]
    UnknownShape(String),
}

/// One decoded wire frame.
///
/// Classification follows the id/method rule: a `method` with an `id` is a
/// call request, a `method` without an `id` is a notification, and an `id`
/// with a `result` or `error` member is a call response.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: RequestId,
        result: Result<Value, RpcError>,
    },
}

/// Serde-facing frame with every member optional; [`Message`] classification
/// happens after parse so unknown shapes are rejected in one place.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<RequestId>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct WireFrame<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Value::is_null")]
    params: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RpcError>,
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Message::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response_ok(id: RequestId, result: Value) -> Self {
        Message::Response {
            id,
            result: Ok(result),
        }
    }

    pub fn response_err(id: RequestId, error: RpcError) -> Self {
        Message::Response {
            id,
            result: Err(error),
        }
    }

    /// Decode one line of the wire protocol.
    pub fn from_line(line: &str) -> Result<Self, DecodeError> {
        let raw: RawFrame = serde_json::from_str(line)?;
        match (raw.method, raw.id, raw.result, raw.error) {
            (Some(method), Some(id), _, _) => Ok(Message::Request {
                id,
                method,
                params: raw.params,
            }),
            (Some(method), None, _, _) => Ok(Message::Notification {
                method,
                params: raw.params,
            }),
            (None, Some(id), _, Some(error)) => Ok(Message::Response {
                id,
                result: Err(error),
            }),
            (None, Some(id), result, None) => Ok(Message::Response {
                id,
                result: Ok(result.unwrap_or(Value::Null)),
            }),
            (None, None, _, _) => Err(DecodeError::UnknownShape(line.trim().to_string())),
        }
    }

    /// Encode as a single newline-terminated JSON line.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        static NULL: Value = Value::Null;
        let frame = match self {
            Message::Request { id, method, params } => WireFrame {
                jsonrpc: "2.0",
                id: Some(id),
                method: Some(method),
                params,
                result: None,
                error: None,
            },
            Message::Notification { method, params } => WireFrame {
                jsonrpc: "2.0",
                id: None,
                method: Some(method),
                params,
                result: None,
                error: None,
            },
            Message::Response { id, result } => match result {
                Ok(value) => WireFrame {
                    jsonrpc: "2.0",
                    id: Some(id),
                    method: None,
                    params: &NULL,
                    result: Some(value),
                    error: None,
                },
                Err(error) => WireFrame {
                    jsonrpc: "2.0",
                    id: Some(id),
                    method: None,
                    params: &NULL,
                    result: None,
                    error: Some(error),
                },
            },
        };
        let mut json = serde_json::to_string(&frame)?;
        json.push('\n');
        Ok(json)
    }
}
