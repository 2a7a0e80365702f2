//! Wire protocol types for the interpreter bridge.
//!
//! Requests and responses are serialized as JSON and sent over Content-Length
//! frames (see `connection.rs`).

use serde::{Deserialize, Serialize};

/// Request id meaning "whatever is currently evaluating" in a cancel.
pub const CANCEL_CURRENT: u64 = 0;

/// Requests the kernel sends to the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Evaluate an expression. The response carries the same id.
    Eval { id: u64, expr: String },

    /// Ask the interpreter to abandon evaluation `id` (0 = current).
    Cancel { id: u64 },
}

impl Request {
    pub fn id(&self) -> u64 {
        match self {
            Request::Eval { id, .. } | Request::Cancel { id } => *id,
        }
    }
}

/// How a response payload should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Plain printed output.
    Text,
    /// Path to a rendered image artifact on disk.
    Plot,
    /// Content sent to the interpreter's viewer.
    Viewer,
    /// URL or content sent to the interpreter's browser hook.
    Browser,
    /// Language-level error message.
    Error,
}

impl std::fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseKind::Text => write!(f, "text"),
            ResponseKind::Plot => write!(f, "plot"),
            ResponseKind::Viewer => write!(f, "viewer"),
            ResponseKind::Browser => write!(f, "browser"),
            ResponseKind::Error => write!(f, "error"),
        }
    }
}

/// A reply from the interpreter, correlated to a request by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(default)]
    pub result: String,
}

impl Response {
    pub fn new(id: u64, kind: ResponseKind, result: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            result: result.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_request_wire_format() {
        let req = Request::Eval {
            id: 1,
            expr: "1+1".to_string(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"type": "eval", "id": 1, "expr": "1+1"}));
    }

    #[test]
    fn test_cancel_request_wire_format() {
        let json = serde_json::to_string(&Request::Cancel { id: CANCEL_CURRENT }).unwrap();
        assert_eq!(json, r#"{"type":"cancel","id":0}"#);
    }

    #[test]
    fn test_request_id() {
        assert_eq!(Request::Cancel { id: 7 }.id(), 7);
        assert_eq!(
            Request::Eval {
                id: 3,
                expr: String::new()
            }
            .id(),
            3
        );
    }

    #[test]
    fn test_response_parse_all_kinds() {
        for (name, kind) in [
            ("text", ResponseKind::Text),
            ("plot", ResponseKind::Plot),
            ("viewer", ResponseKind::Viewer),
            ("browser", ResponseKind::Browser),
            ("error", ResponseKind::Error),
        ] {
            let json = format!(r#"{{"id":4,"type":"{}","result":"x"}}"#, name);
            let resp: Response = serde_json::from_str(&json).unwrap();
            assert_eq!(resp.kind, kind);
            assert_eq!(resp.kind.to_string(), name);
            assert_eq!(resp.id, 4);
        }
    }

    #[test]
    fn test_response_missing_result_defaults_empty() {
        let resp: Response = serde_json::from_str(r#"{"id":1,"type":"text"}"#).unwrap();
        assert_eq!(resp.result, "");
    }

    #[test]
    fn test_response_unknown_kind_is_rejected() {
        let result = serde_json::from_str::<Response>(r#"{"id":1,"type":"html","result":""}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_response() {
        let resp = Response::new(2, ResponseKind::Error, "boom");
        assert!(resp.is_error());
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"id":2,"type":"error","result":"boom"}"#);
    }
}
