//! Frames exchanged over a multiplexed plugin connection.
//!
//! Frames are JSON-RPC 2.0 shaped, one per line, with an extra `service` field naming the
//! broker id of the service a request is addressed to. Id `0` is the control channel.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Broker id of the control channel present on every session.
pub const CONTROL_SERVICE: u32 = 0;

pub mod codes {
    pub const INVALID_PARAMS: i64 = -32602;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVICE_NOT_FOUND: i64 = -32004;
    pub const NOT_FOUND: i64 = -32010;
    pub const UNAVAILABLE: i64 = -32011;
    pub const UNKNOWN_CAPABILITY: i64 = -32012;
    pub const CANCELLED: i64 = -32800;
}

pub mod control {
    pub const PING: &str = "ping";
    pub const DIAL: &str = "dial";
    pub const DISPENSE: &str = "dispense";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub service: u32,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DialParams {
    pub id: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DispenseParams {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DispenseResult {
    pub id: u32,
}

impl Frame {
    pub fn request(id: u64, service: u32, method: impl Into<String>, params: Value) -> Self {
        Frame::Request(Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            service,
            method: method.into(),
            params,
        })
    }

    pub fn response(id: u64, result: std::result::Result<Value, WireError>) -> Self {
        let (result, error) = match result {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err)),
        };
        Frame::Response(Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
            error,
        })
    }

    /// Serialize as a single newline-terminated line.
    pub fn encode(&self) -> serde_json::Result<Bytes> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }

    pub fn decode(line: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(line.trim_ascii())
    }
}

impl WireError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: codes::METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_line_shape() {
        let frame = Frame::request(7, 3, "get", json!({"key": "a"}));
        let line = frame.encode().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));

        let text = std::str::from_utf8(&line).unwrap();
        assert!(text.contains("\"jsonrpc\":\"2.0\""));
        assert!(text.contains("\"service\":3"));
        assert_eq!(Frame::decode(&line).unwrap(), frame);
    }

    #[test]
    fn test_error_response_parsing() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": 9,
            "error": {"code": -32601, "message": "method not found: nope"}
        });
        let frame: Frame = serde_json::from_value(raw).unwrap();
        match frame {
            Frame::Response(resp) => {
                assert_eq!(resp.id, 9);
                assert!(resp.result.is_none());
                assert_eq!(resp.error.unwrap().code, codes::METHOD_NOT_FOUND);
            }
            _ => panic!("Expected response"),
        }
    }

    #[test]
    fn test_request_without_params_defaults_to_null() {
        let frame = Frame::decode(br#"{"jsonrpc":"2.0","id":1,"service":0,"method":"ping"}"#).unwrap();
        match frame {
            Frame::Request(req) => {
                assert_eq!(req.method, control::PING);
                assert!(req.params.is_null());
            }
            _ => panic!("Expected request"),
        }
    }
}
