//! Wire shapes carried on the provider channel.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RpcError;

/// Name of the multiplexed sub-channel carrying provider traffic.
pub const PROVIDER_CHANNEL: &str = "rabby-provider";

/// JSON-RPC request id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::String(id) => write!(f, "{id:?}"),
            Self::Null => f.write_str("null"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: Id,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Classification of an inbound provider-channel payload.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcCall {
    Request(RpcRequest),
    /// A method without an id; nothing is sent back.
    Notification { method: String },
    Invalid { id: Id },
}

impl RpcCall {
    pub fn from_value(value: Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::Invalid { id: Id::Null };
        };

        let id = object.get("id").cloned();
        let method = object
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);

        match (method, id) {
            (Some(method), None) => Self::Notification { method },
            (Some(method), Some(id)) => match serde_json::from_value::<Id>(id) {
                Ok(id) => Self::Request(RpcRequest {
                    id,
                    method,
                    params: object.get("params").cloned().unwrap_or(Value::Null),
                }),
                Err(_) => Self::Invalid { id: Id::Null },
            },
            (None, id) => Self::Invalid {
                id: id
                    .and_then(|id| serde_json::from_value(id).ok())
                    .unwrap_or(Id::Null),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponseResult {
    #[serde(rename = "result")]
    Success(Value),
    #[serde(rename = "error")]
    Error(RpcError),
}

impl From<Result<Value, RpcError>> for ResponseResult {
    fn from(result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => Self::Error(error),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Id,
    #[serde(flatten)]
    pub result: ResponseResult,
}

impl RpcResponse {
    pub fn new(id: Id, result: impl Into<ResponseResult>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: result.into(),
        }
    }

    pub fn invalid_request(id: Id) -> Self {
        Self::new(id, ResponseResult::Error(RpcError::invalid_request()))
    }

    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "jsonrpc": self.jsonrpc,
            "id": self.id,
        });
        match &self.result {
            ResponseResult::Success(result) => value["result"] = result.clone(),
            ResponseResult::Error(error) => value["error"] = error.to_value(),
        }
        value
    }
}

/// One multiplexed frame: `{ name, data }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    pub data: Value,
}

/// Builds the `{ method, params }` body of an outbound provider notification.
pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "method": method,
        "params": params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_requests_and_notifications() {
        let call = RpcCall::from_value(json!({ "id": 7, "method": "eth_accounts" }));
        assert_eq!(
            call,
            RpcCall::Request(RpcRequest {
                id: Id::Number(7),
                method: "eth_accounts".to_string(),
                params: Value::Null,
            })
        );

        let call = RpcCall::from_value(json!({ "method": "eth_subscription" }));
        assert_eq!(
            call,
            RpcCall::Notification {
                method: "eth_subscription".to_string()
            }
        );
    }

    #[test]
    fn missing_method_is_invalid_but_keeps_id() {
        let call = RpcCall::from_value(json!({ "id": "a1" }));
        assert_eq!(
            call,
            RpcCall::Invalid {
                id: Id::String("a1".to_string())
            }
        );
        assert_eq!(
            RpcCall::from_value(json!([1, 2])),
            RpcCall::Invalid { id: Id::Null }
        );
    }

    #[test]
    fn response_serializes_flat() {
        let response = RpcResponse::new(Id::Number(1), Ok::<_, RpcError>(json!(["0xabc"])));
        let value = serde_json::to_value(&response).expect("serialize response");
        assert_eq!(value, response.to_value());
        assert_eq!(value["result"][0], "0xabc");
        assert!(value.get("error").is_none());

        let response = RpcResponse::invalid_request(Id::Null);
        assert_eq!(response.to_value()["error"]["code"], -32600);
    }
}
