//! Wire types for the JSON-RPC subset spoken with tool servers.

use crate::domain::types::{ToolContent, ToolDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

pub const JSONRPC_VERSION: &str = "2.0";

/// Next newline-terminated line, `None` at EOF.
///
/// Invalid UTF-8 is replaced, so a stray binary log line is just another
/// unparsable line instead of a read error.
pub(crate) async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

pub mod error_codes {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: &'a str,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: &'a str, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcNotification<'a> {
    pub fn new(method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Reply to a request the server sent us.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcReply {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcReply {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(default = "default_error_code")]
    pub code: i64,
    #[serde(default = "default_error_message")]
    pub message: String,
}

fn default_error_code() -> i64 {
    error_codes::INTERNAL_ERROR
}

fn default_error_message() -> String {
    "unknown error".to_string()
}

/// A line read from the server, classified by which JSON-RPC fields it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response {
        id: String,
        outcome: Result<Value, JsonRpcError>,
    },
    Request {
        id: Value,
        method: String,
    },
    Notification {
        method: String,
    },
    Unrecognised,
}

impl InboundMessage {
    pub fn classify(mut value: Value) -> Self {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);
        let id = value.get_mut("id").map(Value::take).filter(|id| !id.is_null());

        match (id, method) {
            (Some(id), Some(method)) => InboundMessage::Request { id, method },
            (None, Some(method)) => InboundMessage::Notification { method },
            (Some(id), None) => {
                let Some(id) = response_key(&id) else {
                    return InboundMessage::Unrecognised;
                };
                let outcome = match value.get_mut("error").map(Value::take) {
                    Some(error) if !error.is_null() => Err(serde_json::from_value(error)
                        .unwrap_or(JsonRpcError {
                            code: error_codes::INTERNAL_ERROR,
                            message: "malformed error payload".to_string(),
                        })),
                    _ => Ok(value
                        .get_mut("result")
                        .map(Value::take)
                        .unwrap_or(Value::Null)),
                };
                InboundMessage::Response { id, outcome }
            }
            (None, None) => InboundMessage::Unrecognised,
        }
    }
}

fn response_key(id: &Value) -> Option<String> {
    match id {
        Value::String(value) => Some(value.clone()),
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub server_info: Option<Value>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl ToolsListResult {
    /// Descriptors in advertised order; entries without a name are dropped.
    pub fn into_descriptors(self, server: &str) -> Vec<ToolDescriptor> {
        self.tools
            .into_iter()
            .filter_map(|tool| match serde_json::from_value::<ToolDescriptor>(tool) {
                Ok(descriptor) if !descriptor.name.trim().is_empty() => Some(descriptor),
                Ok(_) => None,
                Err(err) => {
                    debug!(server, %err, "Ignoring malformed tool descriptor");
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn into_contents(self) -> Vec<ToolContent> {
        self.content.into_iter().map(ToolContent::from_value).collect()
    }
}
