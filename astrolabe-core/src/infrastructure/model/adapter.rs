//! Conversions between our message types and the chat API wire format

use super::types::NativeToolCall;
use crate::domain::types::{ChatMessage, ToolDescriptor};
use serde_json::{Value, json};

pub struct MessageAdapter;

impl MessageAdapter {
    /// `[{"role": "...", "content": "..."}]`, with `tool_call_id` when present.
    pub fn to_chat_format(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let mut value = json!({
                    "role": msg.role.as_str(),
                    "content": msg.content.clone()
                });
                if let Some(id) = &msg.tool_call_id {
                    value["tool_call_id"] = Value::String(id.clone());
                }
                value
            })
            .collect()
    }

    /// Function-style tool declarations understood by Ollama and OpenAI-compatible servers.
    pub fn to_tool_format(tools: &[ToolDescriptor]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect()
    }

    /// Reads `tool_calls: [{id?, function: {name, arguments}}]`; entries without a name are dropped.
    pub fn parse_tool_calls(raw: &[Value]) -> Vec<NativeToolCall> {
        raw.iter()
            .filter_map(|call| {
                let function = call.get("function")?;
                let name = function.get("name")?.as_str()?.trim();
                if name.is_empty() {
                    return None;
                }
                Some(NativeToolCall {
                    id: call.get("id").and_then(Value::as_str).map(str::to_string),
                    name: name.to_string(),
                    arguments: function.get("arguments").cloned().unwrap_or(Value::Null),
                })
            })
            .collect()
    }
}
