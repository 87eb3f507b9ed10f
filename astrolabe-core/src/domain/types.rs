use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(MessageRole::System),
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }
}

/// A tool as advertised by a server's `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: empty_schema(),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// One content item of a `tools/call` result.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    Text { text: String },
    Resource { resource: Value },
    Other(Value),
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        ToolContent::Text { text: text.into() }
    }

    pub fn from_value(value: Value) -> Self {
        match value.get("type").and_then(Value::as_str) {
            Some("text") => match value.get("text").and_then(Value::as_str) {
                Some(text) => ToolContent::text(text),
                None => ToolContent::Other(value),
            },
            Some("resource") => match value.get("resource") {
                Some(resource) => ToolContent::Resource {
                    resource: resource.clone(),
                },
                None => ToolContent::Other(value),
            },
            _ => ToolContent::Other(value),
        }
    }

    /// Text rendering used when feeding results back to the model.
    pub fn render(&self) -> String {
        match self {
            ToolContent::Text { text } => text.clone(),
            ToolContent::Resource { resource } => {
                if let Some(text) = resource.get("text").and_then(Value::as_str) {
                    return text.to_string();
                }
                match resource.get("uri").and_then(Value::as_str) {
                    Some(uri) => format!("[resource {uri}]"),
                    None => resource.to_string(),
                }
            }
            ToolContent::Other(value) => value.to_string(),
        }
    }
}

/// A tool invocation parsed from model output, not yet routed to a server.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCallRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// Why a tool call did not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The owning server does not advertise the tool.
    UnknownTool,
    /// No connected server offers the tool.
    NotFound,
    /// The owning server is not running.
    NotRunning,
    /// The transport broke or timed out mid-call.
    Transport,
    /// The server answered with a JSON-RPC error or an unreadable payload.
    Protocol,
    /// The tool ran and reported an error (`isError: true`).
    ToolReported,
}

impl FailureKind {
    /// Transport-level failures let the registry try the next owner.
    pub fn is_transport_level(self) -> bool {
        matches!(self, FailureKind::NotRunning | FailureKind::Transport)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallOutcome {
    Success {
        tool_name: String,
        server_id: String,
        result: Vec<ToolContent>,
    },
    Failure {
        tool_name: String,
        reason: String,
        kind: FailureKind,
    },
}

impl ToolCallOutcome {
    pub fn failure(tool_name: impl Into<String>, kind: FailureKind, reason: impl Into<String>) -> Self {
        ToolCallOutcome::Failure {
            tool_name: tool_name.into(),
            reason: reason.into(),
            kind,
        }
    }

    pub fn tool_name(&self) -> &str {
        match self {
            ToolCallOutcome::Success { tool_name, .. } => tool_name,
            ToolCallOutcome::Failure { tool_name, .. } => tool_name,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolCallOutcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ToolCallOutcome::Success { .. } => None,
            ToolCallOutcome::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Joined text of all content items of a successful call.
    pub fn result_text(&self) -> Option<String> {
        match self {
            ToolCallOutcome::Success { result, .. } => Some(
                result
                    .iter()
                    .map(ToolContent::render)
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            ToolCallOutcome::Failure { .. } => None,
        }
    }
}

impl fmt::Display for ToolCallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolCallOutcome::Success {
                tool_name,
                server_id,
                ..
            } => {
                let text = self.result_text().unwrap_or_default();
                write!(f, "[{tool_name} @ {server_id}] succeeded:\n{text}")
            }
            ToolCallOutcome::Failure {
                tool_name, reason, ..
            } => write!(f, "[{tool_name}] tool call failed: {reason}"),
        }
    }
}
