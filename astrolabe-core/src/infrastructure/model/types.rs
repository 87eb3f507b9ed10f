//! Request, response and error types shared by model clients

use crate::domain::types::{ChatMessage, MessageRole, ToolDescriptor};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Tools offered for native tool calling; empty disables it.
    pub tools: Vec<ToolDescriptor>,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = tools;
        self
    }
}

/// A structured tool call emitted by models that support native tool calling.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeToolCall {
    pub id: Option<String>,
    pub name: String,
    /// Either a JSON object or a string holding one, depending on the backend.
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub message: ChatMessage,
    pub tool_calls: Vec<NativeToolCall>,
}

impl ModelResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            message: ChatMessage::new(MessageRole::Assistant, content),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<NativeToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn content(&self) -> &str {
        &self.message.content
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model '{model}' is not available on '{provider}'")]
    ModelNotFound { provider: String, model: String },
    #[cfg(feature = "http-providers")]
    #[error("network error calling '{provider}': {source}")]
    Network {
        provider: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("'{provider}' is unavailable: {reason}")]
    Unavailable { provider: String, reason: String },
    #[error("'{provider}' returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl ModelError {
    pub fn model_not_found(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self::ModelNotFound {
            provider: provider.into(),
            model: model.into(),
        }
    }

    #[cfg(feature = "http-providers")]
    pub fn network(provider: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            provider: provider.into(),
            source,
        }
    }

    pub fn unavailable(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_response(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Short message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            ModelError::ModelNotFound { provider, model } => {
                format!("Model '{model}' is not available on '{provider}'. Pull it first.")
            }
            #[cfg(feature = "http-providers")]
            ModelError::Network { provider, source } => {
                if source.is_connect() {
                    format!("Cannot reach the model server '{provider}'. Is it running?")
                } else if source.is_timeout() {
                    format!("The request to '{provider}' timed out.")
                } else if let Some(status) = source.status() {
                    format!("'{provider}' answered with HTTP {}.", status.as_u16())
                } else {
                    format!("Network error talking to '{provider}'.")
                }
            }
            ModelError::Unavailable { provider, .. } => {
                format!("The model server '{provider}' is unavailable.")
            }
            ModelError::InvalidResponse { provider, .. } => {
                format!("'{provider}' sent a response that could not be understood.")
            }
        }
    }
}
