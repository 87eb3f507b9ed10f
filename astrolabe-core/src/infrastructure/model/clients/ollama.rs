use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::base::HttpClientBase;
use crate::constants::DEFAULT_OLLAMA_URL;
use crate::infrastructure::model::adapter::MessageAdapter;
use crate::infrastructure::model::traits::ModelClient;
use crate::infrastructure::model::types::{ModelError, ModelRequest, ModelResponse};

/// Client for a local Ollama server's `/api/chat`.
#[derive(Clone)]
pub struct OllamaClient {
    base: HttpClientBase,
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new(DEFAULT_OLLAMA_URL)
    }
}

impl OllamaClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            base: HttpClientBase::new("ollama", endpoint),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.base.endpoint
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    fn id(&self) -> &str {
        &self.base.id
    }

    async fn chat(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = self.base.build_url("/api/chat");
        let payload = OllamaRequest {
            model: &request.model,
            messages: MessageAdapter::to_chat_format(&request.messages),
            tools: MessageAdapter::to_tool_format(&request.tools),
            stream: false,
        };

        info!(
            provider = self.base.id.as_str(),
            model = request.model.as_str(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending request to Ollama"
        );

        let response: OllamaResponse = self.base.post_json(&url, &payload).await?;
        if let Some(error) = response.error {
            return Err(if error.contains("not found") {
                ModelError::model_not_found(&self.base.id, &request.model)
            } else {
                ModelError::unavailable(&self.base.id, error)
            });
        }
        let message = response
            .message
            .ok_or_else(|| ModelError::invalid_response(&self.base.id, "missing message"))?;
        let tool_calls = MessageAdapter::parse_tool_calls(&message.tool_calls);
        debug!(tool_calls = tool_calls.len(), "Received response from Ollama");

        Ok(ModelResponse::new(message.content).with_tool_calls(tool_calls))
    }
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<Value>,
}
