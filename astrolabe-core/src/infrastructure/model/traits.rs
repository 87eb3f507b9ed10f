use super::types::{ModelError, ModelRequest, ModelResponse};
use async_trait::async_trait;

/// A chat-completion backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn id(&self) -> &str;

    async fn chat(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}
