use crate::domain::types::{ToolCallOutcome, ToolDescriptor};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// A connected tool server, as seen by the registry.
///
/// Implementations never return errors from `list_tools` or `call_tool`:
/// failures are logged and folded into an empty list or a
/// [`ToolCallOutcome::Failure`].
#[async_trait]
pub trait ToolClient: Send + Sync {
    fn server_id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Advertised tools. With `use_cache` a previously fetched list is reused.
    async fn list_tools(&self, use_cache: bool) -> Vec<ToolDescriptor>;

    async fn call_tool(&self, tool_name: &str, arguments: Map<String, Value>) -> ToolCallOutcome;

    /// Usage notes the server sent during the handshake.
    async fn instructions(&self) -> Option<String> {
        None
    }

    /// Best-effort polite goodbye; never fails.
    async fn shutdown(&self);
}
