use crate::domain::types::{FailureKind, ToolCallOutcome};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolInvokeError {
    #[error("tool server '{server}' is not running")]
    NotRunning { server: String },
    #[error("failed to spawn tool server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tool server '{server}' exited during startup ({status})")]
    ExitedEarly { server: String, status: String },
    #[error("container runtime error for tool server '{server}': {message}")]
    ContainerRuntime { server: String, message: String },
    #[error("tool server '{server}' transport error: {message}")]
    Transport { server: String, message: String },
    #[error("tool server '{server}' returned invalid JSON: {source}")]
    InvalidJson {
        server: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("tool server '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
    #[error("tool server '{server}' terminated unexpectedly")]
    Terminated { server: String },
    #[error("tool server '{server}' did not answer '{method}' in time")]
    Timeout { server: String, method: String },
}

impl ToolInvokeError {
    pub fn server(&self) -> &str {
        match self {
            ToolInvokeError::NotRunning { server }
            | ToolInvokeError::Spawn { server, .. }
            | ToolInvokeError::ExitedEarly { server, .. }
            | ToolInvokeError::ContainerRuntime { server, .. }
            | ToolInvokeError::Transport { server, .. }
            | ToolInvokeError::InvalidJson { server, .. }
            | ToolInvokeError::Rpc { server, .. }
            | ToolInvokeError::Terminated { server }
            | ToolInvokeError::Timeout { server, .. } => server,
        }
    }

    /// Classification used when the error becomes a `ToolCallOutcome`.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ToolInvokeError::NotRunning { .. }
            | ToolInvokeError::Spawn { .. }
            | ToolInvokeError::ExitedEarly { .. }
            | ToolInvokeError::Terminated { .. } => FailureKind::NotRunning,
            ToolInvokeError::ContainerRuntime { .. }
            | ToolInvokeError::Transport { .. }
            | ToolInvokeError::Timeout { .. } => FailureKind::Transport,
            ToolInvokeError::InvalidJson { .. } | ToolInvokeError::Rpc { .. } => {
                FailureKind::Protocol
            }
        }
    }

    /// Message suitable for showing to the model or the user.
    ///
    /// JSON-RPC errors carry the server's own wording; everything else uses
    /// the display form.
    pub fn user_message(&self) -> String {
        match self {
            ToolInvokeError::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub(crate) fn into_outcome(self, tool_name: &str) -> ToolCallOutcome {
        ToolCallOutcome::failure(tool_name, self.failure_kind(), self.user_message())
    }
}
