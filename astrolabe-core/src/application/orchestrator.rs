use crate::application::extractor::ToolCallExtractor;
use crate::application::registry::ToolRegistry;
use crate::application::tooling::{
    SupervisorOptions, ToolClient, ToolInvokeError, ToolProtocolClient, ToolServerSupervisor,
};
use crate::config::ServerConfig;
use crate::domain::types::ToolCallRequest;
use futures::future::join_all;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Servers that did not make it through bootstrap, with the reason.
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub id: String,
    pub running: bool,
    pub connected: bool,
    pub tools: usize,
}

/// Owns the supervisor, the protocol clients and the registry for one session.
pub struct ToolOrchestrator {
    configs: Vec<ServerConfig>,
    supervisor: ToolServerSupervisor,
    registry: ToolRegistry,
    guidance: Vec<(String, String)>,
}

impl ToolOrchestrator {
    pub fn new(configs: Vec<ServerConfig>, options: SupervisorOptions) -> Self {
        Self {
            configs,
            supervisor: ToolServerSupervisor::new(options),
            registry: ToolRegistry::new(),
            guidance: Vec::new(),
        }
    }

    /// Orchestrator over already-connected clients; nothing is spawned.
    pub async fn with_clients(clients: Vec<Arc<dyn ToolClient>>) -> Self {
        let mut orchestrator = Self::new(Vec::new(), SupervisorOptions::default());
        orchestrator.install(clients).await;
        orchestrator
    }

    /// Start every configured server concurrently and index their tools.
    ///
    /// A server that fails to start or handshake is logged and left out.
    pub async fn bootstrap(&mut self) -> BootstrapReport {
        let attempts = join_all(self.configs.iter().map(|config| self.connect(config))).await;

        let mut report = BootstrapReport::default();
        let mut clients: Vec<Arc<dyn ToolClient>> = Vec::new();
        for (config, attempt) in self.configs.iter().zip(attempts) {
            match attempt {
                Ok(client) => {
                    report.connected.push(config.id.clone());
                    clients.push(Arc::new(client));
                }
                Err(err) => {
                    warn!(server = %config.id, %err, "Tool server unavailable; continuing without it");
                    report.failed.push((config.id.clone(), err.user_message()));
                }
            }
        }

        self.install(clients).await;
        info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            "Tool servers bootstrapped"
        );
        report
    }

    async fn connect(&self, config: &ServerConfig) -> Result<ToolProtocolClient, ToolInvokeError> {
        self.supervisor.start_server(config).await?;
        let transport = self
            .supervisor
            .take_transport(&config.id)
            .await
            .ok_or_else(|| ToolInvokeError::Transport {
                server: config.id.clone(),
                message: "server pipes already claimed".to_string(),
            })?;
        match ToolProtocolClient::connect(config.id.clone(), transport).await {
            Ok(client) => Ok(client),
            Err(err) => {
                self.supervisor.stop_server(&config.id).await;
                Err(err)
            }
        }
    }

    async fn install(&mut self, clients: Vec<Arc<dyn ToolClient>>) {
        let notes = join_all(clients.iter().map(|client| client.instructions())).await;
        self.guidance = clients
            .iter()
            .zip(notes)
            .filter_map(|(client, note)| {
                note.filter(|text| !text.trim().is_empty())
                    .map(|text| (client.server_id().to_string(), text))
            })
            .collect();
        self.registry.initialize(clients).await;
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &ToolServerSupervisor {
        &self.supervisor
    }

    /// Re-list every server's tools, bypassing caches.
    pub async fn refresh_tools(&mut self) {
        self.registry.refresh().await;
    }

    pub async fn server_status(&self) -> Vec<ServerStatus> {
        let catalogue = self.registry.get_all_tools();
        let mut statuses = Vec::new();
        for config in &self.configs {
            let client = self.registry.client(&config.id);
            statuses.push(ServerStatus {
                id: config.id.clone(),
                running: self.supervisor.is_running(&config.id).await,
                connected: client.is_some_and(|client| client.is_connected()),
                tools: catalogue.get(&config.id).map_or(0, Vec::len),
            });
        }
        statuses
    }

    /// Tool-usage guidance plus every known tool in directive syntax.
    pub fn system_prompt(&self) -> String {
        let mut lines = vec![
            "You can use external tools to answer the user's request.".to_string(),
            "To call a tool, write a line of the form: tools/call <server> <tool> {json arguments}"
                .to_string(),
            "If the tool name is unique you may omit the server: tools/call <tool> {json arguments}"
                .to_string(),
            "Arguments must be a single JSON object. Tool results will be sent back to you in the next message."
                .to_string(),
        ];

        for (server, note) in &self.guidance {
            lines.push(format!("Server '{server}' guidance: {}", note.trim()));
        }

        let catalogue = self.registry.get_all_tools();
        if catalogue.values().all(Vec::is_empty) {
            lines.push("No tools are currently available; answer directly.".to_string());
            return lines.join("\n");
        }

        lines.push("Available tools:".to_string());
        for (server, tools) in &catalogue {
            for tool in tools {
                let example = ToolCallRequest::new(format!("{server}.{}", tool.name), Map::new());
                let mut line = format!("- {}", ToolCallExtractor::format_directive(&example));
                if !tool.description.trim().is_empty() {
                    line.push_str(&format!(" : {}", tool.description.trim()));
                }
                if let Some(properties) = tool.input_schema.get("properties").and_then(Value::as_object)
                    && !properties.is_empty()
                {
                    let names: Vec<&str> = properties.keys().map(String::as_str).collect();
                    line.push_str(&format!(" (arguments: {})", names.join(", ")));
                }
                lines.push(line);
            }
        }
        lines.join("\n")
    }

    /// Say goodbye to every server, then stop all processes.
    pub async fn shutdown(&mut self) {
        let ids: Vec<String> = self.registry.server_ids().into_iter().map(str::to_string).collect();
        join_all(
            ids.iter()
                .filter_map(|id| self.registry.client(id))
                .map(|client| client.shutdown()),
        )
        .await;
        self.supervisor.stop_all().await;
        info!("Tool servers shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::StubToolClient;
    use crate::domain::types::{FailureKind, ToolCallOutcome, ToolDescriptor};
    use async_trait::async_trait;

    struct GuidedClient;

    #[async_trait]
    impl ToolClient for GuidedClient {
        fn server_id(&self) -> &str {
            "fs"
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn list_tools(&self, _use_cache: bool) -> Vec<ToolDescriptor> {
            vec![
                ToolDescriptor::new("read_file", "Read a text file").with_schema(serde_json::json!({
                    "type": "object",
                    "properties": {"path": {"type": "string"}}
                })),
            ]
        }

        async fn call_tool(&self, tool_name: &str, _arguments: Map<String, Value>) -> ToolCallOutcome {
            ToolCallOutcome::failure(tool_name, FailureKind::Protocol, "unused")
        }

        async fn instructions(&self) -> Option<String> {
            Some("Paths are relative to the workspace.".to_string())
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn system_prompt_lists_tools_in_directive_syntax() {
        let orchestrator = ToolOrchestrator::with_clients(vec![Arc::new(GuidedClient)]).await;
        let prompt = orchestrator.system_prompt();
        assert!(prompt.contains("- tools/call fs read_file {} : Read a text file (arguments: path)"));
        assert!(prompt.contains("Server 'fs' guidance: Paths are relative to the workspace."));
    }

    #[tokio::test]
    async fn system_prompt_without_tools_says_so() {
        let orchestrator = ToolOrchestrator::with_clients(Vec::new()).await;
        assert!(orchestrator.system_prompt().contains("No tools are currently available"));
    }

    #[tokio::test]
    async fn shutdown_reaches_every_client() {
        let stub = StubToolClient::new("fs", &["ls"]).shared();
        let mut orchestrator =
            ToolOrchestrator::with_clients(vec![stub.clone() as Arc<dyn ToolClient>]).await;
        assert!(stub.is_connected());
        orchestrator.shutdown().await;
        assert!(!stub.is_connected());
    }

    #[tokio::test]
    async fn failed_servers_do_not_block_bootstrap() {
        let configs = vec![
            ServerConfig::new("ghost", "/nonexistent/astrolabe-ghost"),
            ServerConfig::new("phantom", "/nonexistent/astrolabe-phantom"),
        ];
        let mut orchestrator = ToolOrchestrator::new(configs, SupervisorOptions::default());
        let report = orchestrator.bootstrap().await;

        assert!(report.connected.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, "ghost");
        assert!(orchestrator.registry().is_empty());

        let statuses = orchestrator.server_status().await;
        assert!(statuses.iter().all(|status| !status.running && !status.connected));
    }
}
