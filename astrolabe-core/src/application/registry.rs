use crate::application::tooling::ToolClient;
use crate::domain::types::{FailureKind, ToolCallOutcome, ToolDescriptor};
use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

const QUALIFIED_SEPARATORS: [&str; 2] = [".", "__"];

/// Maps tool names to the servers that provide them.
///
/// Owners are kept in initialisation order; an unqualified name always
/// resolves to its first owner.
#[derive(Default)]
pub struct ToolRegistry {
    clients: Vec<Arc<dyn ToolClient>>,
    catalogue: Vec<Vec<ToolDescriptor>>,
    owners: HashMap<String, Vec<usize>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query every client's tools concurrently and rebuild the index.
    pub async fn initialize(&mut self, clients: Vec<Arc<dyn ToolClient>>) {
        self.clients = clients;
        self.rebuild(true).await;
    }

    /// Re-query every client, bypassing their caches.
    pub async fn refresh(&mut self) {
        self.rebuild(false).await;
    }

    async fn rebuild(&mut self, use_cache: bool) {
        let listings = join_all(self.clients.iter().map(|client| async move {
            if client.is_connected() {
                client.list_tools(use_cache).await
            } else {
                debug!(server = client.server_id(), "Skipping disconnected tool server");
                Vec::new()
            }
        }))
        .await;

        self.owners.clear();
        for (index, tools) in listings.iter().enumerate() {
            for tool in tools {
                let owners = self.owners.entry(tool.name.clone()).or_default();
                if !owners.contains(&index) {
                    owners.push(index);
                }
            }
        }
        self.catalogue = listings;

        let mut shared: Vec<(&String, &Vec<usize>)> = self
            .owners
            .iter()
            .filter(|(_, owners)| owners.len() > 1)
            .collect();
        shared.sort_by_key(|(name, _)| name.as_str());
        for (name, owners) in shared {
            let servers: Vec<&str> = owners.iter().map(|&i| self.clients[i].server_id()).collect();
            warn!(
                tool = %name,
                servers = ?servers,
                chosen = servers[0],
                "Tool offered by several servers; unqualified calls go to the first"
            );
        }

        info!(
            servers = self.clients.len(),
            tools = self.owners.len(),
            "Tool registry initialised"
        );
    }

    pub fn server_ids(&self) -> Vec<&str> {
        self.clients.iter().map(|client| client.server_id()).collect()
    }

    pub fn client(&self, server_id: &str) -> Option<&Arc<dyn ToolClient>> {
        self.clients
            .iter()
            .find(|client| client.server_id() == server_id)
    }

    /// Server that would handle `tool_name`, if any.
    pub fn resolve(&self, tool_name: &str) -> Option<String> {
        if let Some((server, _)) = self.split_qualified(tool_name) {
            return server
                .is_connected()
                .then(|| server.server_id().to_string());
        }
        self.owners
            .get(tool_name)
            .and_then(|owners| owners.first())
            .map(|&index| self.clients[index].server_id().to_string())
    }

    /// Every tool grouped by server id.
    pub fn get_all_tools(&self) -> BTreeMap<String, Vec<ToolDescriptor>> {
        self.clients
            .iter()
            .zip(&self.catalogue)
            .map(|(client, tools)| (client.server_id().to_string(), tools.clone()))
            .collect()
    }

    /// One descriptor per distinct tool name, first owner first.
    pub fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        let mut seen = std::collections::HashSet::new();
        self.catalogue
            .iter()
            .flatten()
            .filter(|tool| seen.insert(tool.name.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Route a call. Never fails; problems come back as [`ToolCallOutcome::Failure`].
    pub async fn call_tool(&self, tool_name: &str, arguments: Map<String, Value>) -> ToolCallOutcome {
        if let Some((server, bare)) = self.split_qualified(tool_name) {
            if !server.is_connected() {
                return ToolCallOutcome::failure(
                    tool_name,
                    FailureKind::NotRunning,
                    format!("tool server '{}' is not running", server.server_id()),
                );
            }
            debug!(server = server.server_id(), tool = bare, "Routing qualified tool call");
            return server.call_tool(bare, arguments).await;
        }

        let Some(owners) = self.owners.get(tool_name) else {
            return ToolCallOutcome::failure(
                tool_name,
                FailureKind::NotFound,
                format!("no connected tool server provides '{tool_name}'"),
            );
        };

        let mut last_failure = None;
        for &index in owners {
            let client = &self.clients[index];
            if !client.is_connected() {
                last_failure = Some(ToolCallOutcome::failure(
                    tool_name,
                    FailureKind::NotRunning,
                    format!("tool server '{}' is not running", client.server_id()),
                ));
                continue;
            }
            debug!(server = client.server_id(), tool = tool_name, "Routing tool call");
            let outcome = client.call_tool(tool_name, arguments.clone()).await;
            match outcome.failure_kind() {
                Some(kind) if kind.is_transport_level() => {
                    warn!(
                        server = client.server_id(),
                        tool = tool_name,
                        "Tool server unreachable; trying the next provider"
                    );
                    last_failure = Some(outcome);
                }
                _ => return outcome,
            }
        }
        last_failure.unwrap_or_else(|| {
            ToolCallOutcome::failure(
                tool_name,
                FailureKind::NotFound,
                format!("no connected tool server provides '{tool_name}'"),
            )
        })
    }

    /// `server.tool` or `server__tool` whose prefix names a registered server.
    ///
    /// Server ids may themselves contain separators, so every split point is
    /// tried and the longest matching prefix wins.
    fn split_qualified<'a>(&self, name: &'a str) -> Option<(&Arc<dyn ToolClient>, &'a str)> {
        let mut splits: Vec<(usize, usize)> = QUALIFIED_SEPARATORS
            .iter()
            .flat_map(|sep| name.match_indices(sep).map(|(at, _)| (at, sep.len())))
            .collect();
        splits.sort_by(|a, b| b.0.cmp(&a.0));
        splits.into_iter().find_map(|(at, len)| {
            let (prefix, rest) = (&name[..at], &name[at + len..]);
            if prefix.is_empty() || rest.is_empty() {
                return None;
            }
            self.client(prefix).map(|client| (client, rest))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::testing::StubToolClient;

    fn args() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("path".into(), Value::String("/tmp".into()));
        map
    }

    async fn registry(clients: Vec<Arc<StubToolClient>>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .initialize(clients.into_iter().map(|c| c as Arc<dyn ToolClient>).collect())
            .await;
        registry
    }

    #[tokio::test]
    async fn first_owner_wins_deterministically() {
        for _ in 0..5 {
            let registry = registry(vec![
                StubToolClient::new("alpha", &["search", "read"]).shared(),
                StubToolClient::new("beta", &["search"]).shared(),
            ])
            .await;
            assert_eq!(registry.resolve("search").as_deref(), Some("alpha"));
            assert_eq!(registry.resolve("read").as_deref(), Some("alpha"));
        }
    }

    #[tokio::test]
    async fn qualified_names_pick_the_named_server() {
        let registry = registry(vec![
            StubToolClient::new("alpha", &["search"]).shared(),
            StubToolClient::new("beta", &["search"]).shared(),
        ])
        .await;
        assert_eq!(registry.resolve("beta.search").as_deref(), Some("beta"));
        assert_eq!(registry.resolve("beta__search").as_deref(), Some("beta"));

        let outcome = registry.call_tool("beta__search", args()).await;
        assert!(matches!(outcome, ToolCallOutcome::Success { ref server_id, .. } if server_id == "beta"));
    }

    #[tokio::test]
    async fn dotted_server_ids_can_be_addressed() {
        let local = StubToolClient::new("fs.local", &["ls"]).shared();
        let remote = StubToolClient::new("fs.remote", &["ls"]).shared();
        let registry = registry(vec![local.clone(), remote.clone()]).await;

        assert_eq!(registry.resolve("fs.remote.ls").as_deref(), Some("fs.remote"));
        assert_eq!(registry.resolve("fs.local__ls").as_deref(), Some("fs.local"));
        assert_eq!(registry.resolve("ls").as_deref(), Some("fs.local"));

        let outcome = registry.call_tool("fs.remote.ls", args()).await;
        assert!(matches!(outcome, ToolCallOutcome::Success { ref server_id, .. } if server_id == "fs.remote"));
        assert_eq!(remote.call_count(), 1);
        assert_eq!(local.call_count(), 0);
    }

    #[tokio::test]
    async fn dotted_tool_names_keep_their_tail() {
        let registry = registry(vec![StubToolClient::new("git", &["status.short"]).shared()]).await;
        assert_eq!(registry.resolve("git.status.short").as_deref(), Some("git"));
        let outcome = registry.call_tool("git.status.short", args()).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn unregistered_prefix_falls_back_to_full_name() {
        let registry = registry(vec![StubToolClient::new("fs", &["git.status"]).shared()]).await;
        assert_eq!(registry.resolve("git.status").as_deref(), Some("fs"));
        assert!(registry.call_tool("git.status", args()).await.is_success());
    }

    #[tokio::test]
    async fn disconnected_prefix_fails_fast() {
        let down = StubToolClient::new("beta", &["search"]).disconnected().shared();
        let registry = registry(vec![
            StubToolClient::new("alpha", &["search"]).shared(),
            down.clone(),
        ])
        .await;
        assert_eq!(registry.resolve("beta.search"), None);

        let outcome = registry.call_tool("beta.search", args()).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::NotRunning));
        assert_eq!(down.call_count(), 0);
    }

    #[tokio::test]
    async fn transport_failures_fall_through_to_next_owner() {
        let broken = StubToolClient::new("alpha", &["search"])
            .failing(FailureKind::Transport)
            .shared();
        let healthy = StubToolClient::new("beta", &["search"]).shared();
        let registry = registry(vec![broken.clone(), healthy.clone()]).await;

        let outcome = registry.call_tool("search", args()).await;
        assert!(matches!(outcome, ToolCallOutcome::Success { ref server_id, .. } if server_id == "beta"));
        assert_eq!(broken.call_count(), 1);
        assert_eq!(healthy.call_count(), 1);
    }

    #[tokio::test]
    async fn tool_errors_do_not_fall_through() {
        let reporting = StubToolClient::new("alpha", &["search"])
            .failing(FailureKind::ToolReported)
            .shared();
        let healthy = StubToolClient::new("beta", &["search"]).shared();
        let registry = registry(vec![reporting, healthy.clone()]).await;

        let outcome = registry.call_tool("search", args()).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::ToolReported));
        assert_eq!(healthy.call_count(), 0);
    }

    #[tokio::test]
    async fn every_owner_down_returns_last_failure() {
        let registry = registry(vec![
            StubToolClient::new("alpha", &["search"]).failing(FailureKind::NotRunning).shared(),
            StubToolClient::new("beta", &["search"]).failing(FailureKind::Transport).shared(),
        ])
        .await;
        let outcome = registry.call_tool("search", args()).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Transport));
        assert!(outcome.to_string().contains("beta is broken"));
    }

    #[tokio::test]
    async fn unknown_tools_are_not_found() {
        let registry = registry(vec![StubToolClient::new("alpha", &["search"]).shared()]).await;
        assert_eq!(registry.resolve("delete_everything"), None);
        let outcome = registry.call_tool("delete_everything", Map::new()).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::NotFound));
    }

    #[tokio::test]
    async fn catalogue_groups_by_server_and_dedupes_descriptors() {
        let registry = registry(vec![
            StubToolClient::new("beta", &["search", "fetch"]).shared(),
            StubToolClient::new("alpha", &["search"]).shared(),
            StubToolClient::new("gamma", &["hidden"]).disconnected().shared(),
        ])
        .await;

        let all = registry.get_all_tools();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["alpha", "beta", "gamma"]);
        assert_eq!(all["beta"].len(), 2);
        assert!(all["gamma"].is_empty());

        let names: Vec<String> = registry.tool_descriptors().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["search", "fetch"]);
        assert_eq!(registry.tool_descriptors()[0].description, "search from beta");
        assert_eq!(registry.server_ids(), vec!["beta", "alpha", "gamma"]);
    }
}
