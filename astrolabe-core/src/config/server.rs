use crate::constants::CONTAINER_NAME_PREFIX;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

/// How a tool server process is launched and probed for liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process in our process group, speaking over its stdio pipes.
    Stdio,
    /// Child process in its own process group, speaking over its stdio pipes.
    #[serde(alias = "detached")]
    DetachedProcess,
    /// `docker run -i ...` style launcher; liveness is asked of the runtime.
    #[serde(alias = "docker")]
    Container,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::DetachedProcess => "detached",
            TransportKind::Container => "container",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub capabilities: BTreeSet<String>,
    pub transport: TransportKind,
}

impl ServerConfig {
    /// Minimal stdio server definition; mostly useful for embedding and tests.
    pub fn new(id: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            capabilities: BTreeSet::new(),
            transport: TransportKind::Stdio,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Container name used for runtime queries.
    ///
    /// An explicit `--name` in the run arguments wins; otherwise the name is
    /// derived from the server id so that it is stable across restarts.
    pub fn container_name(&self) -> String {
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            if arg == "--name" {
                if let Some(value) = args.next() {
                    return value.clone();
                }
            } else if let Some(value) = arg.strip_prefix("--name=") {
                return value.to_string();
            }
        }
        derived_container_name(&self.id)
    }
}

pub(crate) fn derived_container_name(id: &str) -> String {
    let sanitised: String = id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
                ch
            } else {
                '-'
            }
        })
        .collect();
    format!("{CONTAINER_NAME_PREFIX}-{sanitised}")
}

/// One server entry as written in the definition file.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawServer {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, alias = "workingDir", alias = "workdir")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub transport: Option<TransportKind>,
}

impl RawServer {
    /// Normalise into a [`ServerConfig`], expanding `~` and `$VAR` references.
    pub(crate) fn into_config(self, id: String) -> Result<ServerConfig, String> {
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err("server entry has an empty id".to_string());
        }
        let command = match self.command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => expand(command),
            _ => return Err(format!("server '{id}' is missing 'command'")),
        };
        let args: Vec<String> = self.args.iter().map(|arg| expand(arg)).collect();
        let env = self
            .env
            .into_iter()
            .map(|(key, value)| (key, expand(&value)))
            .collect();
        let transport = self
            .transport
            .unwrap_or_else(|| infer_transport(&command, &args));

        Ok(ServerConfig {
            name: self
                .name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| id.clone()),
            id,
            command: PathBuf::from(command),
            args,
            env,
            working_dir: self.cwd.map(|dir| PathBuf::from(expand(&dir))),
            capabilities: self.capabilities.into_iter().collect(),
            transport,
        })
    }
}

fn expand(value: &str) -> String {
    shellexpand::full(value)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

fn infer_transport(command: &str, args: &[String]) -> TransportKind {
    let program = Path::new(command)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(command);
    let is_runtime = matches!(program, "docker" | "podman");
    let first_verb = args.iter().find(|arg| !arg.starts_with('-'));
    if is_runtime && first_verb.map(String::as_str) == Some("run") {
        TransportKind::Container
    } else {
        TransportKind::Stdio
    }
}
