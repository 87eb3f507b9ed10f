use super::error::ConfigError;
use super::server::{RawServer, ServerConfig};
use crate::constants::ENV_PATH;
use dotenvy::from_filename;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Once;
use tracing::{debug, info, warn};

static ENV_LOADER: Once = Once::new();

/// Ensures environment variables are loaded from `config/.env`
pub fn ensure_env_loaded() {
    ENV_LOADER.call_once(|| {
        let _ = from_filename(ENV_PATH);
    });
}

/// The two accepted top-level layouts, resolved once per load.
#[derive(Debug)]
enum RawConfigDocument {
    /// `{"mcpServers": {"<id>": {...}}}`
    Keyed(Map<String, Value>),
    /// `{"servers": [{"id": "...", ...}]}`
    Flat(Vec<Value>),
}

impl RawConfigDocument {
    fn classify(document: Value, path: &Path) -> Result<Self, ConfigError> {
        let unrecognised = |found: String| ConfigError::UnrecognisedShape {
            path: path.to_path_buf(),
            found,
        };
        let Value::Object(mut root) = document else {
            return Err(unrecognised(describe(&document)));
        };
        if let Some(keyed) = root.remove("mcpServers") {
            return match keyed {
                Value::Object(entries) => Ok(RawConfigDocument::Keyed(entries)),
                other => Err(unrecognised(format!("'mcpServers' as {}", describe(&other)))),
            };
        }
        if let Some(flat) = root.remove("servers") {
            return match flat {
                Value::Array(entries) => Ok(RawConfigDocument::Flat(entries)),
                other => Err(unrecognised(format!("'servers' as {}", describe(&other)))),
            };
        }
        let keys: Vec<&str> = root.keys().map(String::as_str).collect();
        Err(unrecognised(format!("keys [{}]", keys.join(", "))))
    }

    fn into_entries(self) -> Vec<(Option<String>, Value)> {
        match self {
            RawConfigDocument::Keyed(entries) => entries
                .into_iter()
                .map(|(id, value)| (Some(id), value))
                .collect(),
            RawConfigDocument::Flat(entries) => {
                entries.into_iter().map(|value| (None, value)).collect()
            }
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(_) => "a boolean".into(),
        Value::Number(_) => "a number".into(),
        Value::String(_) => "a string".into(),
        Value::Array(_) => "an array".into(),
        Value::Object(_) => "an object".into(),
    }
}

/// Loads tool-server definitions.
///
/// Loading degrades to an empty set rather than failing: the conversation
/// must stay usable with no tool servers at all.
pub struct ServerConfigStore;

impl ServerConfigStore {
    /// Load server definitions, logging and returning `[]` on any file-level problem.
    pub fn load(path: &Path) -> Vec<ServerConfig> {
        match Self::try_load(path) {
            Ok(configs) => {
                info!(
                    path = %path.display(),
                    count = configs.len(),
                    "Loaded tool server definitions"
                );
                configs
            }
            Err(err) => {
                warn!(%err, "Continuing without tool servers");
                Vec::new()
            }
        }
    }

    /// Like [`ServerConfigStore::load`] but surfaces the file-level diagnostic.
    ///
    /// Individual malformed entries are still skipped with a warning.
    pub fn try_load(path: &Path) -> Result<Vec<ServerConfig>, ConfigError> {
        ensure_env_loaded();
        debug!(path = %path.display(), "Reading tool server definitions");

        let content = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let document = parse_document(path, &content)?;
        let entries = RawConfigDocument::classify(document, path)?.into_entries();
        Ok(normalise(entries))
    }
}

fn parse_document(path: &Path, content: &str) -> Result<Value, ConfigError> {
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    if is_toml {
        let table: toml::Table = toml::from_str(content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::to_value(table).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_json::from_str(content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn normalise(entries: Vec<(Option<String>, Value)>) -> Vec<ServerConfig> {
    let mut seen = HashSet::new();
    let mut configs = Vec::with_capacity(entries.len());

    for (index, (key, value)) in entries.into_iter().enumerate() {
        let raw: RawServer = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(entry = index, server = ?key, %err, "Skipping malformed server entry");
                continue;
            }
        };
        let Some(id) = key.or_else(|| raw.id.clone()) else {
            warn!(entry = index, "Skipping server entry without an 'id'");
            continue;
        };
        match raw.into_config(id) {
            Ok(config) => {
                if !seen.insert(config.id.clone()) {
                    warn!(server = %config.id, "Skipping duplicate server id");
                    continue;
                }
                debug!(
                    server = %config.id,
                    command = %config.command.display(),
                    transport = %config.transport,
                    "Normalised server definition"
                );
                configs.push(config);
            }
            Err(reason) => warn!(entry = index, %reason, "Skipping server entry"),
        }
    }

    configs
}
