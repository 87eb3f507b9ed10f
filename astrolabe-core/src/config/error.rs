use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when loading tool-server definitions
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server definition file not found at {path:?}")]
    NotFound { path: PathBuf },

    #[error("failed to read server definitions from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse JSON server definitions from {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse TOML server definitions from {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(
        "unrecognised layout in {path:?}: expected a top-level 'mcpServers' object or 'servers' array, found {found}"
    )]
    UnrecognisedShape { path: PathBuf, found: String },
}
