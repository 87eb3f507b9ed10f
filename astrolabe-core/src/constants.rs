//! Application constants
//!
//! Single source of truth for paths, timeouts and other defaults.

use std::time::Duration;

/// Default tool-server definition file.
pub const SERVERS_CONFIG_PATH: &str = "config/mcp_servers.json";

/// Environment file loaded before `${VAR}` expansion in server definitions.
pub const ENV_PATH: &str = "config/.env";

/// Directory receiving per-server stderr logs.
pub const DEFAULT_LOG_DIR: &str = "logs/servers";

/// Environment variable carrying the log verbosity token to tool servers.
pub const SERVER_LOG_LEVEL_ENV: &str = "MCP_LOG_LEVEL";

/// Prefix for container names derived from server ids.
pub const CONTAINER_NAME_PREFIX: &str = "astrolabe";

/// How long `start_server` waits for the first byte of server output.
pub const STARTUP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace window between the termination signal and a forced kill.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_millis(2500);

/// Upper bound for a single JSON-RPC request to a tool server.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for the optional `shutdown` request during teardown.
pub const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// MCP protocol revision sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
