use astrolabe_core::constants::{DEFAULT_LOG_DIR, DEFAULT_OLLAMA_URL, SERVERS_CONFIG_PATH};
use astrolabe_core::tooling::ServerLogLevel;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "astrolabe",
    version,
    about = "Chat with a local model that can call MCP tool servers"
)]
pub struct Cli {
    /// Tool-server definitions (JSON or TOML)
    #[arg(long, env = "ASTROLABE_SERVERS", default_value = SERVERS_CONFIG_PATH)]
    pub servers: PathBuf,

    /// Model name passed to the chat endpoint
    #[arg(long, env = "ASTROLABE_MODEL", default_value = "llama3.1")]
    pub model: String,

    /// Ollama base URL
    #[arg(long, env = "ASTROLABE_ENDPOINT", default_value = DEFAULT_OLLAMA_URL)]
    pub endpoint: String,

    /// Extra system prompt placed before the tool guidance
    #[arg(long, env = "ASTROLABE_SYSTEM")]
    pub system: Option<String>,

    /// Directory for per-server stderr logs
    #[arg(long, env = "ASTROLABE_LOG_DIR", default_value = DEFAULT_LOG_DIR)]
    pub log_dir: PathBuf,

    /// Verbosity handed to tool servers: debug, info or quiet
    #[arg(
        long,
        env = "ASTROLABE_SERVER_LOG_LEVEL",
        default_value = "info",
        value_parser = parse_server_log_level
    )]
    pub server_log_level: ServerLogLevel,

    /// Mirror server stderr into this process's log instead of files
    #[arg(long, env = "ASTROLABE_INTERACTIVE_LOGS")]
    pub interactive_logs: bool,

    /// Log filter used when neither ASTROLABE_LOG nor RUST_LOG is set
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Answer one prompt and exit instead of starting the interactive loop
    #[arg(long, short)]
    pub prompt: Option<String>,

    /// Only offer tools through the system prompt, not the model's native tool API
    #[arg(long)]
    pub no_native_tools: bool,
}

fn parse_server_log_level(value: &str) -> Result<ServerLogLevel, String> {
    ServerLogLevel::parse(value)
        .ok_or_else(|| format!("unknown server log level '{value}' (expected debug, info or quiet)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_come_from_constants() {
        let cli = Cli::try_parse_from(["astrolabe"]).expect("parse");
        assert_eq!(cli.servers, PathBuf::from(SERVERS_CONFIG_PATH));
        assert_eq!(cli.log_dir, PathBuf::from(DEFAULT_LOG_DIR));
        assert_eq!(cli.server_log_level, ServerLogLevel::Info);
        assert!(cli.prompt.is_none());
        assert!(!cli.no_native_tools);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "astrolabe",
            "--servers",
            "servers.toml",
            "--model",
            "qwen2.5",
            "--server-log-level",
            "off",
            "--interactive-logs",
            "--prompt",
            "list files in /tmp",
        ])
        .expect("parse");
        assert_eq!(cli.servers, PathBuf::from("servers.toml"));
        assert_eq!(cli.model, "qwen2.5");
        assert_eq!(cli.server_log_level, ServerLogLevel::Quiet);
        assert!(cli.interactive_logs);
        assert_eq!(cli.prompt.as_deref(), Some("list files in /tmp"));
    }

    #[test]
    fn unknown_server_log_level_is_rejected() {
        assert!(Cli::try_parse_from(["astrolabe", "--server-log-level", "loud"]).is_err());
    }
}
