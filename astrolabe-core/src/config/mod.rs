pub mod error;
pub mod loader;
pub mod server;

pub use error::ConfigError;
pub use loader::{ServerConfigStore, ensure_env_loaded};
pub use server::{ServerConfig, TransportKind};
