//! Tool orchestration for locally hosted language models.
//!
//! Tool servers are spawned as child processes speaking JSON-RPC over stdio.
//! Their tools are indexed in a [`ToolRegistry`], tool-call directives are
//! pulled out of model replies and executed, and the results are handed back
//! to the model for a final answer.

pub mod application;
pub mod config;
pub mod constants;
pub mod domain;
pub mod infrastructure;

pub use application::extractor::ToolCallExtractor;
pub use application::orchestrator::{BootstrapReport, ServerStatus, ToolOrchestrator};
pub use application::registry::ToolRegistry;
pub use application::round_trip::{
    AgentRoundTripController, RoundTripOutcome, RoundTripState, format_outcomes,
};
pub use application::tooling;
pub use config::{ConfigError, ServerConfig, ServerConfigStore, TransportKind};
pub use domain::types;
pub use infrastructure::model;
