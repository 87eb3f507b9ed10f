//! # Application Module
//!
//! - [`tooling`] - tool-server processes, protocol clients and the `ToolClient` seam
//! - [`registry`] - tool name to server routing
//! - [`extractor`] - tool-call directives in model output
//! - [`round_trip`] - the ask, execute, ask-again cycle
//! - [`orchestrator`] - per-session context tying the above together

pub mod extractor;
pub mod orchestrator;
pub mod registry;
pub mod round_trip;
pub mod tooling;

#[cfg(test)]
pub(crate) mod testing;
