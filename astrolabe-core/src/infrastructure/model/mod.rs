//! Model infrastructure module
//!
//! # Structure
//! - `types` - Request, Response, Error types
//! - `traits` - the `ModelClient` seam used by the round trip
//! - `adapter` - Message and tool format adapters
//! - `clients` - HTTP client implementations

pub mod adapter;
#[cfg(feature = "http-providers")]
pub mod clients;
pub mod traits;
pub mod types;

pub use traits::ModelClient;
pub use types::{ModelError, ModelRequest, ModelResponse, NativeToolCall};
