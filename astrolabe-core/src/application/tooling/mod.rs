mod client;
mod error;
mod handle;
mod interface;
pub mod protocol;
mod supervisor;

pub use client::ToolProtocolClient;
pub use error::ToolInvokeError;
pub use handle::{LogSink, ProcessIdentifier, ServerHandle};
pub use interface::ToolClient;
pub use supervisor::{ServerLogLevel, StdioTransport, SupervisorOptions, ToolServerSupervisor};
