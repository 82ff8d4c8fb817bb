//! Client for the remote tool provider (MCP over HTTP+SSE).
//!
//! [`SseConnector`] opens [`SseTransport`] sessions; [`ProviderSession`] runs the
//! protocol on top of any [`Transport`], which keeps the connection manager testable
//! with in-process transports.

#[cfg(test)]
pub(crate) mod mock;
pub mod protocol;
pub mod session;
pub mod sse;
pub mod transport;

pub use protocol::{CallToolResult, Implementation, ToolContent, ToolDescriptor};
pub use session::ProviderSession;
pub use transport::{Connector, SseConnector, SseTransport, Transport};
