pub mod bridge;
pub mod transport;
pub mod types;

pub use bridge::ToolBridgeClient;
pub use transport::{McpTransport, ToolTransport};
pub use types::{EndpointSet, ToolCallResult, ToolEndpoint, ToolError, ToolInfo, TransportKind};
