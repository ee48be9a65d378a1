pub mod client;
pub mod pool;
pub mod service;
pub mod transport;

pub use client::{ClientCapabilities, ClientInfo, Error, McpClient, McpClientTrait};
pub use pool::{Connector, HttpConnector, PoolError, PoolKey, ServerConfig, ToolClientPool};
pub use service::McpService;
pub use transport::{SseTransport, StreamableHttpTransport, Transport, TransportHandle};
