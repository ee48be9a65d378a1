use rmcp::model::{
    CallToolResult, ErrorCode, Implementation, InitializeResult, JsonRpcError, JsonRpcMessage,
    JsonRpcResponse, ListToolsResult, RequestId, ServerCapabilities,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tower::{timeout::TimeoutLayer, Layer, Service, ServiceExt};

use crate::transport::{notification_message, request_message, response_id};
use crate::{McpService, TransportHandle};

pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// Error type for MCP client operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] super::transport::Error),

    #[error("RPC error: code={code}, message={message}")]
    RpcError { code: i32, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unexpected response from server: {0}")]
    UnexpectedResponse(String),

    #[error("Not initialized")]
    NotInitialized,

    #[error("Timeout or service not ready")]
    NotReady,

    #[error("Request timed out")]
    Timeout(#[from] tower::timeout::error::Elapsed),

    #[error("Error from tool server: {0}")]
    ServerBoxError(BoxError),
}

impl From<BoxError> for Error {
    fn from(err: BoxError) -> Self {
        let err = match err.downcast::<super::transport::Error>() {
            Ok(transport) => return Error::Transport(*transport),
            Err(err) => err,
        };
        match err.downcast::<tower::timeout::error::Elapsed>() {
            Ok(elapsed) => Error::Timeout(*elapsed),
            Err(err) => Error::ServerBoxError(err),
        }
    }
}

impl Error {
    /// True when the pooled connection is unusable and should be evicted.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::Transport(e) if e.is_connection_closed())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        ClientInfo {
            name: "switchyard".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientCapabilities {}

#[derive(Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

#[async_trait::async_trait]
pub trait McpClientTrait: Send + Sync {
    async fn initialize(
        &mut self,
        info: ClientInfo,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResult, Error>;

    async fn list_tools(&self, next_cursor: Option<String>) -> Result<ListToolsResult, Error>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, Error>;

    /// Release the connection. Calls made afterwards fail with a closed-connection error.
    async fn close(&self) -> Result<(), Error>;
}

/// The MCP client is the interface for MCP operations.
///
/// Requests are multiplexed over one transport: each call clones the service and
/// waits on its own response channel, so concurrent calls never queue behind each other.
pub struct McpClient<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    service: tower::timeout::Timeout<McpService<T>>,
    inner: McpService<T>,
    next_id_counter: AtomicU32,
    server_capabilities: Option<ServerCapabilities>,
    server_info: Option<Implementation>,
}

impl<T> McpClient<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    pub async fn connect(transport: T, timeout: Duration) -> Result<Self, Error> {
        let service = McpService::new(transport.clone());
        let service_ptr = service.clone();

        tokio::spawn(async move {
            loop {
                match transport.receive().await {
                    Ok(message) => {
                        tracing::debug!("Received message: {:?}", message);
                        match response_id(&message) {
                            Some(id) => service_ptr.respond(id, Ok(message)).await,
                            None => tracing::debug!("Ignoring server-initiated message"),
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Tool server connection ended: {}", e);
                        service_ptr.hangup(e).await;
                        break;
                    }
                }
            }
        });

        let middleware = TimeoutLayer::new(timeout);

        Ok(Self {
            service: middleware.layer(service.clone()),
            inner: service,
            next_id_counter: AtomicU32::new(1),
            server_capabilities: None,
            server_info: None,
        })
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref()
    }

    /// Send a JSON-RPC request and check we don't get an error response.
    async fn send_request<R>(&self, method: &str, params: Value) -> Result<R, Error>
    where
        R: for<'de> Deserialize<'de>,
    {
        let mut service = self.service.clone();
        service.ready().await.map_err(|_| Error::NotReady)?;
        let id_num = self.next_id_counter.fetch_add(1, Ordering::SeqCst);
        let expected_id = RequestId::Number(id_num);

        let request = request_message(id_num, method, params);
        let response_msg = service.call(request).await?;

        match response_msg {
            Some(JsonRpcMessage::Response(JsonRpcResponse { id, result, .. })) => {
                if id != expected_id {
                    return Err(Error::UnexpectedResponse(
                        "id mismatch for JsonRpcResponse".to_string(),
                    ));
                }
                Ok(serde_json::from_value(Value::Object(result))?)
            }
            Some(JsonRpcMessage::Error(JsonRpcError { id, error, .. })) => {
                if id != expected_id {
                    return Err(Error::UnexpectedResponse(
                        "id mismatch for JsonRpcError".to_string(),
                    ));
                }
                Err(Error::RpcError {
                    code: error.code.0,
                    message: error.message.to_string(),
                })
            }
            _ => Err(Error::UnexpectedResponse(
                "unexpected message type".to_string(),
            )),
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), Error> {
        let mut service = self.service.clone();
        service.ready().await.map_err(|_| Error::NotReady)?;
        service.call(notification_message(method, json!({}))).await?;
        Ok(())
    }

    fn capabilities(&self) -> Result<&ServerCapabilities, Error> {
        self.server_capabilities
            .as_ref()
            .ok_or(Error::NotInitialized)
    }
}

#[async_trait::async_trait]
impl<T> McpClientTrait for McpClient<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    async fn initialize(
        &mut self,
        info: ClientInfo,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResult, Error> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_info: info,
            capabilities,
        };
        let result: InitializeResult = self
            .send_request("initialize", serde_json::to_value(params)?)
            .await?;

        self.send_notification("notifications/initialized").await?;

        self.server_capabilities = Some(result.capabilities.clone());
        self.server_info = Some(result.server_info.clone());

        Ok(result)
    }

    async fn list_tools(&self, next_cursor: Option<String>) -> Result<ListToolsResult, Error> {
        if self.capabilities()?.tools.is_none() {
            return Ok(ListToolsResult {
                tools: vec![],
                next_cursor: None,
            });
        }

        let payload = next_cursor
            .map(|cursor| json!({"cursor": cursor}))
            .unwrap_or_else(|| json!({}));

        self.send_request("tools/list", payload).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, Error> {
        if self.capabilities()?.tools.is_none() {
            return Err(Error::RpcError {
                code: ErrorCode::METHOD_NOT_FOUND.0,
                message: "Server does not support 'tools' capability".to_string(),
            });
        }

        let params = json!({ "name": name, "arguments": arguments });
        self.send_request("tools/call", params).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await?;
        Ok(())
    }
}
