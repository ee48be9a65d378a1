use async_trait::async_trait;
use rmcp::model::{
    JsonObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcVersion2_0,
    Notification, Request, RequestId,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub type BoxError = Box<dyn std::error::Error + Sync + Send>;
/// A generic error type for transport operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport was not connected or is already closed")]
    NotConnected,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported message type. JsonRpcMessage can only be Request or Notification.")]
    UnsupportedMessage,

    #[error("SSE connection error: {0}")]
    SseConnection(String),

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("Streamable HTTP error: {0}")]
    StreamableHttpError(String),

    #[error("Session error: {0}")]
    SessionError(String),
}

impl Error {
    /// Errors after which the connection cannot carry further requests.
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            Error::NotConnected | Error::ChannelClosed | Error::Closed(_) | Error::SessionError(_)
        )
    }
}

/// Messages delivered from a transport to the client's receive loop.
pub type TransportMessageRecv = JsonRpcMessage;

/// A generic asynchronous transport trait with channel-based communication
#[async_trait]
pub trait Transport {
    type Handle: TransportHandle;

    /// Start the transport and establish the underlying connection.
    /// Returns the transport handle for sending messages.
    async fn start(&self) -> Result<Self::Handle, Error>;
}

#[async_trait]
pub trait TransportHandle: Send + Sync + Clone + 'static {
    async fn send(&self, message: JsonRpcMessage) -> Result<(), Error>;
    async fn receive(&self) -> Result<JsonRpcMessage, Error>;

    /// Stop the background actor and release the remote session, if any.
    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

fn params_object(params: Value) -> JsonObject {
    match params {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}

/// A request envelope with a numeric id. Non-object params are sent as `{}`.
pub fn request_message(id: u32, method: &str, params: Value) -> JsonRpcMessage {
    JsonRpcMessage::Request(JsonRpcRequest {
        jsonrpc: JsonRpcVersion2_0,
        id: RequestId::Number(id),
        request: Request {
            method: method.to_string(),
            params: params_object(params),
            extensions: Default::default(),
        },
    })
}

pub fn notification_message(method: &str, params: Value) -> JsonRpcMessage {
    JsonRpcMessage::Notification(JsonRpcNotification {
        jsonrpc: JsonRpcVersion2_0,
        notification: Notification {
            method: method.to_string(),
            params: params_object(params),
            extensions: Default::default(),
        },
    })
}

/// The request id a response or error answers.
pub fn response_id(message: &JsonRpcMessage) -> Option<RequestId> {
    match message {
        JsonRpcMessage::Response(response) => Some(response.id.clone()),
        JsonRpcMessage::Error(error) => Some(error.id.clone()),
        _ => None,
    }
}

pub async fn serialize_and_send(
    sender: &mpsc::Sender<String>,
    message: JsonRpcMessage,
) -> Result<(), Error> {
    match serde_json::to_string(&message).map_err(Error::Serialization) {
        Ok(msg) => sender.send(msg).await.map_err(|_| Error::ChannelClosed),
        Err(e) => {
            tracing::error!(error = ?e, "Error serializing message");
            Err(e)
        }
    }
}

pub mod sse;
pub use sse::SseTransport;

pub mod streamable_http;
pub use streamable_http::StreamableHttpTransport;
