use crate::transport::Error;
use async_trait::async_trait;
use futures::StreamExt;
use rmcp::model::{
    ErrorCode, ErrorData, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcVersion2_0,
};
use reqwest::Client as HttpClient;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Duration;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use super::{serialize_and_send, Transport, TransportHandle};
use crate::client::PROTOCOL_VERSION;

// Default timeout for HTTP requests
const HTTP_TIMEOUT_SECS: u64 = 30;

type Inbound = Result<JsonRpcMessage, Error>;

/// The Streamable HTTP transport actor that handles:
/// - HTTP POST requests to send messages to the server
/// - Optional streaming responses carrying one or more JSON-RPC messages
/// - Session management with session IDs
pub struct StreamableHttpActor {
    /// Receives messages (requests/notifications) from the handle
    receiver: mpsc::Receiver<String>,
    /// Sends messages (responses) back to the handle
    sender: mpsc::Sender<Inbound>,
    /// MCP endpoint URL
    mcp_endpoint: String,
    http_client: HttpClient,
    /// Optional session ID for stateful connections
    session_id: Arc<RwLock<Option<String>>>,
    /// Custom headers to include in requests
    headers: BTreeMap<String, String>,
    shutdown: CancellationToken,
}

impl StreamableHttpActor {
    fn new(
        receiver: mpsc::Receiver<String>,
        sender: mpsc::Sender<Inbound>,
        mcp_endpoint: String,
        http_client: HttpClient,
        session_id: Arc<RwLock<Option<String>>>,
        headers: BTreeMap<String, String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            sender,
            mcp_endpoint,
            http_client,
            session_id,
            headers,
            shutdown,
        }
    }

    /// Main entry point for the actor
    pub async fn run(mut self) {
        loop {
            let message_str = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.receiver.recv() => match next {
                    Some(message_str) => message_str,
                    None => break,
                },
            };

            if let Err(e) = self.handle_outgoing_message(message_str).await {
                error!("Streamable HTTP connection failed: {}", e);
                let _ = self.sender.send(Err(e)).await;
                break;
            }
        }

        debug!("StreamableHttpActor shut down");
    }

    /// Send one outgoing message. Request-scoped HTTP failures are answered with
    /// a JSON-RPC error for that request; connection-level failures end the actor.
    async fn handle_outgoing_message(&mut self, message_str: String) -> Result<(), Error> {
        debug!("Sending message to MCP endpoint: {}", message_str);

        let parsed_message: JsonRpcMessage =
            serde_json::from_str(&message_str).map_err(Error::Serialization)?;

        let request_id = match parsed_message {
            JsonRpcMessage::Request(JsonRpcRequest { id, .. }) => Some(id),
            _ => None,
        };

        match self.send_request(&message_str, request_id.is_some()).await {
            Ok(()) => Ok(()),
            Err(Error::HttpError { status, message }) => {
                warn!(status, "MCP endpoint rejected request: {}", message);
                if let Some(id) = request_id {
                    let error = JsonRpcMessage::Error(JsonRpcError {
                        jsonrpc: JsonRpcVersion2_0,
                        id,
                        error: ErrorData {
                            code: ErrorCode::INTERNAL_ERROR,
                            message: format!("HTTP error: {} - {}", status, message).into(),
                            data: None,
                        },
                    });
                    let _ = self.sender.send(Ok(error)).await;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn send_request(&mut self, message_str: &str, expects_response: bool) -> Result<(), Error> {
        let mut request = self
            .http_client
            .post(&self.mcp_endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .body(message_str.to_string());

        if let Some(session_id) = self.session_id.read().await.as_ref() {
            request = request.header("Mcp-Session-Id", session_id);
        }

        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Closed(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            if status.as_u16() == 404 {
                // Session not found - clear our session ID
                *self.session_id.write().await = None;
                return Err(Error::SessionError(
                    "Session expired or not found".to_string(),
                ));
            }
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::HttpError {
                status: status.as_u16(),
                message: error_text,
            });
        }

        if let Some(session_id_header) = response.headers().get("Mcp-Session-Id") {
            if let Ok(session_id) = session_id_header.to_str() {
                debug!("Received session ID: {}", session_id);
                *self.session_id.write().await = Some(session_id.to_string());
            }
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            if expects_response {
                self.handle_streaming_response(response).await;
            }
        } else if content_type.starts_with("application/json") || expects_response {
            let response_text = response.text().await.map_err(|e| {
                Error::StreamableHttpError(format!("Failed to read response: {}", e))
            })?;

            if !response_text.is_empty() {
                let json_message: JsonRpcMessage =
                    serde_json::from_str(&response_text).map_err(Error::Serialization)?;
                let _ = self.sender.send(Ok(json_message)).await;
            }
        }
        // Notifications are acknowledged with 202 and no body

        Ok(())
    }

    /// Forward each `data:` event of a streamed POST response as a JSON-RPC message.
    async fn handle_streaming_response(&mut self, response: reqwest::Response) {
        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other));
        let reader = StreamReader::new(stream);
        let mut lines = tokio::io::BufReader::new(reader).lines();

        let mut event_data = String::new();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading streamed response: {}", e);
                    break;
                }
            };

            if line.is_empty() {
                self.flush_event(&mut event_data).await;
            } else if let Some(field_data) = line.strip_prefix("data:") {
                if !event_data.is_empty() {
                    event_data.push('\n');
                }
                event_data.push_str(field_data.trim_start());
            }
            // event, id and retry fields carry nothing we route on
        }
        self.flush_event(&mut event_data).await;
    }

    async fn flush_event(&self, event_data: &mut String) {
        if event_data.is_empty() {
            return;
        }
        match serde_json::from_str::<JsonRpcMessage>(event_data) {
            Ok(message) => {
                let _ = self.sender.send(Ok(message)).await;
            }
            Err(err) => warn!("Failed to parse streamed message: {}", err),
        }
        event_data.clear();
    }
}

#[derive(Clone)]
pub struct StreamableHttpTransportHandle {
    sender: mpsc::Sender<String>,
    receiver: Arc<Mutex<mpsc::Receiver<Inbound>>>,
    session_id: Arc<RwLock<Option<String>>>,
    mcp_endpoint: String,
    http_client: HttpClient,
    headers: BTreeMap<String, String>,
    shutdown: CancellationToken,
}

#[async_trait]
impl TransportHandle for StreamableHttpTransportHandle {
    async fn send(&self, message: JsonRpcMessage) -> Result<(), Error> {
        serialize_and_send(&self.sender, message).await
    }

    async fn receive(&self) -> Result<JsonRpcMessage, Error> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.unwrap_or(Err(Error::ChannelClosed))
    }

    async fn close(&self) -> Result<(), Error> {
        self.terminate_session().await;
        self.shutdown.cancel();
        Ok(())
    }
}

impl StreamableHttpTransportHandle {
    /// Terminate the session with an HTTP DELETE, if one was established.
    async fn terminate_session(&self) {
        let Some(session_id) = self.session_id.read().await.clone() else {
            return;
        };

        let mut request = self
            .http_client
            .delete(&self.mcp_endpoint)
            .header("Mcp-Session-Id", session_id)
            .header("MCP-Protocol-Version", PROTOCOL_VERSION);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        match request.send().await {
            Ok(response) if response.status().as_u16() == 405 => {
                debug!("Server doesn't support session termination");
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to terminate session: {}", e),
        }
    }
}

#[derive(Clone)]
pub struct StreamableHttpTransport {
    mcp_endpoint: String,
    headers: BTreeMap<String, String>,
}

impl StreamableHttpTransport {
    pub fn new<S: Into<String>>(mcp_endpoint: S) -> Self {
        Self::with_headers(mcp_endpoint, BTreeMap::new())
    }

    pub fn with_headers<S: Into<String>>(
        mcp_endpoint: S,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            mcp_endpoint: mcp_endpoint.into(),
            headers,
        }
    }

    /// Validate that the URL is a valid MCP endpoint
    pub fn validate_endpoint(endpoint: &str) -> Result<(), Error> {
        Url::parse(endpoint)
            .map_err(|e| Error::StreamableHttpError(format!("Invalid MCP endpoint URL: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    type Handle = StreamableHttpTransportHandle;

    async fn start(&self) -> Result<Self::Handle, Error> {
        Self::validate_endpoint(&self.mcp_endpoint)?;

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::StreamableHttpError(e.to_string()))?;

        let (tx, rx) = mpsc::channel(32);
        let (otx, orx) = mpsc::channel(32);
        let session_id: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
        let shutdown = CancellationToken::new();

        let actor = StreamableHttpActor::new(
            rx,
            otx,
            self.mcp_endpoint.clone(),
            http_client.clone(),
            Arc::clone(&session_id),
            self.headers.clone(),
            shutdown.clone(),
        );
        tokio::spawn(actor.run());

        Ok(StreamableHttpTransportHandle {
            sender: tx,
            receiver: Arc::new(Mutex::new(orx)),
            session_id,
            mcp_endpoint: self.mcp_endpoint.clone(),
            http_client,
            headers: self.headers.clone(),
            shutdown,
        })
    }
}
