use crate::transport::Error;
use async_trait::async_trait;
use eventsource_client::{Client, SSE};
use futures::TryStreamExt;
use rmcp::model::JsonRpcMessage;
use reqwest::Client as HttpClient;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::{serialize_and_send, Transport, TransportHandle};

// Timeout for the endpoint discovery
const ENDPOINT_TIMEOUT_SECS: u64 = 5;

type Inbound = Result<JsonRpcMessage, Error>;

/// The SSE-based actor that continuously:
/// - Reads incoming events from the SSE stream.
/// - Sends outgoing messages via HTTP POST (once the post endpoint is known).
pub struct SseActor {
    receiver: mpsc::Receiver<String>,
    sender: mpsc::Sender<Inbound>,
    sse_url: String,
    headers: BTreeMap<String, String>,
    http_client: HttpClient,
    /// The discovered endpoint for POST requests (once "endpoint" SSE event arrives)
    post_endpoint: Arc<RwLock<Option<String>>>,
    shutdown: CancellationToken,
}

impl SseActor {
    fn new(
        receiver: mpsc::Receiver<String>,
        sender: mpsc::Sender<Inbound>,
        sse_url: String,
        headers: BTreeMap<String, String>,
        post_endpoint: Arc<RwLock<Option<String>>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            sender,
            sse_url,
            headers,
            http_client: HttpClient::new(),
            post_endpoint,
            shutdown,
        }
    }

    /// Runs the incoming (SSE events) and outgoing (POST) loops until either ends
    /// or the handle is closed.
    pub async fn run(self) {
        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.cancelled() => debug!("SseActor closed"),
            _ = Self::handle_incoming_messages(
                self.sender.clone(),
                self.sse_url.clone(),
                self.headers.clone(),
                Arc::clone(&self.post_endpoint),
            ) => {
                let _ = self
                    .sender
                    .send(Err(Error::Closed("SSE stream ended".to_string())))
                    .await;
            }
            _ = Self::handle_outgoing_messages(
                self.receiver,
                self.http_client.clone(),
                self.headers.clone(),
                Arc::clone(&self.post_endpoint),
            ) => {}
        }
        debug!("SseActor shut down");
    }

    /// Reads SSE events from `sse_url`: the first `endpoint` event sets the POST
    /// URL, every later `message` event is parsed as a JSON-RPC message.
    async fn handle_incoming_messages(
        sender: mpsc::Sender<Inbound>,
        sse_url: String,
        headers: BTreeMap<String, String>,
        post_endpoint: Arc<RwLock<Option<String>>>,
    ) {
        let client = match build_event_source(&sse_url, &headers) {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to connect SSE client: {}", e);
                return;
            }
        };
        let mut stream = client.stream();

        while let Ok(Some(event)) = stream.try_next().await {
            match event {
                SSE::Event(e) if e.event_type == "endpoint" => {
                    let post_url = match Url::parse(&sse_url).and_then(|base| base.join(&e.data))
                    {
                        Ok(url) => url,
                        Err(err) => {
                            warn!("Invalid SSE endpoint event {:?}: {}", e.data, err);
                            return;
                        }
                    };
                    debug!("Discovered SSE POST endpoint: {}", post_url);
                    *post_endpoint.write().await = Some(post_url.to_string());
                    break;
                }
                _ => continue,
            }
        }

        loop {
            match stream.try_next().await {
                Ok(Some(SSE::Event(e))) if e.event_type == "message" => {
                    match serde_json::from_str::<JsonRpcMessage>(&e.data) {
                        Ok(message) => {
                            let _ = sender.send(Ok(message)).await;
                        }
                        Err(err) => warn!("Failed to parse SSE message: {err}"),
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!("SSE stream ended");
                    break;
                }
                Err(e) => {
                    warn!("Error reading SSE stream: {e}");
                    break;
                }
            }
        }
    }

    async fn handle_outgoing_messages(
        mut receiver: mpsc::Receiver<String>,
        http_client: HttpClient,
        headers: BTreeMap<String, String>,
        post_endpoint: Arc<RwLock<Option<String>>>,
    ) {
        while let Some(message_str) = receiver.recv().await {
            let Some(post_url) = post_endpoint.read().await.clone() else {
                warn!("Dropping message sent before the SSE endpoint was discovered");
                continue;
            };

            let mut request = http_client
                .post(&post_url)
                .header("Content-Type", "application/json")
                .body(message_str);
            for (key, value) in &headers {
                request = request.header(key, value);
            }

            // Responses arrive over the event stream, so a failed POST is only logged
            match request.send().await {
                Ok(resp) if !resp.status().is_success() => {
                    let err = Error::HttpError {
                        status: resp.status().as_u16(),
                        message: resp.status().to_string(),
                    };
                    warn!("HTTP request returned error: {err}");
                }
                Ok(_) => {}
                Err(e) => warn!("HTTP POST failed: {e}"),
            }
        }
    }
}

fn build_event_source(
    sse_url: &str,
    headers: &BTreeMap<String, String>,
) -> Result<impl Client, eventsource_client::Error> {
    let mut builder = eventsource_client::ClientBuilder::for_url(sse_url)?;
    for (key, value) in headers {
        builder = builder.header(key, value)?;
    }
    Ok(builder.build())
}

#[derive(Clone)]
pub struct SseTransportHandle {
    sender: mpsc::Sender<String>,
    receiver: Arc<Mutex<mpsc::Receiver<Inbound>>>,
    shutdown: CancellationToken,
}

#[async_trait]
impl TransportHandle for SseTransportHandle {
    async fn send(&self, message: JsonRpcMessage) -> Result<(), Error> {
        serialize_and_send(&self.sender, message).await
    }

    async fn receive(&self) -> Result<JsonRpcMessage, Error> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.unwrap_or(Err(Error::ChannelClosed))
    }

    async fn close(&self) -> Result<(), Error> {
        self.shutdown.cancel();
        Ok(())
    }
}

#[derive(Clone)]
pub struct SseTransport {
    sse_url: String,
    headers: BTreeMap<String, String>,
}

/// The SSE transport spawns an `SseActor` on `start()`.
impl SseTransport {
    pub fn new<S: Into<String>>(sse_url: S) -> Self {
        Self::with_headers(sse_url, BTreeMap::new())
    }

    pub fn with_headers<S: Into<String>>(sse_url: S, headers: BTreeMap<String, String>) -> Self {
        Self {
            sse_url: sse_url.into(),
            headers,
        }
    }

    /// Polls until the actor has discovered the POST endpoint.
    async fn wait_for_endpoint(post_endpoint: Arc<RwLock<Option<String>>>) -> String {
        let check_interval = Duration::from_millis(100);
        loop {
            if let Some(url) = post_endpoint.read().await.clone() {
                return url;
            }
            tokio::time::sleep(check_interval).await;
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    type Handle = SseTransportHandle;

    async fn start(&self) -> Result<Self::Handle, Error> {
        let (tx, rx) = mpsc::channel(32);
        let (otx, orx) = mpsc::channel(32);
        let post_endpoint: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
        let shutdown = CancellationToken::new();

        let actor = SseActor::new(
            rx,
            otx,
            self.sse_url.clone(),
            self.headers.clone(),
            Arc::clone(&post_endpoint),
            shutdown.clone(),
        );
        tokio::spawn(actor.run());

        match timeout(
            Duration::from_secs(ENDPOINT_TIMEOUT_SECS),
            Self::wait_for_endpoint(post_endpoint),
        )
        .await
        {
            Ok(url) => {
                debug!(endpoint = %url, "SSE transport ready");
                Ok(SseTransportHandle {
                    sender: tx,
                    receiver: Arc::new(Mutex::new(orx)),
                    shutdown,
                })
            }
            Err(_) => {
                shutdown.cancel();
                Err(Error::SseConnection(format!(
                    "No endpoint discovered at {} within {}s",
                    self.sse_url, ENDPOINT_TIMEOUT_SECS
                )))
            }
        }
    }
}
