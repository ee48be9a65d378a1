//! Connection pool for tool servers.
//!
//! At most one live client exists per [`PoolKey`], i.e. per server URL and header set.
//! Clients connect lazily over streamable HTTP, falling back to SSE, and live until
//! they are evicted after a transport failure or the pool is drained at the end of a turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{ClientCapabilities, ClientInfo, Error, McpClient, McpClientTrait};
use crate::transport::{SseTransport, StreamableHttpTransport, Transport};

/// A configured tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ServerConfig {
    pub fn new<N: Into<String>, U: Into<String>>(name: N, url: U) -> Self {
        ServerConfig {
            name: name.into(),
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> PoolKey {
        PoolKey::new(&self.url, &self.headers)
    }
}

/// Connection identity: the URL plus the header pairs sorted by lower-cased name.
///
/// Headers are part of the key so that clients carrying different credentials
/// are never shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    url: String,
    headers: Vec<(String, String)>,
}

impl PoolKey {
    pub fn new(url: &str, headers: &BTreeMap<String, String>) -> Self {
        let mut headers: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        headers.sort();
        PoolKey {
            url: url.trim().to_string(),
            headers,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    StreamableHttp,
    Sse,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to connect to tool server '{server}' at {url}: {primary} (SSE fallback: {fallback})")]
    Connect {
        server: String,
        url: String,
        #[source]
        primary: Error,
        fallback: Error,
    },
}

/// Opens an initialized client over one transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        server: &ServerConfig,
        transport: TransportKind,
    ) -> Result<Arc<dyn McpClientTrait>, Error>;
}

/// Connects over the network using the real transports.
pub struct HttpConnector {
    client_info: ClientInfo,
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Self {
        HttpConnector {
            client_info: ClientInfo::default(),
            request_timeout,
        }
    }

    async fn initialize<C: McpClientTrait + 'static>(
        &self,
        mut client: C,
    ) -> Result<Arc<dyn McpClientTrait>, Error> {
        match client
            .initialize(self.client_info.clone(), ClientCapabilities::default())
            .await
        {
            Ok(result) => {
                debug!(server = %result.server_info.name, "tool server initialized");
                Ok(Arc::new(client))
            }
            Err(e) => {
                let _ = client.close().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        server: &ServerConfig,
        transport: TransportKind,
    ) -> Result<Arc<dyn McpClientTrait>, Error> {
        match transport {
            TransportKind::StreamableHttp => {
                let handle =
                    StreamableHttpTransport::with_headers(&server.url, server.headers.clone())
                        .start()
                        .await?;
                let client = McpClient::connect(handle, self.request_timeout).await?;
                self.initialize(client).await
            }
            TransportKind::Sse => {
                let handle = SseTransport::with_headers(&server.url, server.headers.clone())
                    .start()
                    .await?;
                let client = McpClient::connect(handle, self.request_timeout).await?;
                self.initialize(client).await
            }
        }
    }
}

pub struct ToolClientPool {
    connector: Arc<dyn Connector>,
    clients: Mutex<HashMap<PoolKey, Arc<dyn McpClientTrait>>>,
}

impl ToolClientPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        ToolClientPool {
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn http(request_timeout: Duration) -> Self {
        Self::new(Arc::new(HttpConnector::new(request_timeout)))
    }

    /// Return the pooled client for `server`, connecting if there is none.
    pub async fn get(&self, server: &ServerConfig) -> Result<Arc<dyn McpClientTrait>, PoolError> {
        let key = server.key();
        if let Some(client) = self.lookup(&key) {
            return Ok(client);
        }

        let client = self.connect(server).await?;

        // Another caller may have connected the same key while we were connecting
        let (client, duplicate) = {
            let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
            match clients.get(&key) {
                Some(existing) => (Arc::clone(existing), Some(client)),
                None => {
                    clients.insert(key, Arc::clone(&client));
                    (client, None)
                }
            }
        };
        if let Some(duplicate) = duplicate {
            let _ = duplicate.close().await;
        }
        Ok(client)
    }

    /// Remove the client for `server` without closing it.
    pub fn evict(&self, server: &ServerConfig) -> Option<Arc<dyn McpClientTrait>> {
        let evicted = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&server.key());
        if evicted.is_some() {
            debug!(server = %server.name, "evicted pooled tool client");
        }
        evicted
    }

    /// Close and remove every pooled client.
    pub async fn drain(&self) {
        let clients: Vec<_> = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (key, client) in clients {
            if let Err(e) = client.close().await {
                warn!(url = %key.url(), "failed to close tool client: {}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &PoolKey) -> Option<Arc<dyn McpClientTrait>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn McpClientTrait>, PoolError> {
        let primary = match self
            .connector
            .connect(server, TransportKind::StreamableHttp)
            .await
        {
            Ok(client) => return Ok(client),
            Err(e) => e,
        };

        info!(
            server = %server.name,
            "streamable HTTP connection failed ({}), falling back to SSE",
            primary
        );
        match self.connector.connect(server, TransportKind::Sse).await {
            Ok(client) => Ok(client),
            Err(fallback) => Err(PoolError::Connect {
                server: server.name.clone(),
                url: server.url.clone(),
                primary,
                fallback,
            }),
        }
    }
}
