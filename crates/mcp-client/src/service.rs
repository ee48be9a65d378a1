use futures::future::BoxFuture;
use rmcp::model::{JsonRpcMessage, JsonRpcRequest, RequestId};
use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, RwLock};
use tower::Service;

use crate::transport::{Error, TransportHandle, TransportMessageRecv};

/// A wrapper service that implements Tower's Service trait for MCP transport
#[derive(Clone)]
pub struct McpService<T: TransportHandle> {
    inner: Arc<T>,
    pending_requests: Arc<PendingRequests>,
}

impl<T: TransportHandle> McpService<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(transport),
            pending_requests: Arc::new(PendingRequests::default()),
        }
    }

    pub async fn respond(&self, id: RequestId, response: Result<TransportMessageRecv, Error>) {
        self.pending_requests.respond(id, response).await
    }

    /// Fail every in-flight request with the error that ended the transport.
    pub async fn hangup(&self, error: Error) {
        self.pending_requests.broadcast_close(error).await
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }
}

impl<T> Service<JsonRpcMessage> for McpService<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    type Response = Option<TransportMessageRecv>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: JsonRpcMessage) -> Self::Future {
        let transport = self.inner.clone();
        let pending_requests = self.pending_requests.clone();

        Box::pin(async move {
            match &request {
                JsonRpcMessage::Request(JsonRpcRequest { id, .. }) => {
                    let id = id.clone();
                    let (sender, receiver) = oneshot::channel();
                    pending_requests.insert(id.clone(), sender).await;

                    if let Err(e) = transport.send(request).await {
                        pending_requests.remove(&id).await;
                        return Err(e);
                    }
                    receiver.await.map_err(|_| Error::ChannelClosed)?.map(Some)
                }
                JsonRpcMessage::Notification(_) => {
                    // Notifications have no response
                    transport.send(request).await?;
                    Ok(None)
                }
                _ => Err(Error::UnsupportedMessage),
            }
        })
    }
}

type ResponseSender = oneshot::Sender<Result<TransportMessageRecv, Error>>;

/// In-flight requests and the channels their responses are routed to.
#[derive(Default)]
pub struct PendingRequests {
    requests: RwLock<HashMap<RequestId, ResponseSender>>,
}

impl PendingRequests {
    pub async fn insert(&self, id: RequestId, sender: ResponseSender) {
        self.requests.write().await.insert(id, sender);
    }

    pub async fn remove(&self, id: &RequestId) {
        self.requests.write().await.remove(id);
    }

    pub async fn respond(&self, id: RequestId, response: Result<TransportMessageRecv, Error>) {
        if let Some(tx) = self.requests.write().await.remove(&id) {
            let _ = tx.send(response);
        }
    }

    pub async fn broadcast_close(&self, error: Error) {
        let reason = error.to_string();
        for (_, tx) in self.requests.write().await.drain() {
            let _ = tx.send(Err(Error::Closed(reason.clone())));
        }
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
