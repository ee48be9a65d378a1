//! In-process stand-ins for backends and tool servers, for tests and embedders
//! that want to exercise the gateway without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mcp_client::client::{ClientCapabilities, ClientInfo, Error as ClientError, McpClientTrait};
use mcp_client::pool::{Connector, ServerConfig, TransportKind};
use mcp_client::transport::Error as TransportError;
use rmcp::model::{
    CallToolResult, Content, ErrorCode, Implementation, InitializeResult, ListToolsResult,
    ProtocolVersion, ServerCapabilities, Tool,
};
use serde_json::Value;

use crate::model::ModelConfig;
use crate::providers::tool_calls::ToolCallDelta;
use crate::providers::{
    Completion, Endpoint, EndpointConfig, EndpointParams, EventStream, GenerationEvent,
    OpenAiEndpointConfig, ProviderError, ProviderMetadata, Token,
};

/// One scripted response of a [`ScriptedEndpoint`].
#[derive(Debug, Clone)]
pub enum ScriptedRound {
    Events(Vec<GenerationEvent>),
    Fail(String),
}

impl ScriptedRound {
    /// A plain answer streamed as one token per whitespace-separated word.
    pub fn text(text: &str) -> Self {
        let mut events: Vec<GenerationEvent> = text
            .split_inclusive(' ')
            .enumerate()
            .map(|(i, piece)| GenerationEvent::Token(Token::text(i as u32, piece)))
            .collect();
        events.push(GenerationEvent::Final {
            token: Some(Token::special(events.len() as u32, "")),
            generated_text: text.to_string(),
        });
        ScriptedRound::Events(events)
    }

    /// A round that only requests tools. Each call is `(id, name, arguments)`;
    /// an empty name streams the call without one.
    pub fn tool_calls(calls: &[(Option<&str>, &str, &str)]) -> Self {
        let mut events: Vec<GenerationEvent> = calls
            .iter()
            .enumerate()
            .map(|(index, (id, name, arguments))| {
                GenerationEvent::ToolCallDelta(ToolCallDelta {
                    index,
                    id: id.map(str::to_string),
                    name: (!name.is_empty()).then(|| name.to_string()),
                    arguments: Some(arguments.to_string()),
                })
            })
            .collect();
        events.push(GenerationEvent::Final {
            token: Some(Token::special(0, "")),
            generated_text: String::new(),
        });
        ScriptedRound::Events(events)
    }

    pub fn with_metadata(self, provider: &str) -> Self {
        match self {
            ScriptedRound::Events(mut events) => {
                events.insert(
                    0,
                    GenerationEvent::Metadata(ProviderMetadata {
                        model: None,
                        provider: Some(provider.to_string()),
                    }),
                );
                ScriptedRound::Events(events)
            }
            fail => fail,
        }
    }
}

/// An endpoint that replays scripted rounds in order and records every request.
pub struct ScriptedEndpoint {
    model: ModelConfig,
    rounds: Mutex<VecDeque<ScriptedRound>>,
    completions: Mutex<VecDeque<Completion>>,
    requests: Mutex<Vec<EndpointParams>>,
    completion_requests: AtomicUsize,
}

impl ScriptedEndpoint {
    pub fn new(id: &str) -> Self {
        Self::with_model(ModelConfig::new(
            id,
            EndpointConfig::OpenAi(OpenAiEndpointConfig::default()),
        ))
    }

    pub fn with_model(model: ModelConfig) -> Self {
        ScriptedEndpoint {
            model,
            rounds: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            completion_requests: AtomicUsize::new(0),
        }
    }

    pub fn then(self, round: ScriptedRound) -> Self {
        self.rounds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(round);
        self
    }

    pub fn then_complete(self, completion: Completion) -> Self {
        self.completions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(completion);
        self
    }

    /// Streaming requests received so far.
    pub fn requests(&self) -> Vec<EndpointParams> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn completion_requests(&self) -> usize {
        self.completion_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Endpoint for ScriptedEndpoint {
    fn model(&self) -> &ModelConfig {
        &self.model
    }

    async fn stream(&self, params: EndpointParams) -> Result<EventStream, ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(params);
        let round = self
            .rounds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match round {
            Some(ScriptedRound::Events(events)) => {
                Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
            }
            Some(ScriptedRound::Fail(message)) => Err(ProviderError::ServerError(message)),
            None => Err(ProviderError::ExecutionError(format!(
                "no scripted round left for {}",
                self.model.id
            ))),
        }
    }

    async fn complete(&self, _params: EndpointParams) -> Result<Completion, ProviderError> {
        self.completion_requests.fetch_add(1, Ordering::SeqCst);
        self.completions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| ProviderError::ServerError("no scripted completion".to_string()))
    }
}

/// How a [`StaticToolServer`] answers one tool.
#[derive(Debug, Clone)]
pub struct ToolBehavior {
    pub delay: Duration,
    pub result: Result<CallToolResult, String>,
}

impl ToolBehavior {
    pub fn text(text: &str) -> Self {
        ToolBehavior {
            delay: Duration::ZERO,
            result: Ok(CallToolResult::success(vec![Content::text(text)])),
        }
    }

    pub fn error(message: &str) -> Self {
        ToolBehavior {
            delay: Duration::ZERO,
            result: Err(message.to_string()),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A tool server living in memory.
#[derive(Default)]
pub struct StaticToolServer {
    tools: Vec<Tool>,
    behaviors: HashMap<String, ToolBehavior>,
    calls: Mutex<Vec<(String, Value)>>,
    closed_failures: AtomicUsize,
    closes: AtomicUsize,
}

impl StaticToolServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Tool, behavior: ToolBehavior) -> Self {
        self.behaviors.insert(tool.name.to_string(), behavior);
        self.tools.push(tool);
        self
    }

    /// Fail the next `n` calls as if the connection had been closed.
    pub fn failing_closed(self, n: usize) -> Self {
        self.closed_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpClientTrait for StaticToolServer {
    async fn initialize(
        &mut self,
        _info: ClientInfo,
        _capabilities: ClientCapabilities,
    ) -> Result<InitializeResult, ClientError> {
        Ok(InitializeResult {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "static".to_string(),
                version: "0".to_string(),
            },
            instructions: None,
        })
    }

    async fn list_tools(&self, _next_cursor: Option<String>) -> Result<ListToolsResult, ClientError> {
        Ok(ListToolsResult {
            tools: self.tools.clone(),
            next_cursor: None,
        })
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, ClientError> {
        let closed = self
            .closed_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if closed {
            return Err(ClientError::Transport(TransportError::Closed(
                "connection reset".to_string(),
            )));
        }

        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.to_string(), arguments));
        let behavior = self.behaviors.get(name).cloned().ok_or_else(|| ClientError::RpcError {
            code: ErrorCode::METHOD_NOT_FOUND.0,
            message: format!("no tool named {}", name),
        })?;
        if !behavior.delay.is_zero() {
            tokio::time::sleep(behavior.delay).await;
        }
        behavior.result.map_err(|message| ClientError::RpcError {
            code: ErrorCode::INTERNAL_ERROR.0,
            message,
        })
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connects pool entries to in-memory servers by URL.
#[derive(Default)]
pub struct StaticConnector {
    servers: HashMap<String, Arc<StaticToolServer>>,
    connects: AtomicUsize,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, url: &str, server: Arc<StaticToolServer>) -> Self {
        self.servers.insert(url.to_string(), server);
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(
        &self,
        server: &ServerConfig,
        _transport: TransportKind,
    ) -> Result<Arc<dyn McpClientTrait>, ClientError> {
        let found = self.servers.get(&server.url).cloned().ok_or_else(|| {
            ClientError::Transport(TransportError::HttpError {
                status: 404,
                message: format!("no server at {}", server.url),
            })
        })?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(found)
    }
}
