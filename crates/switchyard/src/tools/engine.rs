//! The tool invocation engine: runs one round's tool calls concurrently and
//! reports their lifecycle as it happens.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, FuturesUnordered};
use futures::StreamExt;
use mcp_client::ToolClientPool;
use mcp_core::ToolError;
use rmcp::model::CallToolResult;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::hydrate::hydrate_arguments;
use super::registry::ToolCatalog;
use super::{result_text, ToolResult};
use crate::agents::types::{ToolUpdate, WebSource};
use crate::message::{FileRef, Message, ToolCall};

/// What happens to the turn when a tool call fails to execute. Calls naming an
/// unknown function always end the turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// End the turn, showing the error as the answer.
    #[default]
    Abort,
    /// Hand the error text back to the model as the call's result.
    Continue,
}

pub enum ToolRoundItem {
    Update(ToolUpdate),
    Finished(ToolRound),
}

/// All calls of one round with their outcomes, in the order the model issued them.
#[derive(Debug, Clone)]
pub struct ToolRound {
    pub calls: Vec<ToolCall>,
    pub outcomes: Vec<Result<ToolResult, ToolError>>,
}

impl ToolRound {
    /// The assistant message carrying the call intents.
    pub fn assistant_message(&self, content: &str) -> Message {
        Message::assistant(content).with_tool_calls(self.calls.clone())
    }

    /// The user-visible explanation when this round ends the turn.
    pub fn failure(&self, policy: ErrorPolicy) -> Option<String> {
        self.calls
            .iter()
            .zip(&self.outcomes)
            .find_map(|(call, outcome)| match outcome {
                Err(e) if e.is_resolution_failure() || policy == ErrorPolicy::Abort => {
                    Some(format!("Tool call `{}` failed: {}", call.name, e))
                }
                _ => None,
            })
    }

    /// One tool message per call that the conversation should carry forward.
    pub fn tool_messages(&self, policy: ErrorPolicy) -> Vec<Message> {
        self.calls
            .iter()
            .zip(&self.outcomes)
            .filter_map(|(call, outcome)| match (outcome, policy) {
                (Ok(result), _) => Some(Message::tool(&call.id, result.text.clone())),
                (Err(e), ErrorPolicy::Continue) => {
                    Some(Message::tool(&call.id, format!("Error: {}", e)))
                }
                (Err(_), ErrorPolicy::Abort) => None,
            })
            .collect()
    }

    pub fn results(&self) -> Vec<ToolResult> {
        self.outcomes
            .iter()
            .filter_map(|o| o.as_ref().ok())
            .cloned()
            .collect()
    }

    pub fn web_sources(&self) -> Vec<WebSource> {
        self.outcomes
            .iter()
            .filter_map(|o| o.as_ref().ok())
            .flat_map(ToolResult::web_sources)
            .collect()
    }
}

pub struct ToolEngine {
    pool: Arc<ToolClientPool>,
    call_timeout: Duration,
    eta_secs: u64,
}

impl ToolEngine {
    pub fn new(pool: Arc<ToolClientPool>, call_timeout: Duration, eta_secs: u64) -> Self {
        ToolEngine {
            pool,
            call_timeout,
            eta_secs,
        }
    }

    /// Execute `calls` concurrently. Call and eta updates come first, in the
    /// order given; results follow as calls complete; the last item is the
    /// collated round. Cancelling ends the stream without a `Finished` item.
    pub fn run<'a>(
        &'a self,
        calls: Vec<ToolCall>,
        catalog: &'a ToolCatalog,
        files: Vec<FileRef>,
        cancel: CancellationToken,
    ) -> BoxStream<'a, ToolRoundItem> {
        let stream = async_stream::stream! {
            for call in &calls {
                yield ToolRoundItem::Update(ToolUpdate::Call {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments(),
                });
                yield ToolRoundItem::Update(ToolUpdate::Eta {
                    id: call.id.clone(),
                    eta_secs: self.eta_secs,
                });
            }

            let file_refs: Vec<&FileRef> = files.iter().collect();
            let mut pending: FuturesUnordered<_> = calls
                .iter()
                .enumerate()
                .map(|(index, call)| {
                    let file_refs = &file_refs;
                    async move { (index, self.execute(call, catalog, file_refs).await) }
                })
                .collect();

            let mut outcomes: Vec<Option<Result<ToolResult, ToolError>>> =
                calls.iter().map(|_| None).collect();
            let mut cancelled = false;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = pending.next() => Some(item),
                };
                let (index, outcome) = match next {
                    None => {
                        debug!("tool round cancelled");
                        cancelled = true;
                        break;
                    }
                    Some(None) => break,
                    Some(Some(done)) => done,
                };
                let id = calls[index].id.clone();
                yield ToolRoundItem::Update(match &outcome {
                    Ok(result) => ToolUpdate::Result {
                        id,
                        text: result.text.clone(),
                        structured: result.structured.clone(),
                    },
                    Err(e) => ToolUpdate::Error {
                        id,
                        message: e.to_string(),
                    },
                });
                outcomes[index] = Some(outcome);
            }
            drop(pending);

            if !cancelled {
                let outcomes = outcomes
                    .into_iter()
                    .map(|o| {
                        o.unwrap_or_else(|| Err(ToolError::ExecutionError("no result".to_string())))
                    })
                    .collect();
                yield ToolRoundItem::Finished(ToolRound { calls, outcomes });
            }
        };
        stream.boxed()
    }

    #[tracing::instrument(skip_all, fields(call_id = %call.id, function = %call.name))]
    async fn execute(
        &self,
        call: &ToolCall,
        catalog: &ToolCatalog,
        files: &[&FileRef],
    ) -> Result<ToolResult, ToolError> {
        let mapping = catalog
            .resolve(&call.name)
            .ok_or_else(|| ToolError::NotFound(format!("unknown function `{}`", call.name)))?;
        let arguments = hydrate_arguments(call.arguments(), files);

        match tokio::time::timeout(
            self.call_timeout,
            self.call_with_retry(&mapping.server, &mapping.tool_name, arguments),
        )
        .await
        {
            Ok(result) => result.map(|r| ToolResult::from_call(&call.id, r)),
            Err(_) => Err(ToolError::Timeout(self.call_timeout.as_secs())),
        }
    }

    async fn call_with_retry(
        &self,
        server: &mcp_client::ServerConfig,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, ToolError> {
        let mut retried = false;
        loop {
            let client = self
                .pool
                .get(server)
                .await
                .map_err(|e| ToolError::ExecutionError(e.to_string()))?;

            match client.call_tool(tool_name, arguments.clone()).await {
                Ok(result) if result.is_error.unwrap_or(false) => {
                    let text = result_text(&result);
                    return Err(ToolError::ExecutionError(if text.is_empty() {
                        "the tool reported an error".to_string()
                    } else {
                        text
                    }));
                }
                Ok(result) => return Ok(result),
                Err(e) if e.is_connection_closed() && !retried => {
                    warn!(server = %server.name, "connection closed, retrying on a fresh one: {}", e);
                    if let Some(stale) = self.pool.evict(server) {
                        if let Err(e) = stale.close().await {
                            debug!(server = %server.name, "closing evicted client failed: {}", e);
                        }
                    }
                    retried = true;
                }
                Err(e) => return Err(ToolError::ExecutionError(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StaticConnector, StaticToolServer, ToolBehavior};
    use crate::tools::registry::ToolCatalog;
    use mcp_client::ServerConfig;
    use rmcp::model::Tool;
    use rmcp::object;
    use serde_json::json;

    const URL: &str = "http://tools.local/mcp";

    fn setup(server: StaticToolServer) -> (ToolEngine, ToolCatalog, Arc<StaticToolServer>) {
        let server = Arc::new(server);
        let connector = StaticConnector::new().with_server(URL, Arc::clone(&server));
        let pool = Arc::new(ToolClientPool::new(Arc::new(connector)));
        let config = ServerConfig::new("tools", URL);
        let tools = vec![
            Tool::new("a", "slow", object!({"type": "object"})),
            Tool::new("b", "fast", object!({"type": "object"})),
            Tool::new("c", "medium", object!({"type": "object"})),
            Tool::new("broken", "fails", object!({"type": "object"})),
        ];
        let catalog = ToolCatalog::from_listings(vec![(config, tools)]);
        (
            ToolEngine::new(pool, Duration::from_secs(5), 10),
            catalog,
            server,
        )
    }

    fn abc_server() -> StaticToolServer {
        StaticToolServer::new()
            .with_tool(
                Tool::new("a", "slow", object!({})),
                ToolBehavior::text("A").after(Duration::from_millis(300)),
            )
            .with_tool(
                Tool::new("b", "fast", object!({})),
                ToolBehavior::text("B"),
            )
            .with_tool(
                Tool::new("c", "medium", object!({})),
                ToolBehavior::text("C").after(Duration::from_millis(100)),
            )
            .with_tool(Tool::new("broken", "fails", object!({})), ToolBehavior::error("boom"))
    }

    async fn collect(stream: BoxStream<'_, ToolRoundItem>) -> (Vec<ToolUpdate>, Option<ToolRound>) {
        let mut updates = Vec::new();
        let mut round = None;
        let items: Vec<_> = stream.collect().await;
        for item in items {
            match item {
                ToolRoundItem::Update(u) => updates.push(u),
                ToolRoundItem::Finished(r) => round = Some(r),
            }
        }
        (updates, round)
    }

    fn calls(names: &[&str]) -> Vec<ToolCall> {
        names
            .iter()
            .map(|n| ToolCall::new(format!("call_{}", n), *n, "{}"))
            .collect()
    }

    #[tokio::test]
    async fn test_results_are_collated_in_call_order() {
        let (engine, catalog, _) = setup(abc_server());
        let (updates, round) =
            collect(engine.run(calls(&["a", "b", "c"]), &catalog, vec![], CancellationToken::new())).await;

        let completion_order: Vec<_> = updates
            .iter()
            .filter_map(|u| match u {
                ToolUpdate::Result { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(completion_order, vec!["call_b", "call_c", "call_a"]);

        assert!(matches!(&updates[0], ToolUpdate::Call { id, .. } if id == "call_a"));
        assert!(matches!(&updates[1], ToolUpdate::Eta { eta_secs: 10, .. }));

        let round = round.unwrap();
        let messages = round.tool_messages(ErrorPolicy::Abort);
        let texts: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["A", "B", "C"]);
        assert_eq!(messages[0].tool_call_id.as_deref(), Some("call_a"));
        assert!(round.failure(ErrorPolicy::Abort).is_none());
    }

    #[tokio::test]
    async fn test_unknown_function_is_reported_not_dropped() {
        let (engine, catalog, _) = setup(abc_server());
        let (updates, round) =
            collect(engine.run(calls(&["b", "nope"]), &catalog, vec![], CancellationToken::new())).await;

        assert!(updates.iter().any(|u| matches!(
            u,
            ToolUpdate::Error { id, message } if id == "call_nope" && message.contains("nope")
        )));
        let round = round.unwrap();
        let failure = round.failure(ErrorPolicy::Continue).unwrap();
        assert!(failure.contains("unknown function `nope`"));
    }

    #[tokio::test]
    async fn test_failing_call_does_not_cancel_siblings() {
        let (engine, catalog, server) = setup(abc_server());
        let (_, round) = collect(engine.run(
            calls(&["broken", "a"]),
            &catalog,
            vec![],
            CancellationToken::new(),
        ))
        .await;

        let round = round.unwrap();
        assert!(round.outcomes[0].is_err());
        assert_eq!(round.outcomes[1].as_ref().unwrap().text, "A");
        assert_eq!(server.calls().len(), 2);

        assert!(round.failure(ErrorPolicy::Abort).unwrap().contains("boom"));
        assert!(round.failure(ErrorPolicy::Continue).is_none());
        let continued = round.tool_messages(ErrorPolicy::Continue);
        assert_eq!(continued.len(), 2);
        assert!(continued[0].content.starts_with("Error:"));
        assert_eq!(round.tool_messages(ErrorPolicy::Abort).len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_per_call() {
        let (mut engine, catalog, _) = setup(abc_server());
        engine.call_timeout = Duration::from_millis(150);
        let (_, round) =
            collect(engine.run(calls(&["a", "b"]), &catalog, vec![], CancellationToken::new())).await;
        let round = round.unwrap();
        assert!(matches!(round.outcomes[0], Err(ToolError::Timeout(_))));
        assert!(round.outcomes[1].is_ok());
    }

    #[tokio::test]
    async fn test_cancel_stops_without_finishing() {
        let (engine, catalog, _) = setup(abc_server());
        let cancel = CancellationToken::new();
        let mut stream = engine.run(calls(&["a"]), &catalog, vec![], cancel.clone());
        // call + eta
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_connection_is_evicted_and_retried() {
        let (engine, catalog, server) = setup(abc_server().failing_closed(1));
        let (_, round) =
            collect(engine.run(calls(&["b"]), &catalog, vec![], CancellationToken::new())).await;
        assert_eq!(round.unwrap().outcomes[0].as_ref().unwrap().text, "B");
        assert_eq!(server.closes(), 1);
    }

    #[tokio::test]
    async fn test_file_references_are_hydrated_before_dispatch() {
        let (engine, catalog, server) = setup(abc_server());
        let image = FileRef {
            name: "cat.png".into(),
            mime: "image/png".into(),
            data: "Y2F0".into(),
        };
        let call = ToolCall::new("call_1", "b", r#"{"image": "file_1"}"#);
        collect(engine.run(vec![call], &catalog, vec![image], CancellationToken::new())).await;
        assert_eq!(
            server.calls()[0].1,
            json!({"image": "data:image/png;base64,Y2F0"})
        );
    }
}
