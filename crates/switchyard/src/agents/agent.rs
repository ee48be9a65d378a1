use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use mcp_client::{ServerConfig, ToolClientPool};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{TurnEvent, TurnRequest, WebSource, DEFAULT_MAX_ITERATIONS};
use crate::config::GatewaySettings;
use crate::generation::{
    AbortRegistry, EndpointSummarizer, GenerationState, ReasoningConfig, Summarizer,
};
use crate::message::{conversation_files, FileRef, ToolCall};
use crate::prompt_template;
use crate::providers::base::terminate_at_final;
use crate::providers::tool_calls::ToolCallAccumulator;
use crate::providers::{
    Endpoint, EndpointParams, GenerationEvent, ModelRegistry, PartialToolCall, ProviderError,
    ToolDefinition,
};
use crate::router::{
    ArchClassifier, ArchSettings, PolicyStore, RouteResolution, Router, RouterConfig,
};
use crate::tools::hydrate::file_references;
use crate::tools::{
    build_catalog, ErrorPolicy, ToolCatalog, ToolEngine, ToolListCache, ToolResult, ToolRoundItem,
};

/// The model id a caller passes to ask for routing.
pub const ROUTER_MODEL_ID: &str = "router";

/// Route name reported when a turn runs without routing.
const DIRECT_ROUTE: &str = "direct";

/// Forgets the conversation's abort and drains the pool when a turn ends,
/// however it ends.
struct TurnGuard {
    pool: Arc<ToolClientPool>,
    aborts: Arc<AbortRegistry>,
    conversation_id: String,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.aborts.clear(&self.conversation_id);
        let pool = Arc::clone(&self.pool);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { pool.drain().await });
        }
    }
}

/// How one model attempt ended, when it did not end the turn itself.
enum Attempt {
    /// The backend failed before anything visible reached the caller.
    Failed(ProviderError),
    /// The turn is over; every event has been yielded.
    Done,
}

/// The orchestration loop: routes a turn, streams generation rounds, runs tool
/// rounds in between and finishes with exactly one final answer.
pub struct Gateway {
    models: ModelRegistry,
    router: Option<Router>,
    pool: Arc<ToolClientPool>,
    tool_cache: ToolListCache,
    engine: ToolEngine,
    tool_servers: Vec<ServerConfig>,
    error_policy: ErrorPolicy,
    max_iterations: u32,
    task_model: Option<String>,
    aborts: Arc<AbortRegistry>,
}

impl Gateway {
    pub fn new(models: ModelRegistry, pool: Arc<ToolClientPool>) -> Self {
        let defaults = GatewaySettings::default();
        Gateway {
            models,
            router: None,
            engine: ToolEngine::new(
                Arc::clone(&pool),
                defaults.tools_call_timeout,
                defaults.tools_eta_secs,
            ),
            pool,
            tool_cache: ToolListCache::new(defaults.tools_list_cache_ttl),
            tool_servers: Vec::new(),
            error_policy: defaults.tools_error_policy,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            task_model: None,
            aborts: AbortRegistry::global(),
        }
    }

    /// Build a gateway from settings: endpoints for every model, an HTTP tool
    /// pool, and a router when a policy file is configured.
    pub fn from_settings(settings: &GatewaySettings) -> Result<Self> {
        let models = ModelRegistry::from_configs(&settings.models)?;
        if models.is_empty() {
            return Err(anyhow!("no models configured"));
        }
        let pool = Arc::new(ToolClientPool::http(settings.tools_call_timeout));

        let router = match &settings.router_policy_path {
            Some(path) => {
                let policy = PolicyStore::from_path(path)
                    .with_context(|| format!("loading route policy {}", path.display()))?;
                let classifier = match (&settings.router_arch_base_url, &settings.router_arch_model) {
                    (Some(base_url), Some(model)) => Some(ArchClassifier::new(ArchSettings {
                        base_url: base_url.clone(),
                        model: model.clone(),
                        api_key: settings.router_arch_api_key.clone(),
                        timeout: settings.router_arch_timeout,
                        max_assistant_chars: settings.router_max_assistant_chars,
                        max_prev_user_chars: settings.router_max_prev_user_chars,
                        other_route: settings.router_other_route.clone(),
                    })?),
                    _ => {
                        info!("no route classifier configured, routing by heuristics only");
                        None
                    }
                };
                let fallback_model = settings
                    .fallback_model()
                    .context("routing needs a fallback model")?;
                Some(Router::new(
                    Arc::new(policy),
                    classifier,
                    RouterConfig {
                        other_route: settings.router_other_route.clone(),
                        fallback_model,
                        multimodal_model: settings.router_multimodal_model.clone(),
                        tools_model: settings.router_tools_model.clone(),
                    },
                ))
            }
            None => None,
        };

        let mut gateway = Gateway::new(models, pool)
            .with_tool_servers(settings.tool_servers.clone())
            .with_tool_timeouts(settings.tools_call_timeout, settings.tools_eta_secs)
            .with_tool_cache_ttl(settings.tools_list_cache_ttl)
            .with_error_policy(settings.tools_error_policy)
            .with_max_iterations(settings.max_iterations);
        gateway.router = router;
        gateway.task_model = settings.task_model();
        Ok(gateway)
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_tool_servers(mut self, servers: Vec<ServerConfig>) -> Self {
        self.tool_servers = servers;
        self
    }

    pub fn with_tool_timeouts(mut self, call_timeout: Duration, eta_secs: u64) -> Self {
        self.engine = ToolEngine::new(Arc::clone(&self.pool), call_timeout, eta_secs);
        self
    }

    pub fn with_tool_cache_ttl(mut self, ttl: Duration) -> Self {
        self.tool_cache = ToolListCache::new(ttl);
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_task_model<S: Into<String>>(mut self, model: S) -> Self {
        self.task_model = Some(model.into());
        self
    }

    pub fn with_abort_registry(mut self, aborts: Arc<AbortRegistry>) -> Self {
        self.aborts = aborts;
        self
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn router(&self) -> Option<&Router> {
        self.router.as_ref()
    }

    pub fn pool(&self) -> &Arc<ToolClientPool> {
        &self.pool
    }

    pub fn aborts(&self) -> &Arc<AbortRegistry> {
        &self.aborts
    }

    /// Forget cached tool listings so the next turn lists every server again.
    pub fn invalidate_tool_cache(&self) {
        self.tool_cache.invalidate();
    }

    /// Re-read the route policy file. The current policy stays active on failure.
    pub fn reload_policy(&self) -> Result<()> {
        match &self.router {
            Some(router) => Ok(router.policy().reload()?),
            None => Err(anyhow!("routing is not configured")),
        }
    }

    /// The tools a turn would be offered right now.
    pub async fn list_tools(&self) -> ToolCatalog {
        build_catalog(&self.pool, &self.tool_cache, &self.tool_servers).await
    }

    /// Run one turn. Events arrive in order; the stream ends after a single
    /// `FinalAnswer`, or without one when the turn is cancelled or aborted.
    pub fn reply(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> BoxStream<'_, Result<TurnEvent>> {
        debug!(conversation_id = %request.conversation_id, "starting turn");
        let stream = async_stream::try_stream! {
            let _guard = TurnGuard {
                pool: Arc::clone(&self.pool),
                aborts: Arc::clone(&self.aborts),
                conversation_id: request.conversation_id.clone(),
            };

            let catalog = if request.tools_enabled && !self.tool_servers.is_empty() {
                self.list_tools().await
            } else {
                ToolCatalog::default()
            };

            let routed = request
                .model
                .as_deref()
                .map_or(true, |model| model == ROUTER_MODEL_ID);
            let resolution = self.resolve(&request, routed, !catalog.is_empty(), &cancel).await?;
            let report_route = routed && self.router.is_some();
            debug!(route = %resolution.route, candidates = ?resolution.candidates, "resolved route");

            let mut last_error: Option<String> = None;
            let mut finished = false;
            for (attempt, model_id) in resolution.candidates.iter().enumerate() {
                if cancel.is_cancelled() {
                    finished = true;
                    break;
                }
                let endpoint = match self.models.get(model_id) {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        warn!(model = %model_id, "skipping candidate: {}", e);
                        last_error = Some(e.to_string());
                        continue;
                    }
                };
                if attempt > 0 {
                    yield TurnEvent::Status { message: format!("Retrying with {}", model_id) };
                }

                let mut events = Box::pin(self.attempt(
                    &request,
                    endpoint,
                    &catalog,
                    report_route.then_some(resolution.route.as_str()),
                    cancel.clone(),
                ));
                let mut outcome = Attempt::Done;
                while let Some(item) = events.next().await {
                    match item {
                        AttemptItem::Event(event) => yield event,
                        AttemptItem::End(end) => outcome = end,
                    }
                }
                match outcome {
                    Attempt::Done => {
                        finished = true;
                        break;
                    }
                    Attempt::Failed(e) => {
                        warn!(model = %model_id, "model failed before streaming, trying next candidate: {}", e);
                        last_error = Some(e.to_string());
                    }
                }
            }

            if !finished && !cancel.is_cancelled() {
                let reason = last_error.unwrap_or_else(|| "no candidate model was available".to_string());
                yield TurnEvent::final_answer(format!("Sorry, no model could answer this request: {}", reason));
            }
        };
        stream.boxed()
    }

    async fn resolve(
        &self,
        request: &TurnRequest,
        routed: bool,
        tools_active: bool,
        cancel: &CancellationToken,
    ) -> Result<RouteResolution> {
        if !routed {
            let model = request.model.clone().unwrap_or_default();
            return Ok(RouteResolution {
                route: DIRECT_ROUTE.to_string(),
                candidates: vec![model],
            });
        }
        if let Some(router) = &self.router {
            return Ok(router.resolve(&request.messages, tools_active, cancel).await);
        }
        let model = self
            .models
            .default_model()
            .ok_or_else(|| anyhow!("no models configured"))?;
        Ok(RouteResolution {
            route: DIRECT_ROUTE.to_string(),
            candidates: vec![model.to_string()],
        })
    }

    /// Run the turn against one model. Ends with `Failed` only while no visible
    /// token has been streamed and no tool has run, so the caller can move on to
    /// the next candidate.
    fn attempt<'a>(
        &'a self,
        request: &'a TurnRequest,
        endpoint: Arc<dyn Endpoint>,
        catalog: &'a ToolCatalog,
        route: Option<&'a str>,
        cancel: CancellationToken,
    ) -> impl futures::Stream<Item = AttemptItem> + Send + 'a {
        async_stream::stream! {
            let model = endpoint.model().clone();
            if let Some(route) = route {
                yield AttemptItem::Event(TurnEvent::RouterMetadata {
                    route: route.to_string(),
                    model: model.id.clone(),
                    provider: None,
                });
            }

            let files: Vec<FileRef> = conversation_files(&request.messages)
                .into_iter()
                .cloned()
                .collect();
            let tools: Vec<ToolDefinition> = if model.tools {
                catalog.definitions().to_vec()
            } else {
                Vec::new()
            };
            let preprompt = if tools.is_empty() {
                request.preprompt.clone()
            } else {
                Some(tool_preamble(&files, request.preprompt.as_deref().or(model.preprompt.as_deref())))
            };

            let mut messages = request.messages.clone();
            let mut tool_results: Vec<ToolResult> = Vec::new();
            let mut web_sources: Vec<WebSource> = Vec::new();
            let mut committed = false;
            let mut reported_provider = false;
            let mut end = None;

            for iteration in 0..self.max_iterations {
                let round_started = Utc::now();
                let params = EndpointParams {
                    messages: messages.clone(),
                    preprompt: preprompt.clone(),
                    tools: tools.clone(),
                    tool_results: std::mem::take(&mut tool_results),
                    settings: request.settings.clone(),
                    cancel: cancel.clone(),
                };
                debug!(model = %model.id, iteration, messages = params.messages.len(), "starting round");

                let mut round = match endpoint.stream(params.clone()).await {
                    Ok(stream) => terminate_at_final(stream),
                    Err(e) => {
                        let (answer, outcome) = round_failure(e, committed);
                        if let Some(answer) = answer {
                            yield AttemptItem::Event(answer);
                        }
                        end = Some(outcome);
                        break;
                    }
                };

                let stops = model.settings(&request.settings).stop_sequences().to_vec();
                let mut state = GenerationState::new(model.reasoning_mode(), stops);
                let mut calls = ToolCallAccumulator::default();
                let mut final_event = None;
                let mut round_error = None;
                let mut interrupted = false;

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        event = round.next() => Some(event),
                    };
                    let event = match next {
                        None => {
                            interrupted = true;
                            break;
                        }
                        Some(None) => break,
                        Some(Some(event)) => event,
                    };
                    match event {
                        Ok(GenerationEvent::Token(token)) => {
                            for event in state.on_token(&token) {
                                if matches!(event, TurnEvent::Stream { .. }) {
                                    committed = true;
                                }
                                yield AttemptItem::Event(event);
                            }
                        }
                        Ok(GenerationEvent::ToolCallDelta(delta)) => calls.add(&delta),
                        Ok(GenerationEvent::Metadata(metadata)) => {
                            if let (Some(route), Some(provider), false) = (route, metadata.provider, reported_provider) {
                                reported_provider = true;
                                yield AttemptItem::Event(TurnEvent::RouterMetadata {
                                    route: route.to_string(),
                                    model: model.id.clone(),
                                    provider: Some(provider),
                                });
                            }
                        }
                        Ok(GenerationEvent::Final { token, generated_text }) => {
                            final_event = Some((token, generated_text));
                        }
                        Err(e) => {
                            round_error = Some(e);
                            break;
                        }
                    }
                    if self.aborts.aborted_since(&request.conversation_id, round_started) {
                        info!("conversation aborted, stopping turn");
                        interrupted = true;
                        break;
                    }
                }
                drop(round);

                if interrupted || cancel.is_cancelled() {
                    debug!("turn cancelled");
                    end = Some(Attempt::Done);
                    break;
                }
                if let Some(e) = round_error {
                    let (answer, outcome) = round_failure(e, committed);
                    if let Some(answer) = answer {
                        yield AttemptItem::Event(answer);
                    }
                    end = Some(outcome);
                    break;
                }
                let Some((final_token, generated_text)) = final_event else {
                    end = Some(Attempt::Done);
                    break;
                };

                if !calls.is_empty() {
                    let tool_calls = match self.recover_call_ids(endpoint.as_ref(), params, calls.finish()).await {
                        Ok(tool_calls) => tool_calls,
                        Err(unnamed) => {
                            warn!(calls = ?unnamed, "tool calls arrived without a function name");
                            yield AttemptItem::Event(TurnEvent::FinalAnswer {
                                text: format!(
                                    "The model requested a tool without naming it (call {}).",
                                    unnamed.join(", ")
                                ),
                                interrupted: false,
                                web_sources: dedup_sources(web_sources),
                            });
                            end = Some(Attempt::Done);
                            break;
                        }
                    };
                    let content = state.visible().to_string();

                    let mut tool_round = None;
                    {
                        let mut updates = self.engine.run(tool_calls, catalog, files.clone(), cancel.clone());
                        while let Some(item) = updates.next().await {
                            match item {
                                ToolRoundItem::Update(update) => yield AttemptItem::Event(TurnEvent::Tool(update)),
                                ToolRoundItem::Finished(finished) => tool_round = Some(finished),
                            }
                        }
                    }
                    let Some(tool_round) = tool_round else {
                        debug!("turn cancelled during tool round");
                        end = Some(Attempt::Done);
                        break;
                    };

                    if self.aborts.aborted_since(&request.conversation_id, round_started) {
                        info!("conversation aborted during tool round, stopping turn");
                        end = Some(Attempt::Done);
                        break;
                    }

                    committed = true;
                    web_sources.extend(tool_round.web_sources());
                    if let Some(failure) = tool_round.failure(self.error_policy) {
                        warn!("ending turn after tool failure: {}", failure);
                        yield AttemptItem::Event(TurnEvent::FinalAnswer {
                            text: failure,
                            interrupted: false,
                            web_sources: dedup_sources(web_sources),
                        });
                        end = Some(Attempt::Done);
                        break;
                    }
                    messages.push(tool_round.assistant_message(&content));
                    messages.extend(tool_round.tool_messages(self.error_policy));
                    tool_results = tool_round.results();
                    continue;
                }

                let summarizer = match model.reasoning_mode() {
                    ReasoningConfig::Summarize => self.summarizer(&cancel),
                    _ => None,
                };
                let (events, answer) = state
                    .finalize(
                        final_token.as_ref(),
                        &generated_text,
                        summarizer.as_ref().map(|s| s as &dyn Summarizer),
                    )
                    .await;
                for event in events {
                    yield AttemptItem::Event(event);
                }
                yield AttemptItem::Event(TurnEvent::FinalAnswer {
                    text: answer.text,
                    interrupted: answer.interrupted,
                    web_sources: dedup_sources(web_sources),
                });
                end = Some(Attempt::Done);
                break;
            }

            match end {
                Some(end) => yield AttemptItem::End(end),
                None => {
                    warn!(max_iterations = self.max_iterations, "tool rounds exhausted");
                    yield AttemptItem::Event(TurnEvent::final_answer(format!(
                        "Stopped after {} rounds of tool calls without reaching an answer.",
                        self.max_iterations
                    )));
                    yield AttemptItem::End(Attempt::Done);
                }
            }
        }
    }

    /// Fill in missing call ids and names with a non-streaming retry of the
    /// same round, matching calls by index. Ids still missing afterwards are
    /// synthesized; calls still missing a name are returned as the error.
    async fn recover_call_ids(
        &self,
        endpoint: &dyn Endpoint,
        params: EndpointParams,
        partial: Vec<PartialToolCall>,
    ) -> Result<Vec<ToolCall>, Vec<String>> {
        let recovered = if partial.iter().any(|call| call.id.is_none() || call.name.is_none()) {
            debug!("tool call streamed without an id or name, retrying without streaming");
            match endpoint.complete(params).await {
                Ok(completion) => completion.tool_calls,
                Err(e) => {
                    warn!("non-streaming retry for tool calls failed: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut calls = Vec::with_capacity(partial.len());
        let mut unnamed = Vec::new();
        for call in partial {
            let twin = recovered.iter().find(|r| r.index == call.index);
            let id = call
                .id
                .or_else(|| twin.and_then(|r| r.id.clone()))
                .unwrap_or_else(|| format!("call_{}", call.index));
            let Some(name) = call
                .name
                .or_else(|| twin.and_then(|r| r.name.clone()))
                .filter(|name| !name.is_empty())
            else {
                unnamed.push(id);
                continue;
            };
            let arguments = match (call.arguments.is_empty(), twin) {
                (true, Some(r)) => r.arguments.clone(),
                _ => call.arguments,
            };
            calls.push(ToolCall::new(id, name, arguments));
        }

        if unnamed.is_empty() {
            Ok(calls)
        } else {
            Err(unnamed)
        }
    }

    fn summarizer(&self, cancel: &CancellationToken) -> Option<EndpointSummarizer> {
        let id = self
            .task_model
            .as_deref()
            .or_else(|| self.models.default_model())?;
        match self.models.get(id) {
            Ok(endpoint) => Some(EndpointSummarizer::new(endpoint, cancel.clone())),
            Err(e) => {
                warn!("task model unavailable: {}", e);
                None
            }
        }
    }
}

enum AttemptItem {
    Event(TurnEvent),
    End(Attempt),
}

/// A transport failure before the attempt committed to any output moves on to
/// the next candidate; anything else ends the turn with the error as its answer.
fn round_failure(error: ProviderError, committed: bool) -> (Option<TurnEvent>, Attempt) {
    if error.is_transport() && !committed {
        return (None, Attempt::Failed(error));
    }
    warn!("generation failed: {}", error);
    (
        Some(TurnEvent::final_answer(format!("Generation failed: {}", error))),
        Attempt::Done,
    )
}

fn tool_preamble(files: &[FileRef], preprompt: Option<&str>) -> String {
    let refs: Vec<&FileRef> = files.iter().collect();
    let context = json!({
        "files": file_references(&refs),
        "preprompt": preprompt,
    });
    prompt_template::render_global_file("tool_preamble.md", &context).unwrap_or_else(|e| {
        warn!("failed to render tool preamble: {}", e);
        preprompt.unwrap_or_default().to_string()
    })
}

fn dedup_sources(sources: Vec<WebSource>) -> Vec<WebSource> {
    let mut seen = std::collections::HashSet::new();
    sources
        .into_iter()
        .filter(|source| seen.insert(source.link.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Role};
    use crate::providers::Completion;
    use crate::router::{Route, RoutePolicy};
    use crate::testing::{
        ScriptedEndpoint, ScriptedRound, StaticConnector, StaticToolServer, ToolBehavior,
    };
    use crate::agents::types::ToolUpdate;
    use futures::TryStreamExt;
    use rmcp::model::Tool;
    use rmcp::object;

    const TOOLS_URL: &str = "http://tools.local/mcp";

    fn registry(endpoints: &[&Arc<ScriptedEndpoint>]) -> ModelRegistry {
        let mut models = ModelRegistry::new();
        for endpoint in endpoints {
            models.register(Arc::clone(endpoint) as Arc<dyn Endpoint>);
        }
        models
    }

    fn tool_model(id: &str) -> ScriptedEndpoint {
        let endpoint = ScriptedEndpoint::new(id);
        let model = endpoint.model().clone().with_tools(true);
        ScriptedEndpoint::with_model(model)
    }

    fn tool_pool(server: &Arc<StaticToolServer>) -> Arc<ToolClientPool> {
        let connector = StaticConnector::new().with_server(TOOLS_URL, Arc::clone(server));
        Arc::new(ToolClientPool::new(Arc::new(connector)))
    }

    fn empty_pool() -> Arc<ToolClientPool> {
        Arc::new(ToolClientPool::new(Arc::new(StaticConnector::new())))
    }

    fn calc_and_weather() -> Arc<StaticToolServer> {
        Arc::new(
            StaticToolServer::new()
                .with_tool(
                    Tool::new("calculator", "Evaluate arithmetic", object!({"type": "object"})),
                    ToolBehavior::text("4"),
                )
                .with_tool(
                    Tool::new("weather", "Current weather", object!({"type": "object"})),
                    ToolBehavior::text("sunny, 21C").after(Duration::from_millis(50)),
                ),
        )
    }

    async fn run(gateway: &Gateway, request: TurnRequest) -> Vec<TurnEvent> {
        gateway
            .reply(request, CancellationToken::new())
            .try_collect()
            .await
            .unwrap()
    }

    fn final_answer(events: &[TurnEvent]) -> Option<(&str, bool)> {
        events.iter().find_map(|event| match event {
            TurnEvent::FinalAnswer {
                text, interrupted, ..
            } => Some((text.as_str(), *interrupted)),
            _ => None,
        })
    }

    fn streamed(events: &[TurnEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                TurnEvent::Stream { token } => Some(token.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_plain_answer_streams_then_finishes_once() {
        let chat = Arc::new(ScriptedEndpoint::new("chat").then(ScriptedRound::text("Hello there")));
        let gateway = Gateway::new(registry(&[&chat]), empty_pool());

        let events = run(&gateway, TurnRequest::new(vec![Message::user("hi")])).await;

        assert_eq!(streamed(&events), "Hello there");
        assert_eq!(final_answer(&events), Some(("Hello there", false)));
        assert_eq!(events.iter().filter(|e| e.is_final()).count(), 1);
        assert!(events.last().is_some_and(TurnEvent::is_final));
        assert!(!events
            .iter()
            .any(|e| matches!(e, TurnEvent::RouterMetadata { .. })));
    }

    #[tokio::test]
    async fn test_tool_round_feeds_results_back_to_the_model() {
        let server = calc_and_weather();
        let coder = Arc::new(
            tool_model("coder")
                .then(ScriptedRound::tool_calls(&[
                    (Some("c1"), "calculator", r#"{"expression": "2+2"}"#),
                    (Some("c2"), "weather", r#"{"city": "Paris"}"#),
                ]))
                .then(ScriptedRound::text("2+2 is 4 and Paris is sunny.")),
        );
        let router = Router::new(
            Arc::new(PolicyStore::new(RoutePolicy::from_routes(Vec::new()).unwrap())),
            None,
            RouterConfig {
                other_route: "casual_conversation".to_string(),
                fallback_model: "coder".to_string(),
                multimodal_model: None,
                tools_model: Some("coder".to_string()),
            },
        );
        let gateway = Gateway::new(registry(&[&coder]), tool_pool(&server))
            .with_tool_servers(vec![ServerConfig::new("tools", TOOLS_URL)])
            .with_router(router);

        let events = run(
            &gateway,
            TurnRequest::new(vec![Message::user("what is 2+2 and the weather in Paris?")]),
        )
        .await;

        assert!(matches!(
            &events[0],
            TurnEvent::RouterMetadata { route, model, .. } if route == "agentic" && model == "coder"
        ));

        let updates: Vec<&ToolUpdate> = events
            .iter()
            .filter_map(|event| match event {
                TurnEvent::Tool(update) => Some(update),
                _ => None,
            })
            .collect();
        assert!(matches!(updates[0], ToolUpdate::Call { id, name, .. } if id == "c1" && name == "calculator"));
        assert!(matches!(updates[1], ToolUpdate::Eta { id, .. } if id == "c1"));
        assert!(matches!(updates[2], ToolUpdate::Call { id, .. } if id == "c2"));
        let results: Vec<&str> = updates
            .iter()
            .filter_map(|update| match update {
                ToolUpdate::Result { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(results, vec!["c1", "c2"]);
        assert_eq!(final_answer(&events), Some(("2+2 is 4 and Paris is sunny.", false)));

        assert_eq!(server.calls().len(), 2);
        let requests = coder.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 2);
        assert!(requests[0]
            .preprompt
            .as_deref()
            .is_some_and(|p| p.contains("You can call tools")));

        let followup = &requests[1].messages;
        assert_eq!(followup.len(), 4);
        assert_eq!(followup[1].role, Role::Assistant);
        assert_eq!(followup[1].tool_calls.len(), 2);
        assert_eq!(followup[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(followup[2].content, "4");
        assert_eq!(followup[3].tool_call_id.as_deref(), Some("c2"));
        assert_eq!(followup[3].content, "sunny, 21C");
        assert_eq!(requests[1].tool_results.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_call_id_recovered_without_streaming() {
        let server = calc_and_weather();
        let coder = Arc::new(
            tool_model("coder")
                .then(ScriptedRound::tool_calls(&[(None, "calculator", r#"{"expression": "2+2"}"#)]))
                .then_complete(Completion {
                    tool_calls: vec![PartialToolCall {
                        index: 0,
                        id: Some("call_recovered".to_string()),
                        name: Some("calculator".to_string()),
                        arguments: r#"{"expression": "2+2"}"#.to_string(),
                    }],
                    ..Default::default()
                })
                .then(ScriptedRound::text("4")),
        );
        let gateway = Gateway::new(registry(&[&coder]), tool_pool(&server))
            .with_tool_servers(vec![ServerConfig::new("tools", TOOLS_URL)]);

        let events = run(&gateway, TurnRequest::new(vec![Message::user("2+2?")])).await;

        assert_eq!(coder.completion_requests(), 1);
        assert!(events.iter().any(|event| matches!(
            event,
            TurnEvent::Tool(ToolUpdate::Result { id, .. }) if id == "call_recovered"
        )));
        assert_eq!(final_answer(&events), Some(("4", false)));
    }

    #[tokio::test]
    async fn test_missing_call_id_synthesized_when_retry_fails() {
        let server = calc_and_weather();
        let coder = Arc::new(
            tool_model("coder")
                .then(ScriptedRound::tool_calls(&[(None, "calculator", "{}")]))
                .then(ScriptedRound::text("done")),
        );
        let gateway = Gateway::new(registry(&[&coder]), tool_pool(&server))
            .with_tool_servers(vec![ServerConfig::new("tools", TOOLS_URL)]);

        let events = run(&gateway, TurnRequest::new(vec![Message::user("go")])).await;

        assert!(events.iter().any(|event| matches!(
            event,
            TurnEvent::Tool(ToolUpdate::Call { id, .. }) if id == "call_0"
        )));
        assert_eq!(final_answer(&events), Some(("done", false)));
    }

    #[tokio::test]
    async fn test_missing_call_name_recovered_without_streaming() {
        let server = calc_and_weather();
        let coder = Arc::new(
            tool_model("coder")
                .then(ScriptedRound::tool_calls(&[(Some("c1"), "", r#"{"expression": "2+2"}"#)]))
                .then_complete(Completion {
                    tool_calls: vec![PartialToolCall {
                        index: 0,
                        id: Some("c1".to_string()),
                        name: Some("calculator".to_string()),
                        arguments: r#"{"expression": "2+2"}"#.to_string(),
                    }],
                    ..Default::default()
                })
                .then(ScriptedRound::text("4")),
        );
        let gateway = Gateway::new(registry(&[&coder]), tool_pool(&server))
            .with_tool_servers(vec![ServerConfig::new("tools", TOOLS_URL)]);

        let events = run(&gateway, TurnRequest::new(vec![Message::user("2+2?")])).await;

        assert_eq!(coder.completion_requests(), 1);
        assert!(events.iter().any(|event| matches!(
            event,
            TurnEvent::Tool(ToolUpdate::Call { id, name, .. }) if id == "c1" && name == "calculator"
        )));
        assert_eq!(final_answer(&events), Some(("4", false)));
    }

    #[tokio::test]
    async fn test_unnamed_call_ends_turn_without_dispatch() {
        let server = calc_and_weather();
        let coder = Arc::new(
            tool_model("coder")
                .then(ScriptedRound::tool_calls(&[(Some("c1"), "", "{}")]))
                .then(ScriptedRound::text("unreachable")),
        );
        let gateway = Gateway::new(registry(&[&coder]), tool_pool(&server))
            .with_tool_servers(vec![ServerConfig::new("tools", TOOLS_URL)]);

        let events = run(&gateway, TurnRequest::new(vec![Message::user("go")])).await;

        assert!(!events.iter().any(|event| matches!(event, TurnEvent::Tool(_))));
        assert_eq!(
            final_answer(&events),
            Some(("The model requested a tool without naming it (call c1).", false))
        );
        assert_eq!(coder.requests().len(), 1);
    }

    fn routed_gateway(models: ModelRegistry) -> Gateway {
        let policy = RoutePolicy::from_routes(vec![Route {
            name: "casual_conversation".to_string(),
            description: "small talk".to_string(),
            primary_model: "primary".to_string(),
            fallback_models: vec!["backup".to_string()],
        }])
        .unwrap();
        let router = Router::new(
            Arc::new(PolicyStore::new(policy)),
            None,
            RouterConfig {
                other_route: "casual_conversation".to_string(),
                fallback_model: "backup".to_string(),
                multimodal_model: None,
                tools_model: None,
            },
        );
        Gateway::new(models, empty_pool()).with_router(router)
    }

    #[tokio::test]
    async fn test_transport_failure_falls_back_to_next_candidate() {
        let primary = Arc::new(ScriptedEndpoint::new("primary").then(ScriptedRound::Fail("connection refused".into())));
        let backup = Arc::new(
            ScriptedEndpoint::new("backup").then(ScriptedRound::text("hello from backup").with_metadata("acme")),
        );
        let gateway = routed_gateway(registry(&[&primary, &backup]));

        let events = run(&gateway, TurnRequest::new(vec![Message::user("hey")])).await;

        let metadata: Vec<(&str, &str, Option<&str>)> = events
            .iter()
            .filter_map(|event| match event {
                TurnEvent::RouterMetadata { route, model, provider } => {
                    Some((route.as_str(), model.as_str(), provider.as_deref()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            metadata,
            vec![
                ("casual_conversation", "primary", None),
                ("casual_conversation", "backup", None),
                ("casual_conversation", "backup", Some("acme")),
            ]
        );
        assert_eq!(final_answer(&events), Some(("hello from backup", false)));
        assert_eq!(primary.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_candidates_explain_the_failure() {
        let primary = Arc::new(ScriptedEndpoint::new("primary").then(ScriptedRound::Fail("down".into())));
        let backup = Arc::new(ScriptedEndpoint::new("backup").then(ScriptedRound::Fail("also down".into())));
        let gateway = routed_gateway(registry(&[&primary, &backup]));

        let events = run(&gateway, TurnRequest::new(vec![Message::user("hey")])).await;

        let (text, interrupted) = final_answer(&events).unwrap();
        assert!(text.contains("also down"), "{}", text);
        assert!(!interrupted);
        assert!(events.last().is_some_and(TurnEvent::is_final));
    }

    #[tokio::test]
    async fn test_explicit_model_skips_routing() {
        let primary = Arc::new(ScriptedEndpoint::new("primary"));
        let backup = Arc::new(ScriptedEndpoint::new("backup").then(ScriptedRound::text("direct")));
        let gateway = routed_gateway(registry(&[&primary, &backup]));

        let mut request = TurnRequest::new(vec![Message::user("hey")]);
        request.model = Some("backup".to_string());
        let events = run(&gateway, request).await;

        assert!(!events
            .iter()
            .any(|e| matches!(e, TurnEvent::RouterMetadata { .. })));
        assert_eq!(final_answer(&events), Some(("direct", false)));
        assert!(primary.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_turn_emits_no_final_answer() {
        let chat = Arc::new(ScriptedEndpoint::new("chat").then(ScriptedRound::text("never seen")));
        let gateway = Gateway::new(registry(&[&chat]), empty_pool());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let events: Vec<TurnEvent> = gateway
            .reply(TurnRequest::new(vec![Message::user("hi")]), cancel)
            .try_collect()
            .await
            .unwrap();

        assert!(!events.iter().any(TurnEvent::is_final));
    }

    #[tokio::test]
    async fn test_abort_stops_the_round_without_final_answer() {
        let chat = Arc::new(ScriptedEndpoint::new("chat").then(ScriptedRound::text("one two three four")));
        let aborts = Arc::new(AbortRegistry::default());
        aborts.abort_at("conv-1", Utc::now() + chrono::Duration::hours(1));
        let gateway = Gateway::new(registry(&[&chat]), empty_pool()).with_abort_registry(Arc::clone(&aborts));

        let mut request = TurnRequest::new(vec![Message::user("count")]);
        request.conversation_id = "conv-1".to_string();
        let events = run(&gateway, request).await;

        assert!(!events.iter().any(TurnEvent::is_final));
        assert!(streamed(&events).len() < "one two three four".len());
        assert_eq!(aborts.latest("conv-1"), None);
    }

    #[tokio::test]
    async fn test_finished_turn_forgets_earlier_abort() {
        let chat = Arc::new(ScriptedEndpoint::new("chat").then(ScriptedRound::text("hello")));
        let aborts = Arc::new(AbortRegistry::default());
        aborts.abort_at("conv-2", Utc::now() - chrono::Duration::seconds(30));
        let gateway = Gateway::new(registry(&[&chat]), empty_pool()).with_abort_registry(Arc::clone(&aborts));

        let mut request = TurnRequest::new(vec![Message::user("hi")]);
        request.conversation_id = "conv-2".to_string();
        let events = run(&gateway, request).await;

        assert_eq!(final_answer(&events), Some(("hello", false)));
        assert!(aborts.is_empty());
    }

    #[tokio::test]
    async fn test_tool_error_ends_turn_under_abort_policy() {
        let server = Arc::new(StaticToolServer::new().with_tool(
            Tool::new("calculator", "Evaluate arithmetic", object!({"type": "object"})),
            ToolBehavior::error("division by zero"),
        ));
        let coder = Arc::new(
            tool_model("coder").then(ScriptedRound::tool_calls(&[(Some("c1"), "calculator", "{}")])),
        );
        let gateway = Gateway::new(registry(&[&coder]), tool_pool(&server))
            .with_tool_servers(vec![ServerConfig::new("tools", TOOLS_URL)]);

        let events = run(&gateway, TurnRequest::new(vec![Message::user("1/0")])).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::Tool(ToolUpdate::Error { id, .. }) if id == "c1")));
        let (text, _) = final_answer(&events).unwrap();
        assert!(text.contains("calculator"), "{}", text);
        assert_eq!(coder.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_tool_error_fed_back_under_continue_policy() {
        let server = Arc::new(StaticToolServer::new().with_tool(
            Tool::new("calculator", "Evaluate arithmetic", object!({"type": "object"})),
            ToolBehavior::error("division by zero"),
        ));
        let coder = Arc::new(
            tool_model("coder")
                .then(ScriptedRound::tool_calls(&[(Some("c1"), "calculator", "{}")]))
                .then(ScriptedRound::text("That is undefined.")),
        );
        let gateway = Gateway::new(registry(&[&coder]), tool_pool(&server))
            .with_tool_servers(vec![ServerConfig::new("tools", TOOLS_URL)])
            .with_error_policy(ErrorPolicy::Continue);

        let events = run(&gateway, TurnRequest::new(vec![Message::user("1/0")])).await;

        assert_eq!(final_answer(&events), Some(("That is undefined.", false)));
        let followup = &coder.requests()[1].messages;
        assert!(followup[2].content.starts_with("Error:"));
    }

    #[tokio::test]
    async fn test_iteration_cap_ends_turn() {
        let server = calc_and_weather();
        let coder = Arc::new(
            tool_model("coder").then(ScriptedRound::tool_calls(&[(Some("c1"), "calculator", "{}")])),
        );
        let gateway = Gateway::new(registry(&[&coder]), tool_pool(&server))
            .with_tool_servers(vec![ServerConfig::new("tools", TOOLS_URL)])
            .with_max_iterations(1);

        let events = run(&gateway, TurnRequest::new(vec![Message::user("loop")])).await;

        let (text, _) = final_answer(&events).unwrap();
        assert!(text.starts_with("Stopped after 1 rounds"), "{}", text);
        assert_eq!(events.iter().filter(|e| e.is_final()).count(), 1);
    }

    #[tokio::test]
    async fn test_tools_disabled_sends_no_definitions() {
        let server = calc_and_weather();
        let coder = Arc::new(tool_model("coder").then(ScriptedRound::text("no tools")));
        let gateway = Gateway::new(registry(&[&coder]), tool_pool(&server))
            .with_tool_servers(vec![ServerConfig::new("tools", TOOLS_URL)]);

        let mut request = TurnRequest::new(vec![Message::user("hi")]);
        request.tools_enabled = false;
        run(&gateway, request).await;

        let requests = coder.requests();
        assert!(requests[0].tools.is_empty());
        assert!(requests[0].preprompt.is_none());
    }
}
