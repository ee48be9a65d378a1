use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use indoc::indoc;
use mcp_client::{ServerConfig, ToolClientPool};
use rmcp::model::Tool;
use rmcp::object;
use serde_json::{json, Value};
use switchyard::agents::{ToolUpdate, TurnEvent, TurnRequest};
use switchyard::config::GatewaySettings;
use switchyard::message::Message;
use switchyard::model::ModelConfig;
use switchyard::providers::{EndpointConfig, ModelRegistry, OpenAiEndpointConfig};
use switchyard::testing::{StaticConnector, StaticToolServer, ToolBehavior};
use switchyard::Gateway;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOOLS_URL: &str = "http://tools.local/mcp";

const POLICY: &str = indoc! {r#"
    [
      {"name": "code", "description": "Writing or debugging code", "primary_model": "primary"},
      {"name": "casual_conversation", "description": "Small talk", "primary_model": "backup"}
    ]
"#};

fn model(server: &MockServer, id: &str) -> ModelConfig {
    ModelConfig::new(
        id,
        EndpointConfig::OpenAi(OpenAiEndpointConfig {
            base_url: format!("{}/v1", server.uri()),
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        }),
    )
}

fn sse(chunks: &[Value]) -> String {
    let mut body: String = chunks.iter().map(|c| format!("data: {}\n\n", c)).collect();
    body.push_str("data: [DONE]\n\n");
    body
}

fn sse_response(chunks: &[Value]) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(sse(chunks), "text/event-stream")
}

fn classifier_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "arch-1",
        "choices": [{"index": 0, "finish_reason": "stop", "message": {"role": "assistant", "content": content}}]
    }))
}

async fn collect(gateway: &Gateway, request: TurnRequest) -> Vec<TurnEvent> {
    gateway
        .reply(request, CancellationToken::new())
        .try_collect()
        .await
        .expect("turn should not fail")
}

fn final_text(events: &[TurnEvent]) -> &str {
    events
        .iter()
        .find_map(|event| match event {
            TurnEvent::FinalAnswer { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .expect("turn should end with a final answer")
}

fn route_metadata(events: &[TurnEvent]) -> Vec<(String, String, Option<String>)> {
    events
        .iter()
        .filter_map(|event| match event {
            TurnEvent::RouterMetadata {
                route,
                model,
                provider,
            } => Some((route.clone(), model.clone(), provider.clone())),
            _ => None,
        })
        .collect()
}

fn routed_settings(server: &MockServer, policy: &tempfile::NamedTempFile, timeout: Duration) -> GatewaySettings {
    GatewaySettings {
        models: vec![model(server, "primary"), model(server, "backup")],
        router_policy_path: Some(policy.path().to_path_buf()),
        router_arch_base_url: Some(format!("{}/router/v1", server.uri())),
        router_arch_model: Some("arch-router".to_string()),
        router_arch_timeout: timeout,
        router_fallback_model: Some("backup".to_string()),
        ..Default::default()
    }
}

fn policy_file() -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), POLICY).unwrap();
    file
}

#[tokio::test]
async fn test_classified_route_streams_from_its_primary_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/router/v1/chat/completions"))
        .respond_with(classifier_reply(r#"{"route": "code"}"#))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "primary", "stream": true})))
        .respond_with(
            sse_response(&[
                json!({"choices": [{"index": 0, "delta": {"reasoning_content": "The user wants a loop."}}]}),
                json!({"choices": [{"index": 0, "delta": {"content": "Use a `for` loop."}, "finish_reason": "stop"}]}),
            ])
            .insert_header("x-inference-provider", "together"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let policy = policy_file();
    let gateway = Gateway::from_settings(&routed_settings(&server, &policy, Duration::from_secs(5))).unwrap();
    let events = collect(
        &gateway,
        TurnRequest::new(vec![Message::user("How do I iterate over a Vec in Rust?")]),
    )
    .await;

    assert_eq!(
        route_metadata(&events),
        vec![
            ("code".to_string(), "primary".to_string(), None),
            ("code".to_string(), "primary".to_string(), Some("together".to_string())),
        ]
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Reasoning(_))));
    assert_eq!(final_text(&events), "Use a `for` loop.");
    assert!(events.last().is_some_and(TurnEvent::is_final));
}

#[tokio::test]
async fn test_classifier_timeout_uses_fallback_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/router/v1/chat/completions"))
        .respond_with(classifier_reply(r#"{"route": "code"}"#).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "backup"})))
        .respond_with(sse_response(&[
            json!({"choices": [{"index": 0, "delta": {"content": "Hi!"}, "finish_reason": "stop"}]}),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let policy = policy_file();
    let gateway =
        Gateway::from_settings(&routed_settings(&server, &policy, Duration::from_millis(100))).unwrap();
    let events = collect(&gateway, TurnRequest::new(vec![Message::user("hello")])).await;

    assert_eq!(
        route_metadata(&events),
        vec![("casual_conversation".to_string(), "backup".to_string(), None)]
    );
    assert_eq!(final_text(&events), "Hi!");
}

#[tokio::test]
async fn test_tool_round_over_sse_recovers_missing_call_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true, "tool_choice": "auto"})))
        .respond_with(sse_response(&[
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "type": "function", "function": {"name": "calculator", "arguments": "{\"expression\": "}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"6*7\"}"}}
            ]}, "finish_reason": "tool_calls"}]}),
        ]))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "r-1",
            "choices": [{"index": 0, "finish_reason": "tool_calls", "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{"index": 0, "id": "call_abc", "type": "function",
                    "function": {"name": "calculator", "arguments": "{\"expression\": \"6*7\"}"}}]
            }}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains("call_abc"))
        .respond_with(sse_response(&[
            json!({"choices": [{"index": 0, "delta": {"content": "6*7 is 42."}, "finish_reason": "stop"}]}),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let tools = Arc::new(StaticToolServer::new().with_tool(
        Tool::new("calculator", "Evaluate arithmetic", object!({"type": "object"})),
        ToolBehavior::text("42"),
    ));
    let connector = StaticConnector::new().with_server(TOOLS_URL, Arc::clone(&tools));
    let pool = Arc::new(ToolClientPool::new(Arc::new(connector)));
    let models = ModelRegistry::from_configs(&[model(&server, "coder").with_tools(true)]).unwrap();
    let gateway = Gateway::new(models, pool)
        .with_tool_servers(vec![ServerConfig::new("tools", TOOLS_URL)]);

    let events = collect(&gateway, TurnRequest::new(vec![Message::user("what is 6*7?")])).await;

    assert!(events.iter().any(|e| matches!(
        e,
        TurnEvent::Tool(ToolUpdate::Result { id, text, .. }) if id == "call_abc" && text == "42"
    )));
    assert_eq!(final_text(&events), "6*7 is 42.");
    assert_eq!(tools.calls(), vec![("calculator".to_string(), json!({"expression": "6*7"}))]);
}

#[tokio::test]
async fn test_backend_error_becomes_final_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": {"message": "overloaded"}})))
        .mount(&server)
        .await;

    let models = ModelRegistry::from_configs(&[model(&server, "chat")]).unwrap();
    let gateway = Gateway::new(models, Arc::new(ToolClientPool::http(Duration::from_secs(5))));
    let events = collect(&gateway, TurnRequest::new(vec![Message::user("hello")])).await;

    assert_eq!(events.iter().filter(|e| e.is_final()).count(), 1);
    assert!(final_text(&events).starts_with("Sorry, no model could answer"));
}
