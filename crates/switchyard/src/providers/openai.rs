use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response};
use serde_json::Value;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use url::Url;

use super::base::{Completion, Endpoint, EndpointParams, EventStream, GenerationEvent, ProviderMetadata};
use super::errors::ProviderError;
use super::factory::OpenAiEndpointConfig;
use super::formats::openai::{create_request, response_to_completion, OAIStreamChunk};
use super::openai_stream::StreamTranslator;
use super::utils::{handle_response_openai_compat, handle_status_openai_compat};
use crate::model::ModelConfig;

/// Response header naming the upstream that served the request, set by routing proxies.
pub const INFERENCE_PROVIDER_HEADER: &str = "x-inference-provider";

#[derive(Debug)]
pub struct OpenAiEndpoint {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    headers: HashMap<String, String>,
    model: ModelConfig,
}

impl OpenAiEndpoint {
    pub fn new(model: ModelConfig, config: &OpenAiEndpointConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().or_else(|| {
            config.api_key_env.as_ref().and_then(|name| {
                crate::config::Config::global()
                    .get_secret::<String>(name)
                    .map_err(|e| tracing::warn!(key = %name, "api key not found: {}", e))
                    .ok()
            })
        });
        let base_url = Url::parse(&format!("{}/", config.base_url.trim_end_matches('/')))
            .map_err(|e| {
                ProviderError::RequestFailed(format!("invalid base url {}: {}", config.base_url, e))
            })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key,
            headers: config.headers.clone(),
            model,
        })
    }

    async fn post(&self, payload: &Value) -> Result<Response, ProviderError> {
        let url = self
            .base_url
            .join("chat/completions")
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        let mut request = self.client.post(url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        Ok(request.json(payload).send().await?)
    }

    fn metadata_for(&self, response: &Response) -> ProviderMetadata {
        ProviderMetadata {
            model: Some(self.model.backend_name().to_string()),
            provider: response
                .headers()
                .get(INFERENCE_PROVIDER_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }
}

#[async_trait]
impl Endpoint for OpenAiEndpoint {
    fn model(&self) -> &ModelConfig {
        &self.model
    }

    #[tracing::instrument(skip(self, params), fields(model = %self.model.id))]
    async fn stream(&self, params: EndpointParams) -> Result<EventStream, ProviderError> {
        let payload = create_request(&self.model, &params, true);
        let cancel = params.cancel.clone();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("round cancelled before the backend responded");
                return Ok(futures::stream::empty().boxed());
            }
            response = self.post(&payload) => response?,
        };
        let response = handle_status_openai_compat(response).await?;
        let metadata = self.metadata_for(&response);
        let (begin, end) = self.model.reasoning_markers();

        let bytes = response.bytes_stream().map_err(io::Error::other);

        Ok(Box::pin(try_stream! {
            yield GenerationEvent::Metadata(metadata);

            let reader = StreamReader::new(bytes);
            let mut lines = FramedRead::new(reader, LinesCodec::new());
            let mut translator = StreamTranslator::new(begin, end);
            let mut saw_done = false;
            let mut cancelled = false;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    line = lines.next() => Some(line),
                };
                let line = match next {
                    None => {
                        tracing::debug!("round cancelled mid-stream");
                        cancelled = true;
                        break;
                    }
                    Some(None) => break,
                    Some(Some(line)) => line.map_err(|e| {
                        ProviderError::RequestFailed(format!("Stream decode error: {}", e))
                    })?,
                };

                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    saw_done = true;
                    break;
                }

                let value: Value = match serde_json::from_str(data) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!("skipping malformed stream chunk: {}", e);
                        continue;
                    }
                };
                if let Some(error) = value.get("error") {
                    Err::<(), _>(ProviderError::ServerError(error.to_string()))?;
                }
                let chunk: OAIStreamChunk = match serde_json::from_value(value) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!("skipping malformed stream chunk: {}", e);
                        continue;
                    }
                };
                for event in translator.on_chunk(chunk) {
                    yield event;
                }
            }

            if !cancelled {
                for event in translator.finish(saw_done) {
                    yield event;
                }
            }
        }))
    }

    #[tracing::instrument(skip(self, params), fields(model = %self.model.id))]
    async fn complete(&self, params: EndpointParams) -> Result<Completion, ProviderError> {
        let payload = create_request(&self.model, &params, false);
        let response = tokio::select! {
            _ = params.cancel.cancelled() => {
                return Err(ProviderError::RequestFailed("request cancelled".to_string()));
            }
            response = self.post(&payload) => response?,
        };
        let metadata = self.metadata_for(&response);
        let body = handle_response_openai_compat(response).await?;
        let mut completion = response_to_completion(body)?;
        completion.metadata.provider = metadata.provider;
        if completion.metadata.model.is_none() {
            completion.metadata.model = metadata.model;
        }
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::providers::base::terminate_at_final;
    use crate::providers::factory::EndpointConfig;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(server: &MockServer) -> OpenAiEndpoint {
        let config = OpenAiEndpointConfig {
            base_url: format!("{}/v1/", server.uri()),
            api_key: Some("sk-test".into()),
            ..Default::default()
        };
        let model = ModelConfig::new("gpt", EndpointConfig::OpenAi(config.clone()));
        OpenAiEndpoint::new(model, &config).unwrap()
    }

    fn sse(chunks: &[Value]) -> String {
        let mut body: String = chunks
            .iter()
            .map(|c| format!("data: {}\n\n", c))
            .collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn params(message: &str) -> EndpointParams {
        EndpointParams {
            messages: vec![Message::user(message)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stream_emits_metadata_tokens_and_final() {
        let server = MockServer::start().await;
        let body = sse(&[
            json!({"choices": [{"index": 0, "delta": {"reasoning_content": "thinking"}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "Hello"}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": " there"}, "finish_reason": "stop"}]}),
        ]);
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt", "stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(INFERENCE_PROVIDER_HEADER, "together")
                    .set_body_raw(body, "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let stream = endpoint(&server).stream(params("hi")).await.unwrap();
        let events: Vec<_> = terminate_at_final(stream)
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(
            events[0],
            GenerationEvent::Metadata(ProviderMetadata {
                model: Some("gpt".into()),
                provider: Some("together".into()),
            })
        );
        match events.last() {
            Some(GenerationEvent::Final { generated_text, .. }) => {
                assert_eq!(generated_text, "<think>thinking</think>Hello there")
            }
            other => panic!("expected final, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_chunks_are_skipped() {
        let server = MockServer::start().await;
        let body = format!(
            ": keep-alive\n\ndata: {{not json\n\n{}",
            sse(&[json!({"choices": [{"index": 0, "delta": {"content": "ok"}, "finish_reason": "stop"}]})])
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let events: Vec<_> = endpoint(&server)
            .stream(params("hi"))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(events.iter().all(|e| e.is_ok()));
        assert!(matches!(
            events.last(),
            Some(Ok(GenerationEvent::Final { generated_text, .. })) if generated_text == "ok"
        ));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "overloaded"})))
            .mount(&server)
            .await;

        let err = endpoint(&server).stream(params("hi")).await.err().unwrap();
        assert!(matches!(err, ProviderError::ServerError(_)));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_cancelled_round_yields_no_final() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse(&[]), "text/event-stream")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut request = params("hi");
        request.cancel = cancel;

        let events: Vec<_> = endpoint(&server).stream(request).await.unwrap().collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_complete_sends_non_streaming_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(INFERENCE_PROVIDER_HEADER, "fireworks")
                    .set_body_json(json!({
                        "id": "r1",
                        "model": "gpt",
                        "choices": [{
                            "index": 0,
                            "finish_reason": "tool_calls",
                            "message": {"role": "assistant", "content": null, "tool_calls": [
                                {"id": "call_9", "type": "function", "function": {"name": "calc", "arguments": "{}"}}
                            ]}
                        }]
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let completion = endpoint(&server).complete(params("hi")).await.unwrap();
        assert_eq!(completion.tool_calls[0].id.as_deref(), Some("call_9"));
        assert_eq!(completion.metadata.provider.as_deref(), Some("fireworks"));
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let config = OpenAiEndpointConfig {
            base_url: "not a url".into(),
            ..Default::default()
        };
        let model = ModelConfig::new("gpt", EndpointConfig::OpenAi(config.clone()));
        let err = OpenAiEndpoint::new(model, &config).unwrap_err();
        assert!(matches!(err, ProviderError::RequestFailed(_)));
    }
}
