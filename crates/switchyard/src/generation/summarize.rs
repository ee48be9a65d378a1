use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::model::GenerateSettings;
use crate::prompt_template;
use crate::providers::{Endpoint, EndpointParams, ProviderError};

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, reasoning: &str) -> Result<String, ProviderError>;
}

/// Summarizes with one non-streaming call to a configured model.
pub struct EndpointSummarizer {
    endpoint: Arc<dyn Endpoint>,
    cancel: CancellationToken,
}

impl EndpointSummarizer {
    pub fn new(endpoint: Arc<dyn Endpoint>, cancel: CancellationToken) -> Self {
        Self { endpoint, cancel }
    }
}

#[async_trait]
impl Summarizer for EndpointSummarizer {
    async fn summarize(&self, reasoning: &str) -> Result<String, ProviderError> {
        let prompt = prompt_template::render_global_file(
            "summarize_reasoning.md",
            &json!({ "reasoning": reasoning }),
        )
        .map_err(|e| ProviderError::ExecutionError(e.to_string()))?;

        let completion = self
            .endpoint
            .complete(EndpointParams {
                messages: vec![Message::user(prompt)],
                settings: GenerateSettings {
                    max_new_tokens: Some(256),
                    ..Default::default()
                },
                cancel: self.cancel.clone(),
                ..Default::default()
            })
            .await?;

        let summary = completion.text.trim().to_string();
        if summary.is_empty() {
            return Err(ProviderError::ResponseParseError(
                "summary was empty".to_string(),
            ));
        }
        Ok(summary)
    }
}
