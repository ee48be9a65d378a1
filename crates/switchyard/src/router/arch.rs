//! Intent classification with a dedicated routing model.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::policy::Route;
use crate::message::{Message, Role};
use crate::prompt_template;
use crate::providers::formats::openai::response_to_completion;
use crate::providers::utils::handle_response_openai_compat;
use crate::providers::ProviderError;
use crate::utils::truncate_middle;

static ROUTE_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"["']?route["']?\s*:\s*["']([^"']+)["']"#).expect("ROUTE_FIELD is a valid pattern")
});

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier timed out after {0}ms")]
    Timeout(u128),
    #[error("classifier call cancelled")]
    Cancelled,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("failed to render classifier prompt: {0}")]
    Template(#[from] minijinja::Error),
    #[error("no route in classifier response: {0}")]
    Unparseable(String),
}

#[derive(Debug, Clone)]
pub struct ArchSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_assistant_chars: usize,
    pub max_prev_user_chars: usize,
    pub other_route: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// The conversation as shown to the classifier. The latest user turn is kept
/// whole; earlier user turns and assistant turns are cut in the middle.
pub fn trim_conversation(
    messages: &[Message],
    max_assistant_chars: usize,
    max_prev_user_chars: usize,
) -> Vec<PromptMessage> {
    let latest_user = messages.iter().rposition(|m| m.role == Role::User);
    messages
        .iter()
        .enumerate()
        .filter_map(|(i, m)| {
            let content = match m.role {
                Role::User if Some(i) == latest_user => m.content.clone(),
                Role::User => truncate_middle(&m.content, max_prev_user_chars),
                Role::Assistant if !m.content.trim().is_empty() => {
                    truncate_middle(&m.content, max_assistant_chars)
                }
                _ => return None,
            };
            Some(PromptMessage {
                role: m.role,
                content,
            })
        })
        .collect()
}

/// Best-effort extraction of `{"route": name}` from a model reply.
pub fn parse_route(reply: &str) -> Option<String> {
    let candidate = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => reply,
    };

    let from_json = |text: &str| -> Option<String> {
        serde_json::from_str::<Value>(text)
            .ok()?
            .get("route")?
            .as_str()
            .map(|s| s.trim().to_string())
    };

    from_json(candidate)
        .or_else(|| from_json(&candidate.replace('\'', "\"")))
        .or_else(|| {
            ROUTE_FIELD
                .captures(candidate)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
        })
        .filter(|route| !route.is_empty())
}

pub struct ArchClassifier {
    client: Client,
    settings: ArchSettings,
}

impl ArchClassifier {
    pub fn new(settings: ArchSettings) -> Result<Self, ProviderError> {
        let client = Client::builder().build()?;
        Ok(ArchClassifier { client, settings })
    }

    pub fn settings(&self) -> &ArchSettings {
        &self.settings
    }

    pub fn build_prompt(&self, routes: &[Route], messages: &[Message]) -> Result<String, minijinja::Error> {
        let conversation = trim_conversation(
            messages,
            self.settings.max_assistant_chars,
            self.settings.max_prev_user_chars,
        );
        prompt_template::render_global_file(
            "arch_router.md",
            &json!({
                "routes": routes,
                "conversation": conversation,
                "other_route": self.settings.other_route,
            }),
        )
    }

    async fn call(&self, prompt: String) -> Result<String, ProviderError> {
        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let mut request = self.client.post(url).json(&json!({
            "model": self.settings.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": 16,
            "temperature": 0,
            "stream": false,
        }));
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }
        let body = handle_response_openai_compat(request.send().await?).await?;
        Ok(response_to_completion(body)?.text)
    }

    /// Ask the routing model for a route name. The name is not checked against
    /// the policy here.
    #[tracing::instrument(skip_all, fields(model = %self.settings.model))]
    pub async fn classify(
        &self,
        routes: &[Route],
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, ClassifierError> {
        let prompt = self.build_prompt(routes, messages)?;
        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(ClassifierError::Cancelled),
            reply = tokio::time::timeout(self.settings.timeout, self.call(prompt)) => reply,
        };
        let reply = reply.map_err(|_| ClassifierError::Timeout(self.settings.timeout.as_millis()))??;
        parse_route(&reply).ok_or(ClassifierError::Unparseable(reply))
    }
}
