use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Invalid response: {0}")]
    ResponseParseError(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),
}

impl ProviderError {
    /// Failures of the round itself, which move the turn on to the next candidate.
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            ProviderError::ExecutionError(_) | ProviderError::UnknownModel(_)
        )
    }
}

impl From<anyhow::Error> for ProviderError {
    fn from(error: anyhow::Error) -> Self {
        ProviderError::ExecutionError(error.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Timeout(error.to_string())
        } else {
            ProviderError::RequestFailed(error.to_string())
        }
    }
}

#[derive(serde::Deserialize, Debug)]
pub struct OpenAIError {
    #[serde(default, deserialize_with = "code_as_string")]
    pub code: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "type")]
    pub error_type: Option<String>,
}

fn code_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl OpenAIError {
    pub fn is_context_length_exceeded(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some("context_length_exceeded") | Some("string_above_max_length")
        )
    }
}

impl std::fmt::Display for OpenAIError {
    /// "Invalid API key (code: invalid_api_key, type: client_error)", or just the
    /// message when there is no code or type.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        let details: Vec<String> = [
            self.code.as_ref().map(|c| format!("code: {}", c)),
            self.error_type.as_ref().map(|t| format!("type: {}", t)),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !details.is_empty() {
            write!(f, " ({})", details.join(", "))?;
        }
        Ok(())
    }
}
