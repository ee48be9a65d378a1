use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::base::Endpoint;
use super::errors::ProviderError;
use super::openai::OpenAiEndpoint;
use crate::model::ModelConfig;

pub const OPEN_AI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

fn default_base_url() -> String {
    OPEN_AI_DEFAULT_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiEndpointConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Name of the secret to read the key from when `api_key` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OpenAiEndpointConfig {
    fn default() -> Self {
        OpenAiEndpointConfig {
            base_url: default_base_url(),
            api_key: None,
            api_key_env: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// The closed set of backend adapters, selected by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EndpointConfig {
    #[serde(rename = "openai")]
    OpenAi(OpenAiEndpointConfig),
}

pub fn create(model: &ModelConfig) -> Result<Arc<dyn Endpoint>, ProviderError> {
    match &model.endpoint {
        EndpointConfig::OpenAi(config) => Ok(Arc::new(OpenAiEndpoint::new(model.clone(), config)?)),
    }
}

/// Endpoints by model id, in configuration order.
#[derive(Default, Clone)]
pub struct ModelRegistry {
    order: Vec<String>,
    endpoints: HashMap<String, Arc<dyn Endpoint>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(models: &[ModelConfig]) -> Result<Self, ProviderError> {
        let mut registry = Self::new();
        for model in models {
            registry.register(create(model)?);
        }
        Ok(registry)
    }

    /// Add an endpoint, replacing any previous one with the same model id.
    pub fn register(&mut self, endpoint: Arc<dyn Endpoint>) {
        let id = endpoint.model().id.clone();
        if self.endpoints.insert(id.clone(), endpoint).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Endpoint>, ProviderError> {
        self.endpoints
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownModel(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.endpoints.contains_key(id)
    }

    pub fn default_model(&self) -> Option<&str> {
        self.order.first().map(String::as_str)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model(id: &str) -> ModelConfig {
        ModelConfig::new(id, EndpointConfig::OpenAi(OpenAiEndpointConfig::default()))
    }

    #[test]
    fn test_endpoint_config_is_tagged() {
        let config: EndpointConfig = serde_json::from_value(json!({
            "type": "openai",
            "base_url": "http://localhost:8000/v1",
            "headers": {"X-Team": "search"}
        }))
        .unwrap();
        let EndpointConfig::OpenAi(openai) = config;
        assert_eq!(openai.base_url, "http://localhost:8000/v1");
        assert_eq!(openai.timeout_secs, 600);
        assert_eq!(openai.headers.get("X-Team").map(String::as_str), Some("search"));

        let unknown = serde_json::from_value::<EndpointConfig>(json!({"type": "carrier-pigeon"}));
        assert!(unknown.is_err());
    }

    #[test]
    fn test_registry_keeps_configuration_order() {
        let registry = ModelRegistry::from_configs(&[model("b"), model("a"), model("b")]).unwrap();
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(registry.default_model(), Some("b"));
        assert!(registry.get("a").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(ProviderError::UnknownModel(id)) if id == "missing"
        ));
    }
}
