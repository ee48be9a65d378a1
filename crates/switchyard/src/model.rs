use serde::{Deserialize, Serialize};

use crate::generation::ReasoningConfig;
use crate::providers::EndpointConfig;

/// Sampling settings. Every field is optional; unset values fall back to the
/// model's configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
}

impl GenerateSettings {
    /// `overrides` wins wherever it sets a value.
    pub fn merged_with(&self, overrides: &GenerateSettings) -> GenerateSettings {
        GenerateSettings {
            temperature: overrides.temperature.or(self.temperature),
            top_p: overrides.top_p.or(self.top_p),
            max_new_tokens: overrides.max_new_tokens.or(self.max_new_tokens),
            stop: overrides.stop.clone().or_else(|| self.stop.clone()),
            frequency_penalty: overrides.frequency_penalty.or(self.frequency_penalty),
        }
    }

    pub fn stop_sequences(&self) -> &[String] {
        self.stop.as_deref().unwrap_or_default()
    }
}

/// A backend model that routes and candidate lists refer to by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Identifier used by routes and candidate lists
    pub id: String,
    /// Name sent to the backend; defaults to `id`
    #[serde(default)]
    pub name: Option<String>,
    pub endpoint: EndpointConfig,
    /// Default sampling settings
    #[serde(default)]
    pub parameters: GenerateSettings,
    #[serde(default)]
    pub reasoning: Option<ReasoningConfig>,
    #[serde(default)]
    pub preprompt: Option<String>,
    #[serde(default)]
    pub multimodal: bool,
    /// Whether the model accepts tool definitions
    #[serde(default)]
    pub tools: bool,
}

impl ModelConfig {
    pub fn new<S: Into<String>>(id: S, endpoint: EndpointConfig) -> Self {
        ModelConfig {
            id: id.into(),
            name: None,
            endpoint,
            parameters: GenerateSettings::default(),
            reasoning: None,
            preprompt: None,
            multimodal: false,
            tools: false,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn with_reasoning(mut self, reasoning: ReasoningConfig) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    pub fn with_parameters(mut self, parameters: GenerateSettings) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_tools(mut self, tools: bool) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_multimodal(mut self, multimodal: bool) -> Self {
        self.multimodal = multimodal;
        self
    }

    /// The configured reasoning mode, or `<think>` markers when none is set.
    pub fn reasoning_mode(&self) -> ReasoningConfig {
        self.reasoning.clone().unwrap_or_default()
    }

    pub fn reasoning_markers(&self) -> (String, String) {
        let mode = self.reasoning_mode();
        let (begin, end) = mode.markers();
        (begin.to_string(), end.to_string())
    }

    /// Effective settings for one round.
    pub fn settings(&self, overrides: &GenerateSettings) -> GenerateSettings {
        self.parameters.merged_with(overrides)
    }
}
