use std::path::PathBuf;
use std::time::Duration;

use mcp_client::ServerConfig;
use serde::Deserialize;

use super::base::{Config, ConfigError};
use crate::agents::types::DEFAULT_MAX_ITERATIONS;
use crate::model::ModelConfig;
use crate::router::DEFAULT_OTHER_ROUTE;
use crate::tools::ErrorPolicy;

/// Everything the gateway reads from configuration, with defaults applied.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub models: Vec<ModelConfig>,
    pub tool_servers: Vec<ServerConfig>,
    pub router_policy_path: Option<PathBuf>,
    pub router_arch_base_url: Option<String>,
    pub router_arch_model: Option<String>,
    pub router_arch_api_key: Option<String>,
    pub router_other_route: String,
    pub router_fallback_model: Option<String>,
    pub router_multimodal_model: Option<String>,
    pub router_tools_model: Option<String>,
    pub router_arch_timeout: Duration,
    pub router_max_assistant_chars: usize,
    pub router_max_prev_user_chars: usize,
    pub task_model: Option<String>,
    pub tools_call_timeout: Duration,
    pub tools_eta_secs: u64,
    pub tools_list_cache_ttl: Duration,
    pub tools_error_policy: ErrorPolicy,
    pub max_iterations: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            models: Vec::new(),
            tool_servers: Vec::new(),
            router_policy_path: None,
            router_arch_base_url: None,
            router_arch_model: None,
            router_arch_api_key: None,
            router_other_route: DEFAULT_OTHER_ROUTE.to_string(),
            router_fallback_model: None,
            router_multimodal_model: None,
            router_tools_model: None,
            router_arch_timeout: Duration::from_millis(10_000),
            router_max_assistant_chars: 500,
            router_max_prev_user_chars: 400,
            task_model: None,
            tools_call_timeout: Duration::from_secs(30),
            tools_eta_secs: 10,
            tools_list_cache_ttl: Duration::from_secs(60),
            tools_error_policy: ErrorPolicy::Abort,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

fn optional<T: for<'de> Deserialize<'de>>(config: &Config, key: &str) -> Result<Option<T>, ConfigError> {
    match config.get_param(key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let defaults = GatewaySettings::default();
        let secret = |key: &str| config.get_secret::<String>(key).ok();

        Ok(GatewaySettings {
            models: config.get_param_or("models", Vec::new())?,
            tool_servers: config.get_param_or("tool_servers", Vec::new())?,
            router_policy_path: optional(config, "router_policy_path")?,
            router_arch_base_url: optional(config, "router_arch_base_url")?,
            router_arch_model: optional(config, "router_arch_model")?,
            router_arch_api_key: secret("router_arch_api_key"),
            router_other_route: config.get_param_or("router_other_route", defaults.router_other_route)?,
            router_fallback_model: optional(config, "router_fallback_model")?,
            router_multimodal_model: optional(config, "router_multimodal_model")?,
            router_tools_model: optional(config, "router_tools_model")?,
            router_arch_timeout: Duration::from_millis(
                config.get_param_or("router_arch_timeout_ms", 10_000u64)?,
            ),
            router_max_assistant_chars: config
                .get_param_or("router_max_assistant_chars", defaults.router_max_assistant_chars)?,
            router_max_prev_user_chars: config
                .get_param_or("router_max_prev_user_chars", defaults.router_max_prev_user_chars)?,
            task_model: optional(config, "task_model")?,
            tools_call_timeout: Duration::from_secs(config.get_param_or("tools_call_timeout_secs", 30u64)?),
            tools_eta_secs: config.get_param_or("tools_eta_secs", defaults.tools_eta_secs)?,
            tools_list_cache_ttl: Duration::from_secs(
                config.get_param_or("tools_list_cache_ttl_secs", 60u64)?,
            ),
            tools_error_policy: config.get_param_or("tools_error_policy", defaults.tools_error_policy)?,
            max_iterations: config.get_param_or("max_iterations", defaults.max_iterations)?.max(1),
        })
    }

    /// The model used when classification fails: the configured one, else the
    /// first configured model.
    pub fn fallback_model(&self) -> Option<String> {
        self.router_fallback_model
            .clone()
            .or_else(|| self.models.first().map(|m| m.id.clone()))
    }

    pub fn task_model(&self) -> Option<String> {
        self.task_model
            .clone()
            .or_else(|| self.models.first().map(|m| m.id.clone()))
    }
}
