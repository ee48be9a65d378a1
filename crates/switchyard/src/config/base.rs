use etcetera::{choose_app_strategy, AppStrategy, AppStrategyArgs};
use once_cell::sync::{Lazy, OnceCell};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub static APP_STRATEGY: Lazy<AppStrategyArgs> = Lazy::new(|| AppStrategyArgs {
    top_level_domain: "dev".to_string(),
    author: "switchyard".to_string(),
    app_name: "switchyard".to_string(),
});

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration value not found: {0}")]
    NotFound(String),
    #[error("Failed to deserialize value: {0}")]
    DeserializeError(String),
    #[error("Failed to read config file: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Failed to resolve config directory: {0}")]
    DirectoryError(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::DeserializeError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::DeserializeError(err.to_string())
    }
}

/// Layered key/value configuration.
///
/// Values are looked up with the following precedence:
/// 1. Environment variables (the key upper-cased)
/// 2. The YAML configuration file (`$SWITCHYARD_CONFIG_PATH`, else
///    `~/.config/switchyard/config.yaml`)
///
/// Secrets follow the same order but read `secrets.yaml` next to the config file.
///
/// Keys are snake_case; `router_policy_path` is overridden by `ROUTER_POLICY_PATH`.
/// Environment values are parsed as JSON when possible, so lists and numbers can be
/// supplied inline.
pub struct Config {
    config_path: PathBuf,
    secrets_path: PathBuf,
}

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

impl Config {
    /// Get the global configuration instance, resolving the default path on first use.
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(|| {
            Config::from_default_location().unwrap_or_else(|e| {
                tracing::warn!("{}; falling back to ./config.yaml", e);
                Config::new("config.yaml")
            })
        })
    }

    fn from_default_location() -> Result<Config, ConfigError> {
        if let Ok(path) = env::var("SWITCHYARD_CONFIG_PATH") {
            return Ok(Config::new(path));
        }
        let config_dir = choose_app_strategy(APP_STRATEGY.clone())
            .map_err(|e| ConfigError::DirectoryError(e.to_string()))?
            .config_dir();
        Ok(Config::new(config_dir.join("config.yaml")))
    }

    /// Create a configuration reading the given file. The file need not exist.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        let config_path = config_path.as_ref().to_path_buf();
        let secrets_path = config_path.with_file_name("secrets.yaml");
        Config {
            config_path,
            secrets_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    pub fn load_values(&self) -> Result<HashMap<String, Value>, ConfigError> {
        load_yaml_map(&self.config_path)
    }

    /// Get a configuration value, deserialized into `T`.
    ///
    /// # Errors
    ///
    /// `NotFound` when neither the environment nor the file has the key, and
    /// `DeserializeError` when the value does not fit `T`.
    pub fn get_param<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T, ConfigError> {
        if let Some(value) = env_override(key) {
            return Ok(serde_json::from_value(value)?);
        }

        let values = self.load_values()?;
        values
            .get(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
            .and_then(|v| Ok(serde_json::from_value(v.clone())?))
    }

    /// Like [`Config::get_param`], with `default` when the key is absent.
    pub fn get_param_or<T: for<'de> Deserialize<'de>>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        match self.get_param(key) {
            Err(ConfigError::NotFound(_)) => Ok(default),
            other => other,
        }
    }

    /// Get a secret from the environment or the secrets file.
    pub fn get_secret<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T, ConfigError> {
        if let Some(value) = env_override(key) {
            return Ok(serde_json::from_value(value)?);
        }

        let values = load_yaml_map(&self.secrets_path)?;
        values
            .get(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
            .and_then(|v| Ok(serde_json::from_value(v.clone())?))
    }
}

fn env_override(key: &str) -> Option<Value> {
    let val = env::var(key.to_uppercase()).ok()?;
    Some(serde_json::from_str(&val).unwrap_or(Value::String(val)))
}

fn load_yaml_map(path: &Path) -> Result<HashMap<String, Value>, ConfigError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&content)?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    match json_value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Ok(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn config_with(contents: &str) -> (NamedTempFile, Config) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let config = Config::new(file.path());
        (file, config)
    }

    #[test]
    #[serial]
    fn test_file_value_and_env_override() -> Result<(), ConfigError> {
        let (_file, config) = config_with("test_sw_key: file_value\n");

        let value: String = config.get_param("test_sw_key")?;
        assert_eq!(value, "file_value");

        temp_env::with_var("TEST_SW_KEY", Some("env_value"), || {
            let value: String = config.get_param("test_sw_key").unwrap();
            assert_eq!(value, "env_value");
        });
        Ok(())
    }

    #[test]
    #[serial]
    fn test_env_values_parse_as_json() {
        let (_file, config) = config_with("");
        temp_env::with_var("TEST_SW_LIST", Some(r#"["a", "b"]"#), || {
            let value: Vec<String> = config.get_param("test_sw_list").unwrap();
            assert_eq!(value, vec!["a", "b"]);
        });
    }

    #[test]
    fn test_complex_type() -> Result<(), ConfigError> {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Server {
            name: String,
            url: String,
        }

        let (_file, config) = config_with(
            "tool_servers:\n  - name: calc\n    url: http://localhost:9000/mcp\n",
        );
        let servers: Vec<Server> = config.get_param("tool_servers")?;
        assert_eq!(servers[0].name, "calc");
        assert_eq!(servers[0].url, "http://localhost:9000/mcp");
        Ok(())
    }

    #[test]
    fn test_missing_value_and_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path().join("absent.yaml"));

        let result: Result<String, ConfigError> = config.get_param("nonexistent_sw_key");
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
        assert_eq!(config.get_param_or("nonexistent_sw_key", 7u32).unwrap(), 7);
    }

    #[test]
    fn test_secrets_file_next_to_config() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("secrets.yaml"), "sw_test_api_key: sk-123\n").unwrap();
        let config = Config::new(dir.path().join("config.yaml"));

        let secret: String = config.get_secret("sw_test_api_key").unwrap();
        assert_eq!(secret, "sk-123");
    }
}
