mod base;
mod settings;

pub use base::{Config, ConfigError, APP_STRATEGY};
pub use settings::GatewaySettings;
