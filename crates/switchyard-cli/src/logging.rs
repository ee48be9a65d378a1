use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use etcetera::{choose_app_strategy, AppStrategy};
use once_cell::sync::OnceCell;
use switchyard::config::APP_STRATEGY;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

static INITIALIZED: OnceCell<()> = OnceCell::new();

const DEFAULT_FILTER: &str = "switchyard=info,mcp_client=info";

/// `logs/cli/<date>` under the platform state directory, created if missing.
fn get_log_directory() -> Result<PathBuf> {
    let home = choose_app_strategy(APP_STRATEGY.clone())
        .context("HOME environment variable not set")?;
    let base_log_dir = home
        .in_state_dir("logs/cli")
        .unwrap_or_else(|| home.in_data_dir("logs/cli"));

    let date_dir = base_log_dir.join(chrono::Local::now().format("%Y-%m-%d").to_string());
    fs::create_dir_all(&date_dir)
        .with_context(|| format!("creating log directory {}", date_dir.display()))?;
    Ok(date_dir)
}

/// JSON logs in a per-run file, filtered by `RUST_LOG` when set. Only warnings
/// and errors reach stderr so stdout stays machine-readable.
pub fn setup_logging(name: Option<&str>) -> Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let log_dir = get_log_directory()?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let log_filename = match name {
        Some(name) => format!("{}-{}.log", timestamp, name),
        None => format!("{}.log", timestamp),
    };
    let file_appender = tracing_appender::rolling::RollingFileAppender::new(
        Rotation::NEVER,
        log_dir,
        log_filename,
    );

    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .compact()
        .with_filter(LevelFilter::WARN);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    Registry::default()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("failed to set global subscriber")?;

    let _ = INITIALIZED.set(());
    Ok(())
}
