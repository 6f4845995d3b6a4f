//! Shared logging configuration and initialization.

use std::env;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{parse_bool, BuildConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("FEATMAT_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("FEATMAT_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("FEATMAT_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_build_start(logging: &LoggingConfig, build: &BuildConfig) {
    info!(
        component = "build_feature_matrix",
        event = "app.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        sentinel_result_value = build.sentinel_result_value,
        default_day_bins = ?build.default_day_bins,
        cache_events = build.cache_events
    );
}

pub fn log_inputs_selected(episodes: &Path, store: &Path, plan: Option<&Path>) {
    match plan {
        Some(plan) => info!(
            component = "build_feature_matrix",
            event = "inputs.selected",
            episodes = %episodes.display(),
            store = %store.display(),
            plan = %plan.display()
        ),
        None => info!(
            component = "build_feature_matrix",
            event = "inputs.selected",
            episodes = %episodes.display(),
            store = %store.display()
        ),
    }
}

pub fn log_matrix_written(output: &Path, rows: usize, columns: usize, fingerprint: &str) {
    info!(
        component = "build_feature_matrix",
        event = "matrix.output.written",
        output = %output.display(),
        rows,
        columns,
        fingerprint
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}
