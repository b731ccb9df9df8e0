//! Shared logging configuration and initialization.

use std::env;
use std::path::Path;

use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;
use crate::cutoffs::CutoffReport;
use crate::orders::LoadReport;

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

    if let Ok(level) = env::var("CHURNLAB_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("CHURNLAB_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("CHURNLAB_LOG_TARGET") {
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

pub fn log_app_start(app: &str, config: &LoggingConfig) {
    info!(
        component = app,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_run_start(cfg: &PipelineConfig, store_path: &Path) {
    info!(
        component = "pipeline",
        event = "pipeline.run.start",
        store_path = %store_path.display(),
        horizon_days = cfg.horizon_days,
        lead_time_days = cfg.lead_time_days,
        cutoff_mode = ?cfg.cutoff.mode,
        min_history_orders = cfg.cutoff.min_history_orders,
        min_history_days = cfg.cutoff.min_history_days,
        windows = ?cfg.features.trailing_windows_days,
        partitions = cfg.partitions,
        schema_version = cfg.schema_version
    );
}

pub fn log_run_finish(rows: usize, churned_rows: usize, fingerprint: &str, elapsed_ms: u128) {
    info!(
        component = "pipeline",
        event = "pipeline.run.finish",
        rows,
        churned_rows,
        fingerprint,
        elapsed_ms = elapsed_ms as u64
    );
}

/// Failure event carrying whatever counters were known when the run stopped.
pub fn log_run_failed(
    err: &dyn std::error::Error,
    load: Option<&LoadReport>,
    cutoffs: Option<&CutoffReport>,
) {
    let orders_dropped = load.map(|r| r.orders_dropped).unwrap_or(0);
    let lines_dropped = load.map(|r| r.lines_dropped).unwrap_or(0);
    let duplicate_orders_removed = load.map(|r| r.duplicate_orders_removed).unwrap_or(0);
    let points_selected = cutoffs.map(|r| r.points_selected).unwrap_or(0);
    let points_excluded = cutoffs.map(CutoffReport::excluded_total).unwrap_or(0);
    error!(
        component = "pipeline",
        event = "pipeline.run.failed",
        error = %err,
        orders_read = load.map(|r| r.orders_read).unwrap_or(0),
        orders_dropped,
        lines_dropped,
        duplicate_orders_removed,
        points_selected,
        points_excluded
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
