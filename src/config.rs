//! Pipeline configuration: one immutable value threaded through every stage.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CutoffMode {
    /// One cutoff per customer: the latest day boundary that satisfies every constraint.
    LatestFeasible,
    /// A cutoff every `stride_days` across the customer's feasible range.
    Rolling { stride_days: u32 },
    /// The same calendar cutoff for every customer.
    FixedDate { cutoff_ts_ms_utc: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CutoffConfig {
    pub mode: CutoffMode,
    pub min_history_orders: u32,
    pub min_history_days: u32,
    pub require_later_order: bool,
}

impl Default for CutoffConfig {
    fn default() -> Self {
        Self {
            mode: CutoffMode::LatestFeasible,
            min_history_orders: 3,
            min_history_days: 30,
            require_later_order: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub trailing_windows_days: Vec<u32>,
    pub trend_min_samples: usize,
    pub trend_bucket_days: u32,
    pub trend_buckets: usize,
    pub basket_trend_orders: usize,
    pub trend_neutral_value: f64,
    pub timezone: String,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            trailing_windows_days: vec![7, 30, 90],
            trend_min_samples: 3,
            trend_bucket_days: 30,
            trend_buckets: 6,
            basket_trend_orders: 10,
            trend_neutral_value: 0.0,
            timezone: "UTC".to_string(),
        }
    }
}

impl FeatureConfig {
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub max_drop_rate: f64,
    pub category_column: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_drop_rate: 0.05,
            category_column: "category_id".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub horizon_days: u32,
    pub lead_time_days: u32,
    pub cutoff: CutoffConfig,
    pub features: FeatureConfig,
    pub loader: LoaderConfig,
    /// Number of customer partitions for the builder fan-out; 0 uses one per worker thread.
    pub partitions: usize,
    pub schema_version: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            horizon_days: 30,
            lead_time_days: 0,
            cutoff: CutoffConfig::default(),
            features: FeatureConfig::default(),
            loader: LoaderConfig::default(),
            partitions: 0,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

/// The part of the configuration that determines store contents.
///
/// `partitions` is excluded: it changes how work is scheduled, never what is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigStamp {
    pub schema_version: u32,
    pub horizon_days: u32,
    pub lead_time_days: u32,
    pub cutoff: CutoffConfig,
    pub features: FeatureConfig,
    pub category_column: String,
}

impl PipelineConfig {
    pub fn stamp(&self) -> ConfigStamp {
        ConfigStamp {
            schema_version: self.schema_version,
            horizon_days: self.horizon_days,
            lead_time_days: self.lead_time_days,
            cutoff: self.cutoff.clone(),
            features: self.features.clone(),
            category_column: self.loader.category_column.clone(),
        }
    }
}

impl ConfigStamp {
    /// Configuration that reproduces this stamp, with default scheduling.
    pub fn to_config(&self) -> PipelineConfig {
        PipelineConfig {
            horizon_days: self.horizon_days,
            lead_time_days: self.lead_time_days,
            cutoff: self.cutoff.clone(),
            features: self.features.clone(),
            loader: LoaderConfig {
                category_column: self.category_column.clone(),
                ..LoaderConfig::default()
            },
            partitions: 0,
            schema_version: self.schema_version,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),
}

pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let raw = fs::read_to_string(path)?;
    let cfg: PipelineConfig = serde_json::from_str(&raw)?;
    Ok(cfg)
}

/// Applies `CHURNLAB_*` overrides on top of `cfg`. Unparsable values are ignored with a warning.
pub fn apply_env_overrides(mut cfg: PipelineConfig) -> PipelineConfig {
    if let Some(v) = env_parsed::<u32>("CHURNLAB_HORIZON_DAYS") {
        cfg.horizon_days = v;
    }
    if let Some(v) = env_parsed::<u32>("CHURNLAB_LEAD_TIME_DAYS") {
        cfg.lead_time_days = v;
    }
    if let Some(v) = env_parsed::<u32>("CHURNLAB_MIN_HISTORY_ORDERS") {
        cfg.cutoff.min_history_orders = v;
    }
    if let Some(v) = env_parsed::<u32>("CHURNLAB_MIN_HISTORY_DAYS") {
        cfg.cutoff.min_history_days = v;
    }
    if let Some(v) = env_parsed::<usize>("CHURNLAB_TREND_MIN_SAMPLES") {
        cfg.features.trend_min_samples = v;
    }
    if let Some(v) = env_parsed::<f64>("CHURNLAB_MAX_DROP_RATE") {
        cfg.loader.max_drop_rate = v;
    }
    if let Some(v) = env_parsed::<usize>("CHURNLAB_PARTITIONS") {
        cfg.partitions = v;
    }
    if let Some(raw) = env_trimmed("CHURNLAB_TIMEZONE") {
        cfg.features.timezone = raw;
    }
    if let Some(raw) = env_trimmed("CHURNLAB_TRAILING_WINDOWS_DAYS") {
        match parse_window_list(&raw) {
            Some(windows) => cfg.features.trailing_windows_days = windows,
            None => warn!(
                component = "config",
                event = "config.env.ignored",
                key = "CHURNLAB_TRAILING_WINDOWS_DAYS",
                value = %raw
            ),
        }
    }
    cfg
}

pub fn validate_config(cfg: &PipelineConfig) -> Result<(), ConfigError> {
    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(ConfigError::Invalid(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }
    if cfg.horizon_days == 0 {
        return Err(ConfigError::Invalid("horizon_days must be > 0".to_string()));
    }
    if cfg.cutoff.min_history_orders == 0 {
        return Err(ConfigError::Invalid(
            "cutoff.min_history_orders must be >= 1".to_string(),
        ));
    }
    if let CutoffMode::Rolling { stride_days } = cfg.cutoff.mode {
        if stride_days == 0 {
            return Err(ConfigError::Invalid(
                "cutoff.mode.stride_days must be > 0".to_string(),
            ));
        }
    }

    let features = &cfg.features;
    if features.trailing_windows_days.is_empty() {
        return Err(ConfigError::Invalid(
            "features.trailing_windows_days must not be empty".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for window in &features.trailing_windows_days {
        if *window == 0 {
            return Err(ConfigError::Invalid(
                "features.trailing_windows_days entries must be > 0".to_string(),
            ));
        }
        if !seen.insert(*window) {
            return Err(ConfigError::Invalid(
                "features.trailing_windows_days entries must be unique".to_string(),
            ));
        }
    }
    if features.trend_min_samples < 3 {
        return Err(ConfigError::Invalid(
            "features.trend_min_samples must be >= 3".to_string(),
        ));
    }
    if features.trend_bucket_days == 0 {
        return Err(ConfigError::Invalid(
            "features.trend_bucket_days must be > 0".to_string(),
        ));
    }
    if features.trend_buckets < features.trend_min_samples {
        return Err(ConfigError::Invalid(
            "features.trend_buckets must be >= features.trend_min_samples".to_string(),
        ));
    }
    if features.basket_trend_orders < features.trend_min_samples {
        return Err(ConfigError::Invalid(
            "features.basket_trend_orders must be >= features.trend_min_samples".to_string(),
        ));
    }
    if !features.trend_neutral_value.is_finite() {
        return Err(ConfigError::Invalid(
            "features.trend_neutral_value must be finite".to_string(),
        ));
    }
    features.tz()?;

    let rate = cfg.loader.max_drop_rate;
    if !(0.0..=1.0).contains(&rate) {
        return Err(ConfigError::Invalid(
            "loader.max_drop_rate must be within [0, 1]".to_string(),
        ));
    }
    if cfg.loader.category_column.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "loader.category_column must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn env_trimmed(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_trimmed(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                component = "config",
                event = "config.env.ignored",
                key,
                value = %raw
            );
            None
        }
    }
}

fn parse_window_list(raw: &str) -> Option<Vec<u32>> {
    raw.split(',')
        .map(|part| part.trim().parse::<u32>().ok())
        .collect()
}
