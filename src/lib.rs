//! Churn labels and point-in-time customer features for e-commerce order histories.
//!
//! A run loads order, line-item and product tables into an immutable event log,
//! selects observation points per customer, labels each point by whether the
//! customer ordered again within the horizon, builds RFM and behavioral features
//! from orders at or before the cutoff only, and publishes one versioned feature
//! store file.

mod behavior;
mod config;
mod cutoffs;
mod labels;
mod observability;
mod orders;
mod pipeline;
mod rfm;
mod stats;
mod store;

pub use behavior::{
    behavior_columns, build_behavior_features, BehaviorError, BehaviorFeatures,
    FAVORITE_MIN_ORDERS,
};
pub use config::{
    apply_env_overrides, load_config, validate_config, ConfigError, ConfigStamp, CutoffConfig,
    CutoffMode, FeatureConfig, LoaderConfig, PipelineConfig, FEATURE_SCHEMA_VERSION,
};
pub use cutoffs::{
    customer_groups, select_observation_points, CutoffReport, ExclusionReason, ObservationPoint,
};
pub use labels::{generate_labels, label_window_ms, Label};
pub use observability::{
    init_logging, log_app_start, log_run_failed, log_run_finish, log_run_start,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use orders::{
    load_event_log, load_event_log_into, parse_timestamp_ms, BuildStats, DataQualityError,
    EventLog, LineItem, LineItemRecord, LoadError, LoadReport, LoadResult, MalformedRecordError,
    OrderEvent, OrderRecord, ProductRecord, SourcePaths, SourceTable, Timeline,
    UnknownCustomerError, DAY_MS,
};
pub use pipeline::{build_feature_table, run_pipeline, FeatureTable, PipelineError, RunReport};
pub use rfm::{build_rfm_features, rfm_columns, RfmFeatures};
pub use stats::{linear_slope, mean, std_dev};
pub use store::{
    assemble_feature_rows, assert_schema_compatible, build_feature_schema, persist_feature_store,
    read_feature_store, FeatureColumn, FeatureDType, FeatureRow, FeatureSchema, FeatureStore,
    FeatureValue, StoreError, LABEL_COLUMN,
};
