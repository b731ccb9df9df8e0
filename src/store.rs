//! Feature store assembly and persistence.
//!
//! Builder outputs are joined on `(customer_id, cutoff_ts_ms_utc)` against the
//! selector's key set, checked for lookahead and non-finite values, and written to a
//! single SQLite file published by atomic rename.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::behavior::{behavior_columns, BehaviorFeatures};
use crate::config::{ConfigStamp, CutoffMode, PipelineConfig};
use crate::cutoffs::ObservationPoint;
use crate::labels::Label;
use crate::rfm::{rfm_columns, RfmFeatures};

pub const LABEL_COLUMN: &str = "is_churned";
const ROWS_TABLE: &str = "feature_rows";
const METADATA_TABLE: &str = "store_metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
    I64,
    Bool,
}

impl FeatureDType {
    fn sql_type(self) -> &'static str {
        match self {
            Self::F64 => "REAL",
            Self::I64 | Self::Bool => "INTEGER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

impl FeatureColumn {
    pub fn new(name: impl Into<String>, dtype: FeatureDType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    F64(f64),
    I64(i64),
    Bool(bool),
}

impl FeatureValue {
    pub fn dtype(&self) -> FeatureDType {
        match self {
            Self::F64(_) => FeatureDType::F64,
            Self::I64(_) => FeatureDType::I64,
            Self::Bool(_) => FeatureDType::Bool,
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            Self::F64(value) => value.is_finite(),
            Self::I64(_) | Self::Bool(_) => true,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Self::F64(value) => *value,
            Self::I64(value) => *value as f64,
            Self::Bool(value) => f64::from(u8::from(*value)),
        }
    }

    fn to_sql(self) -> Value {
        match self {
            Self::F64(value) => Value::Real(value),
            Self::I64(value) => Value::Integer(value),
            Self::Bool(value) => Value::Integer(i64::from(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub customer_id: String,
    pub cutoff_ts_ms_utc: i64,
    pub is_churned: bool,
    pub values: Vec<FeatureValue>,
}

/// A persisted store read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStore {
    pub schema: FeatureSchema,
    pub stamp: ConfigStamp,
    pub label_column: String,
    pub rows: Vec<FeatureRow>,
}

impl FeatureStore {
    pub fn churned_count(&self) -> usize {
        self.rows.iter().filter(|row| row.is_churned).count()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.columns.iter().position(|c| c.name == name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{builder} key set does not match the observation points: {reason}")]
    SchemaMismatch { builder: String, reason: String },
    #[error(
        "{builder} read input at {input_ts_ms_utc} for {customer_id} with cutoff {cutoff_ts_ms_utc}"
    )]
    LookaheadViolation {
        builder: String,
        customer_id: String,
        cutoff_ts_ms_utc: i64,
        input_ts_ms_utc: i64,
    },
    #[error("non-finite value in column {column} for {customer_id} at {cutoff_ts_ms_utc}")]
    NonFiniteValue {
        column: String,
        customer_id: String,
        cutoff_ts_ms_utc: i64,
    },
    #[error("row has {actual} values but the schema declares {expected} columns")]
    ColumnCountMismatch { expected: usize, actual: usize },
    #[error("column {column} expects {expected:?}, got {actual:?}")]
    ColumnTypeMismatch {
        column: String,
        expected: FeatureDType,
        actual: FeatureDType,
    },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error("feature store not found at {0}")]
    MissingStore(PathBuf),
    #[error("feature store metadata is missing key {0}")]
    MissingMetadata(String),
    #[error("invalid store path: {0}")]
    InvalidPath(PathBuf),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Label and feature columns in persisted order.
pub fn build_feature_schema(cfg: &PipelineConfig) -> FeatureSchema {
    let mut columns = rfm_columns(cfg);
    columns.extend(behavior_columns());
    let fingerprint = schema_fingerprint(&cfg.stamp(), &columns);

    info!(
        component = "store",
        event = "store.schema.built",
        version = cfg.schema_version,
        horizon_days = cfg.horizon_days,
        windows = ?cfg.features.trailing_windows_days,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), StoreError> {
    if expected_version != actual.version {
        return Err(StoreError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(StoreError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Joins builder outputs into rows keyed and ordered by observation point.
///
/// Every builder must produce exactly the key set of `points`.
pub fn assemble_feature_rows(
    schema: &FeatureSchema,
    points: &[ObservationPoint],
    labels: Vec<Label>,
    rfm: Vec<(ObservationPoint, RfmFeatures)>,
    behavior: Vec<(ObservationPoint, BehaviorFeatures)>,
) -> Result<Vec<FeatureRow>, StoreError> {
    let expected: BTreeSet<&ObservationPoint> = points.iter().collect();
    if expected.len() != points.len() {
        return Err(StoreError::SchemaMismatch {
            builder: "cutoffs".to_string(),
            reason: "duplicate observation points".to_string(),
        });
    }

    let labels = keyed(
        "labels",
        labels.into_iter().map(|label| (label.point.clone(), label)),
        &expected,
    )?;
    let rfm = keyed("rfm", rfm, &expected)?;
    let behavior = keyed("behavior", behavior, &expected)?;

    let mut rows = Vec::with_capacity(points.len());
    for ((point, label), ((_, rfm), (_, behavior))) in labels
        .into_iter()
        .zip(rfm.into_iter().zip(behavior))
    {
        check_provenance("rfm", &point, rfm.last_input_ts_ms_utc)?;
        check_provenance("behavior", &point, behavior.last_input_ts_ms_utc)?;

        let mut values = rfm.values();
        values.extend(behavior.values());
        let row = FeatureRow {
            customer_id: point.customer_id,
            cutoff_ts_ms_utc: point.cutoff_ts_ms_utc,
            is_churned: label.is_churned,
            values,
        };
        validate_row(schema, &row)?;
        rows.push(row);
    }

    Ok(rows)
}

fn keyed<T>(
    builder: &str,
    items: impl IntoIterator<Item = (ObservationPoint, T)>,
    expected: &BTreeSet<&ObservationPoint>,
) -> Result<BTreeMap<ObservationPoint, T>, StoreError> {
    let mut map = BTreeMap::new();
    for (point, item) in items {
        if !expected.contains(&point) {
            return Err(StoreError::SchemaMismatch {
                builder: builder.to_string(),
                reason: format!(
                    "unexpected key ({}, {})",
                    point.customer_id, point.cutoff_ts_ms_utc
                ),
            });
        }
        let reason = format!(
            "duplicate key ({}, {})",
            point.customer_id, point.cutoff_ts_ms_utc
        );
        if map.insert(point, item).is_some() {
            return Err(StoreError::SchemaMismatch {
                builder: builder.to_string(),
                reason,
            });
        }
    }
    if map.len() != expected.len() {
        return Err(StoreError::SchemaMismatch {
            builder: builder.to_string(),
            reason: format!("{} of {} keys missing", expected.len() - map.len(), expected.len()),
        });
    }
    Ok(map)
}

fn check_provenance(
    builder: &str,
    point: &ObservationPoint,
    input_ts_ms_utc: Option<i64>,
) -> Result<(), StoreError> {
    match input_ts_ms_utc {
        Some(input_ts_ms_utc) if input_ts_ms_utc > point.cutoff_ts_ms_utc => {
            Err(StoreError::LookaheadViolation {
                builder: builder.to_string(),
                customer_id: point.customer_id.clone(),
                cutoff_ts_ms_utc: point.cutoff_ts_ms_utc,
                input_ts_ms_utc,
            })
        }
        _ => Ok(()),
    }
}

fn validate_row(schema: &FeatureSchema, row: &FeatureRow) -> Result<(), StoreError> {
    if row.values.len() != schema.columns.len() {
        return Err(StoreError::ColumnCountMismatch {
            expected: schema.columns.len(),
            actual: row.values.len(),
        });
    }
    for (column, value) in schema.columns.iter().zip(&row.values) {
        if column.dtype != value.dtype() {
            return Err(StoreError::ColumnTypeMismatch {
                column: column.name.clone(),
                expected: column.dtype,
                actual: value.dtype(),
            });
        }
        if !value.is_finite() {
            return Err(StoreError::NonFiniteValue {
                column: column.name.clone(),
                customer_id: row.customer_id.clone(),
                cutoff_ts_ms_utc: row.cutoff_ts_ms_utc,
            });
        }
    }
    Ok(())
}

/// Removes the temporary file unless the publish completed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = fs::remove_file(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        component = "store",
                        event = "store.tmp.cleanup_failed",
                        path = %self.path.display(),
                        error = %err
                    );
                }
            }
        }
    }
}

/// Writes the store to a sibling temporary file and renames it over `path`.
///
/// On any failure the previous file at `path`, if any, is left untouched.
pub fn persist_feature_store(
    path: &Path,
    schema: &FeatureSchema,
    stamp: &ConfigStamp,
    rows: &[FeatureRow],
) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| StoreError::InvalidPath(path.to_path_buf()))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    if tmp_path.exists() {
        fs::remove_file(&tmp_path)?;
    }
    let guard = TempFileGuard {
        path: tmp_path.clone(),
        armed: true,
    };

    info!(
        component = "store",
        event = "store.persist.start",
        path = %path.display(),
        rows = rows.len(),
        fingerprint = %schema.fingerprint
    );

    write_store(&tmp_path, schema, stamp, rows)?;
    fs::File::open(&tmp_path)?.sync_all()?;
    fs::rename(&tmp_path, path)?;
    guard.disarm();

    info!(
        component = "store",
        event = "store.persist.finish",
        path = %path.display(),
        rows = rows.len(),
        churned_rows = rows.iter().filter(|row| row.is_churned).count()
    );
    Ok(())
}

fn write_store(
    path: &Path,
    schema: &FeatureSchema,
    stamp: &ConfigStamp,
    rows: &[FeatureRow],
) -> Result<(), StoreError> {
    let mut conn = Connection::open(path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=DELETE;
        PRAGMA synchronous=FULL;
        PRAGMA temp_store=MEMORY;
        ",
    )?;

    let feature_ddl: Vec<String> = schema
        .columns
        .iter()
        .map(|column| format!("\"{}\" {} NOT NULL", column.name, column.dtype.sql_type()))
        .collect();
    conn.execute_batch(&format!(
        "
        CREATE TABLE {METADATA_TABLE} (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        ) WITHOUT ROWID;
        CREATE TABLE {ROWS_TABLE} (
            customer_id TEXT NOT NULL,
            cutoff_ts_ms_utc INTEGER NOT NULL,
            {LABEL_COLUMN} INTEGER NOT NULL,
            {},
            PRIMARY KEY (customer_id, cutoff_ts_ms_utc)
        ) WITHOUT ROWID;
        ",
        feature_ddl.join(",\n            ")
    ))?;

    let churned = rows.iter().filter(|row| row.is_churned).count();
    let metadata = [
        ("schema_version", schema.version.to_string()),
        ("schema_fingerprint", schema.fingerprint.clone()),
        ("columns", serde_json::to_string(&schema.columns)?),
        ("config_stamp", serde_json::to_string(stamp)?),
        ("label_column", LABEL_COLUMN.to_string()),
        ("row_count", rows.len().to_string()),
        ("churned_count", churned.to_string()),
    ];

    let placeholders: Vec<String> = (1..=schema.columns.len() + 3)
        .map(|idx| format!("?{idx}"))
        .collect();
    let insert_sql = format!(
        "INSERT INTO {ROWS_TABLE} VALUES ({})",
        placeholders.join(", ")
    );

    let tx = conn.transaction()?;
    {
        let mut meta_stmt =
            tx.prepare(&format!("INSERT INTO {METADATA_TABLE} (key, value) VALUES (?1, ?2)"))?;
        for (key, value) in &metadata {
            meta_stmt.execute(params![key, value])?;
        }

        let mut row_stmt = tx.prepare(&insert_sql)?;
        for row in rows {
            let mut sql_values = Vec::with_capacity(row.values.len() + 3);
            sql_values.push(Value::Text(row.customer_id.clone()));
            sql_values.push(Value::Integer(row.cutoff_ts_ms_utc));
            sql_values.push(Value::Integer(i64::from(row.is_churned)));
            sql_values.extend(row.values.iter().map(|value| value.to_sql()));
            row_stmt.execute(params_from_iter(sql_values))?;
        }
    }
    tx.commit()?;

    conn.close().map_err(|(_, err)| StoreError::Sqlite(err))?;
    Ok(())
}

pub fn read_feature_store(path: &Path) -> Result<FeatureStore, StoreError> {
    if !path.is_file() {
        return Err(StoreError::MissingStore(path.to_path_buf()));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let metadata: BTreeMap<String, String> = {
        let mut stmt = conn.prepare(&format!("SELECT key, value FROM {METADATA_TABLE}"))?;
        let pairs = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let collected = pairs.collect::<Result<BTreeMap<String, String>, _>>()?;
        collected
    };
    let meta = |key: &str| -> Result<&String, StoreError> {
        metadata
            .get(key)
            .ok_or_else(|| StoreError::MissingMetadata(key.to_string()))
    };

    let version = meta("schema_version")?.parse::<u32>().map_err(|_| {
        StoreError::MissingMetadata("schema_version (not an integer)".to_string())
    })?;
    let schema = FeatureSchema {
        version,
        fingerprint: meta("schema_fingerprint")?.clone(),
        columns: serde_json::from_str(meta("columns")?)?,
    };
    let stamp: ConfigStamp = serde_json::from_str(meta("config_stamp")?)?;
    let label_column = meta("label_column")?.clone();

    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {ROWS_TABLE} ORDER BY customer_id, cutoff_ts_ms_utc"
    ))?;
    let rows = stmt
        .query_map([], |row| {
            let mut values = Vec::with_capacity(schema.columns.len());
            for (offset, column) in schema.columns.iter().enumerate() {
                let idx = offset + 3;
                values.push(match column.dtype {
                    FeatureDType::F64 => FeatureValue::F64(row.get(idx)?),
                    FeatureDType::I64 => FeatureValue::I64(row.get(idx)?),
                    FeatureDType::Bool => FeatureValue::Bool(row.get::<_, i64>(idx)? != 0),
                });
            }
            Ok(FeatureRow {
                customer_id: row.get(0)?,
                cutoff_ts_ms_utc: row.get(1)?,
                is_churned: row.get::<_, i64>(2)? != 0,
                values,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        component = "store",
        event = "store.read.finish",
        path = %path.display(),
        rows = rows.len(),
        fingerprint = %schema.fingerprint
    );

    Ok(FeatureStore {
        schema,
        stamp,
        label_column,
        rows,
    })
}

fn schema_fingerprint(stamp: &ConfigStamp, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", stamp.schema_version));
    hasher.update(format!("horizon_days:{};", stamp.horizon_days));
    hasher.update(format!("lead_time_days:{};", stamp.lead_time_days));
    let mode = match stamp.cutoff.mode {
        CutoffMode::LatestFeasible => "latest_feasible".to_string(),
        CutoffMode::Rolling { stride_days } => format!("rolling/{stride_days}"),
        CutoffMode::FixedDate { cutoff_ts_ms_utc } => format!("fixed_date/{cutoff_ts_ms_utc}"),
    };
    hasher.update(format!("cutoff_mode:{mode};"));
    hasher.update(format!(
        "min_history:{}/{}/{};",
        stamp.cutoff.min_history_orders,
        stamp.cutoff.min_history_days,
        stamp.cutoff.require_later_order
    ));
    let features = &stamp.features;
    hasher.update(format!("windows:{:?};", features.trailing_windows_days));
    hasher.update(format!(
        "trend:{}/{}/{}/{}/{};",
        features.trend_min_samples,
        features.trend_bucket_days,
        features.trend_buckets,
        features.basket_trend_orders,
        features.trend_neutral_value
    ));
    hasher.update(format!("timezone:{};", features.timezone));
    hasher.update(format!("category_column:{};", stamp.category_column));
    for column in columns {
        hasher.update(format!("{}:{:?};", column.name, column.dtype));
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(customer: &str, cutoff: i64) -> ObservationPoint {
        ObservationPoint {
            customer_id: customer.to_string(),
            cutoff_ts_ms_utc: cutoff,
        }
    }

    fn rfm(last_input: i64, recency_days: f64) -> RfmFeatures {
        RfmFeatures {
            last_input_ts_ms_utc: Some(last_input),
            recency_days,
            tenure_days: 10.0,
            orders_lifetime: 3,
            orders_in_windows: vec![0, 1, 3],
            orders_per_day: 0.25,
            avg_basket_size: 2.0,
            total_items: 6,
            basket_size_std: 0.0,
            basket_size_cv: 0.0,
            avg_distinct_products: 1.0,
        }
    }

    fn behavior(last_input: i64) -> BehaviorFeatures {
        BehaviorFeatures {
            last_input_ts_ms_utc: Some(last_input),
            interval_mean_days: 5.0,
            interval_std_days: 0.0,
            interval_cv: 0.0,
            overdue_ratio: 0.5,
            order_count_trend: 0.0,
            order_count_acceleration: 0.0,
            basket_size_trend: 0.0,
            interval_trend: 0.0,
            low_confidence_trend: true,
            distinct_products: 2,
            distinct_categories: 1,
            category_exploration: 0.33,
            product_diversity: 0.5,
            exploration_rate: 0.0,
            reorder_rate: 0.5,
            favorite_products: 0,
            avg_order_hour: 12.0,
            weekend_order_ratio: 0.0,
            night_order_ratio: 0.0,
            morning_order_ratio: 0.0,
            afternoon_order_ratio: 1.0,
        }
    }

    fn label(p: &ObservationPoint, is_churned: bool) -> Label {
        Label {
            point: p.clone(),
            is_churned,
            horizon_orders: u32::from(!is_churned),
        }
    }

    #[test]
    fn fingerprint_tracks_config_and_is_stable() {
        let cfg = PipelineConfig::default();
        let a = build_feature_schema(&cfg);
        let b = build_feature_schema(&cfg);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint.len(), 64);

        let mut other = cfg.clone();
        other.horizon_days = 14;
        assert_ne!(a.fingerprint, build_feature_schema(&other).fingerprint);

        let mut rescheduled = cfg;
        rescheduled.partitions = 16;
        assert_eq!(a.fingerprint, build_feature_schema(&rescheduled).fingerprint);
    }

    #[test]
    fn assemble_orders_rows_by_key() {
        let schema = build_feature_schema(&PipelineConfig::default());
        let points = vec![point("a", 100), point("b", 100)];
        let rows = assemble_feature_rows(
            &schema,
            &points,
            vec![label(&points[1], true), label(&points[0], false)],
            vec![(points[1].clone(), rfm(90, 1.0)), (points[0].clone(), rfm(90, 2.0))],
            vec![(points[0].clone(), behavior(90)), (points[1].clone(), behavior(90))],
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].customer_id, "a");
        assert!(!rows[0].is_churned);
        assert_eq!(rows[0].values[0], FeatureValue::F64(2.0));
        assert_eq!(rows[1].customer_id, "b");
        assert!(rows[1].is_churned);
    }

    #[test]
    fn missing_builder_key_is_a_schema_mismatch() {
        let schema = build_feature_schema(&PipelineConfig::default());
        let points = vec![point("a", 100), point("b", 100)];
        let err = assemble_feature_rows(
            &schema,
            &points,
            vec![label(&points[0], false), label(&points[1], false)],
            vec![(points[0].clone(), rfm(90, 1.0))],
            vec![(points[0].clone(), behavior(90)), (points[1].clone(), behavior(90))],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { ref builder, .. } if builder == "rfm"));
    }

    #[test]
    fn input_after_cutoff_is_a_lookahead_violation() {
        let schema = build_feature_schema(&PipelineConfig::default());
        let points = vec![point("a", 100)];
        let err = assemble_feature_rows(
            &schema,
            &points,
            vec![label(&points[0], false)],
            vec![(points[0].clone(), rfm(90, 1.0))],
            vec![(points[0].clone(), behavior(101))],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StoreError::LookaheadViolation {
                input_ts_ms_utc: 101,
                ..
            }
        ));
    }

    #[test]
    fn non_finite_value_is_rejected() {
        let schema = build_feature_schema(&PipelineConfig::default());
        let points = vec![point("a", 100)];
        let err = assemble_feature_rows(
            &schema,
            &points,
            vec![label(&points[0], false)],
            vec![(points[0].clone(), rfm(90, f64::NAN))],
            vec![(points[0].clone(), behavior(90))],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::NonFiniteValue { ref column, .. } if column == "recency_days"));
    }

    #[test]
    fn window_count_disagreement_is_a_column_count_mismatch() {
        let mut cfg = PipelineConfig::default();
        cfg.features.trailing_windows_days = vec![7, 30];
        let schema = build_feature_schema(&cfg);
        let points = vec![point("a", 100)];
        let err = assemble_feature_rows(
            &schema,
            &points,
            vec![label(&points[0], false)],
            vec![(points[0].clone(), rfm(90, 1.0))],
            vec![(points[0].clone(), behavior(90))],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::ColumnCountMismatch { .. }));
    }

    #[test]
    fn schema_compatibility_checks_version_then_fingerprint() {
        let schema = build_feature_schema(&PipelineConfig::default());
        assert!(assert_schema_compatible(schema.version, &schema.fingerprint, &schema).is_ok());
        assert!(matches!(
            assert_schema_compatible(schema.version + 1, &schema.fingerprint, &schema),
            Err(StoreError::SchemaVersionMismatch { .. })
        ));
        assert!(matches!(
            assert_schema_compatible(schema.version, "deadbeef", &schema),
            Err(StoreError::SchemaFingerprintMismatch { .. })
        ));
    }
}
