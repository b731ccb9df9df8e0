//! End-to-end run: load, select cutoffs, fan out builders over customer partitions,
//! assemble and publish.

use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::behavior::{build_behavior_features, BehaviorError, BehaviorFeatures};
use crate::config::{validate_config, ConfigError, ConfigStamp, PipelineConfig};
use crate::cutoffs::{customer_groups, select_observation_points, CutoffReport, ObservationPoint};
use crate::labels::{generate_labels, Label};
use crate::observability::{log_run_failed, log_run_finish, log_run_start};
use crate::orders::{
    load_event_log_into, EventLog, LoadError, LoadReport, SourcePaths, UnknownCustomerError,
};
use crate::rfm::{build_rfm_features, RfmFeatures};
use crate::store::{
    assemble_feature_rows, build_feature_schema, persist_feature_store, FeatureRow, FeatureSchema,
    StoreError,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    UnknownCustomer(#[from] UnknownCustomerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BehaviorError> for PipelineError {
    fn from(err: BehaviorError) -> Self {
        match err {
            BehaviorError::UnknownCustomer(err) => Self::UnknownCustomer(err),
            BehaviorError::Config(err) => Self::Config(err),
        }
    }
}

/// Assembled rows for one configuration, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub stamp: ConfigStamp,
    pub cutoffs: CutoffReport,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn churned_count(&self) -> usize {
        self.rows.iter().filter(|row| row.is_churned).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub load: LoadReport,
    pub cutoffs: CutoffReport,
    pub rows: u64,
    pub churned_rows: u64,
    pub schema: FeatureSchema,
}

#[derive(Debug, Default)]
struct PartitionOutput {
    labels: Vec<Label>,
    rfm: Vec<(ObservationPoint, RfmFeatures)>,
    behavior: Vec<(ObservationPoint, BehaviorFeatures)>,
}

/// Builds the feature table in memory from an already loaded event log.
pub fn build_feature_table(
    log: &EventLog,
    cfg: &PipelineConfig,
) -> Result<FeatureTable, PipelineError> {
    validate_config(cfg)?;
    let (points, cutoffs) = select_observation_points(log, cfg);
    assemble_table(log, cfg, points, cutoffs)
}

fn assemble_table(
    log: &EventLog,
    cfg: &PipelineConfig,
    points: Vec<ObservationPoint>,
    cutoffs: CutoffReport,
) -> Result<FeatureTable, PipelineError> {
    let schema = build_feature_schema(cfg);
    let partitions = partition_points(&points, partition_count(cfg));
    debug!(
        component = "pipeline",
        event = "pipeline.partitions.planned",
        partitions = partitions.len(),
        points = points.len()
    );

    let outputs = partitions
        .par_iter()
        .map(|part| build_partition(log, part, cfg))
        .collect::<Result<Vec<_>, PipelineError>>()?;

    let mut merged = PartitionOutput::default();
    for output in outputs {
        merged.labels.extend(output.labels);
        merged.rfm.extend(output.rfm);
        merged.behavior.extend(output.behavior);
    }

    let rows = assemble_feature_rows(
        &schema,
        &points,
        merged.labels,
        merged.rfm,
        merged.behavior,
    )?;

    Ok(FeatureTable {
        schema,
        stamp: cfg.stamp(),
        cutoffs,
        rows,
    })
}

/// Loads sources, builds the table and publishes it at `store_path`.
pub fn run_pipeline(
    sources: &SourcePaths,
    cfg: &PipelineConfig,
    store_path: &Path,
) -> Result<RunReport, PipelineError> {
    let started = Instant::now();
    log_run_start(cfg, store_path);

    let mut load_report: Option<LoadReport> = None;
    let mut cutoff_report: Option<CutoffReport> = None;
    let result = run_stages(sources, cfg, store_path, &mut load_report, &mut cutoff_report);

    match &result {
        Ok(report) => log_run_finish(
            report.rows as usize,
            report.churned_rows as usize,
            &report.schema.fingerprint,
            started.elapsed().as_millis(),
        ),
        Err(err) => log_run_failed(err, load_report.as_ref(), cutoff_report.as_ref()),
    }
    result
}

fn run_stages(
    sources: &SourcePaths,
    cfg: &PipelineConfig,
    store_path: &Path,
    load_report: &mut Option<LoadReport>,
    cutoff_report: &mut Option<CutoffReport>,
) -> Result<RunReport, PipelineError> {
    validate_config(cfg)?;
    let report = load_report.insert(LoadReport::default());
    let log = load_event_log_into(sources, cfg, report)?;
    let load = report.clone();

    let (points, cutoffs) = select_observation_points(&log, cfg);
    *cutoff_report = Some(cutoffs.clone());
    let table = assemble_table(&log, cfg, points, cutoffs)?;

    persist_feature_store(store_path, &table.schema, &table.stamp, &table.rows)?;

    Ok(RunReport {
        load,
        churned_rows: table.churned_count() as u64,
        rows: table.rows.len() as u64,
        cutoffs: table.cutoffs,
        schema: table.schema,
    })
}

fn build_partition(
    log: &EventLog,
    points: &[ObservationPoint],
    cfg: &PipelineConfig,
) -> Result<PartitionOutput, PipelineError> {
    let (labels, (rfm, behavior)) = rayon::join(
        || generate_labels(log, points, cfg),
        || {
            rayon::join(
                || build_rfm_features(log, points, cfg),
                || build_behavior_features(log, points, cfg),
            )
        },
    );
    Ok(PartitionOutput {
        labels: labels?,
        rfm: rfm?,
        behavior: behavior?,
    })
}

fn partition_count(cfg: &PipelineConfig) -> usize {
    if cfg.partitions == 0 {
        rayon::current_num_threads().max(1)
    } else {
        cfg.partitions
    }
}

/// Splits sorted points into at most about `partitions` contiguous slices, cutting
/// only between customers.
fn partition_points(points: &[ObservationPoint], partitions: usize) -> Vec<&[ObservationPoint]> {
    if points.is_empty() {
        return Vec::new();
    }
    let target = points.len().div_ceil(partitions.max(1));
    let mut out = Vec::with_capacity(partitions.min(points.len()));
    let mut start = 0usize;
    let mut end = 0usize;
    for group in customer_groups(points) {
        end += group.len();
        if end - start >= target {
            out.push(&points[start..end]);
            start = end;
        }
    }
    if start < end {
        out.push(&points[start..end]);
    }
    out
}
