//! Observation point selection.
//!
//! Candidate cutoffs sit on UTC day boundaries. A candidate is kept only when the
//! customer has enough history before it and the dataset extends at least one full
//! label window past it; everything else is excluded and counted, never labeled.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{CutoffMode, PipelineConfig};
use crate::labels::label_window_ms;
use crate::orders::{EventLog, Timeline, DAY_MS};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservationPoint {
    pub customer_id: String,
    pub cutoff_ts_ms_utc: i64,
}

/// Why a candidate cutoff was not turned into an observation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExclusionReason {
    BeforeFirstOrder,
    NoLaterOrder,
    HorizonBeyondData,
    InsufficientOrders,
    InsufficientSpan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutoffReport {
    pub customers_considered: u64,
    pub customers_with_points: u64,
    pub customers_without_points: u64,
    pub points_selected: u64,
    pub excluded_before_first_order: u64,
    pub excluded_no_later_order: u64,
    pub excluded_horizon_beyond_data: u64,
    pub excluded_insufficient_orders: u64,
    pub excluded_insufficient_span: u64,
}

impl CutoffReport {
    pub fn excluded_total(&self) -> u64 {
        self.excluded_before_first_order
            + self.excluded_no_later_order
            + self.excluded_horizon_beyond_data
            + self.excluded_insufficient_orders
            + self.excluded_insufficient_span
    }

    fn record_exclusion(&mut self, reason: ExclusionReason) {
        match reason {
            ExclusionReason::BeforeFirstOrder => self.excluded_before_first_order += 1,
            ExclusionReason::NoLaterOrder => self.excluded_no_later_order += 1,
            ExclusionReason::HorizonBeyondData => self.excluded_horizon_beyond_data += 1,
            ExclusionReason::InsufficientOrders => self.excluded_insufficient_orders += 1,
            ExclusionReason::InsufficientSpan => self.excluded_insufficient_span += 1,
        }
    }
}

#[derive(Debug, Default)]
struct CustomerSelection {
    cutoffs: Vec<i64>,
    exclusions: Vec<ExclusionReason>,
}

/// Selects observation points for every customer in the log, sorted by
/// `(customer_id, cutoff_ts_ms_utc)`.
pub fn select_observation_points(
    log: &EventLog,
    cfg: &PipelineConfig,
) -> (Vec<ObservationPoint>, CutoffReport) {
    let mut report = CutoffReport::default();
    let Some((_, dataset_last_ts)) = log.time_range() else {
        return (Vec::new(), report);
    };

    let selections: Vec<(usize, CustomerSelection)> = (0..log.customer_count())
        .into_par_iter()
        .filter_map(|idx| {
            log.timeline_at(idx)
                .map(|timeline| (idx, select_for_customer(&timeline, dataset_last_ts, cfg)))
        })
        .collect();

    let mut points = Vec::new();
    for (idx, selection) in selections {
        let Some(timeline) = log.timeline_at(idx) else {
            continue;
        };
        report.customers_considered += 1;
        for reason in selection.exclusions {
            report.record_exclusion(reason);
        }
        if selection.cutoffs.is_empty() {
            report.customers_without_points += 1;
            continue;
        }
        report.customers_with_points += 1;
        report.points_selected += selection.cutoffs.len() as u64;
        points.extend(selection.cutoffs.into_iter().map(|cutoff| ObservationPoint {
            customer_id: timeline.customer_id().to_string(),
            cutoff_ts_ms_utc: cutoff,
        }));
    }

    info!(
        component = "cutoffs",
        event = "cutoffs.select.finish",
        mode = ?cfg.cutoff.mode,
        customers_considered = report.customers_considered,
        customers_with_points = report.customers_with_points,
        points_selected = report.points_selected,
        excluded_total = report.excluded_total(),
        excluded_insufficient_orders = report.excluded_insufficient_orders,
        excluded_insufficient_span = report.excluded_insufficient_span,
        excluded_horizon_beyond_data = report.excluded_horizon_beyond_data
    );

    (points, report)
}

/// Splits points sorted by customer into per-customer runs.
pub fn customer_groups(
    points: &[ObservationPoint],
) -> impl Iterator<Item = &[ObservationPoint]> + '_ {
    points.chunk_by(|a, b| a.customer_id == b.customer_id)
}

fn select_for_customer(
    timeline: &Timeline<'_>,
    dataset_last_ts: i64,
    cfg: &PipelineConfig,
) -> CustomerSelection {
    let mut selection = CustomerSelection::default();
    let (_, window_end_ms) = label_window_ms(cfg);
    let feasible_upper = dataset_last_ts.saturating_sub(window_end_ms);

    let consider = |cutoff: i64, selection: &mut CustomerSelection| {
        match check_candidate(timeline, cutoff, dataset_last_ts, cfg) {
            Ok(()) => selection.cutoffs.push(cutoff),
            Err(reason) => selection.exclusions.push(reason),
        }
    };

    match cfg.cutoff.mode {
        CutoffMode::LatestFeasible => {
            let mut upper = feasible_upper;
            if cfg.cutoff.require_later_order {
                upper = upper.min(timeline.last_ts_ms_utc() - 1);
            }
            consider(floor_to_day(upper), &mut selection);
        }
        CutoffMode::Rolling { stride_days } => {
            let stride_ms = i64::from(stride_days) * DAY_MS;
            let first_grid = floor_to_day(timeline.first_ts_ms_utc()) + DAY_MS;
            if first_grid > feasible_upper {
                selection
                    .exclusions
                    .push(ExclusionReason::HorizonBeyondData);
            } else {
                let mut cutoff = first_grid;
                while cutoff <= feasible_upper {
                    consider(cutoff, &mut selection);
                    cutoff += stride_ms;
                }
            }
        }
        CutoffMode::FixedDate { cutoff_ts_ms_utc } => {
            consider(cutoff_ts_ms_utc, &mut selection);
        }
    }

    selection
}

fn check_candidate(
    timeline: &Timeline<'_>,
    cutoff: i64,
    dataset_last_ts: i64,
    cfg: &PipelineConfig,
) -> Result<(), ExclusionReason> {
    let first_ts = timeline.first_ts_ms_utc();
    if cutoff <= first_ts {
        return Err(ExclusionReason::BeforeFirstOrder);
    }
    if cfg.cutoff.require_later_order && cutoff >= timeline.last_ts_ms_utc() {
        return Err(ExclusionReason::NoLaterOrder);
    }
    let (_, window_end_ms) = label_window_ms(cfg);
    if cutoff.saturating_add(window_end_ms) > dataset_last_ts {
        return Err(ExclusionReason::HorizonBeyondData);
    }
    if (timeline.prior_len(cutoff) as u64) < u64::from(cfg.cutoff.min_history_orders) {
        return Err(ExclusionReason::InsufficientOrders);
    }
    if cutoff - first_ts < i64::from(cfg.cutoff.min_history_days) * DAY_MS {
        return Err(ExclusionReason::InsufficientSpan);
    }
    Ok(())
}

fn floor_to_day(ts_ms_utc: i64) -> i64 {
    ts_ms_utc.div_euclid(DAY_MS) * DAY_MS
}
