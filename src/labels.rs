//! Churn labels for observation points.

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::cutoffs::{customer_groups, ObservationPoint};
use crate::orders::{EventLog, UnknownCustomerError, DAY_MS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub point: ObservationPoint,
    pub is_churned: bool,
    /// Orders found inside the label window.
    pub horizon_orders: u32,
}

/// Offsets from the cutoff of the label window `(start, end]`, in milliseconds.
pub fn label_window_ms(cfg: &PipelineConfig) -> (i64, i64) {
    let lead = i64::from(cfg.lead_time_days) * DAY_MS;
    let horizon = i64::from(cfg.horizon_days) * DAY_MS;
    (lead, lead + horizon)
}

/// Labels `points`, which must be sorted by `(customer_id, cutoff_ts_ms_utc)`.
///
/// Each customer's timeline is walked once: the window cursors only move forward
/// as cutoffs ascend.
pub fn generate_labels(
    log: &EventLog,
    points: &[ObservationPoint],
    cfg: &PipelineConfig,
) -> Result<Vec<Label>, UnknownCustomerError> {
    let (start_offset, end_offset) = label_window_ms(cfg);
    let mut labels = Vec::with_capacity(points.len());

    for group in customer_groups(points) {
        let timeline = log.timeline(&group[0].customer_id)?;
        let orders = timeline.orders();
        let mut start = 0usize;
        let mut end = 0usize;

        for point in group {
            let window_start = point.cutoff_ts_ms_utc.saturating_add(start_offset);
            let window_end = point.cutoff_ts_ms_utc.saturating_add(end_offset);
            while start < orders.len() && orders[start].ts_ms_utc <= window_start {
                start += 1;
            }
            end = end.max(start);
            while end < orders.len() && orders[end].ts_ms_utc <= window_end {
                end += 1;
            }
            let horizon_orders = (end - start) as u32;
            labels.push(Label {
                point: point.clone(),
                is_churned: horizon_orders == 0,
                horizon_orders,
            });
        }
    }

    Ok(labels)
}
