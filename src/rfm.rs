//! Recency, frequency and basket-size features.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::cutoffs::{customer_groups, ObservationPoint};
use crate::orders::{EventLog, OrderEvent, Timeline, UnknownCustomerError, DAY_MS};
use crate::stats::{mean, smoothed_ratio, std_dev};
use crate::store::{FeatureColumn, FeatureDType, FeatureValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmFeatures {
    /// Timestamp of the newest order read, `None` when no order preceded the cutoff.
    pub last_input_ts_ms_utc: Option<i64>,
    pub recency_days: f64,
    pub tenure_days: f64,
    pub orders_lifetime: i64,
    /// One count per configured trailing window, in configuration order.
    pub orders_in_windows: Vec<i64>,
    pub orders_per_day: f64,
    pub avg_basket_size: f64,
    pub total_items: i64,
    pub basket_size_std: f64,
    pub basket_size_cv: f64,
    pub avg_distinct_products: f64,
}

impl RfmFeatures {
    pub fn values(&self) -> Vec<FeatureValue> {
        let mut values = Vec::with_capacity(9 + self.orders_in_windows.len());
        values.push(FeatureValue::F64(self.recency_days));
        values.push(FeatureValue::F64(self.tenure_days));
        values.push(FeatureValue::I64(self.orders_lifetime));
        values.extend(self.orders_in_windows.iter().copied().map(FeatureValue::I64));
        values.push(FeatureValue::F64(self.orders_per_day));
        values.push(FeatureValue::F64(self.avg_basket_size));
        values.push(FeatureValue::I64(self.total_items));
        values.push(FeatureValue::F64(self.basket_size_std));
        values.push(FeatureValue::F64(self.basket_size_cv));
        values.push(FeatureValue::F64(self.avg_distinct_products));
        values
    }
}

pub fn rfm_columns(cfg: &PipelineConfig) -> Vec<FeatureColumn> {
    let mut columns = vec![
        FeatureColumn::new("recency_days", FeatureDType::F64),
        FeatureColumn::new("tenure_days", FeatureDType::F64),
        FeatureColumn::new("orders_lifetime", FeatureDType::I64),
    ];
    for window in &cfg.features.trailing_windows_days {
        columns.push(FeatureColumn::new(
            format!("orders_last_{window}d"),
            FeatureDType::I64,
        ));
    }
    columns.extend([
        FeatureColumn::new("orders_per_day", FeatureDType::F64),
        FeatureColumn::new("avg_basket_size", FeatureDType::F64),
        FeatureColumn::new("total_items", FeatureDType::I64),
        FeatureColumn::new("basket_size_std", FeatureDType::F64),
        FeatureColumn::new("basket_size_cv", FeatureDType::F64),
        FeatureColumn::new("avg_distinct_products", FeatureDType::F64),
    ]);
    columns
}

/// Builds RFM features for `points`, sorted by `(customer_id, cutoff_ts_ms_utc)`.
pub fn build_rfm_features(
    log: &EventLog,
    points: &[ObservationPoint],
    cfg: &PipelineConfig,
) -> Result<Vec<(ObservationPoint, RfmFeatures)>, UnknownCustomerError> {
    let mut out = Vec::with_capacity(points.len());
    for group in customer_groups(points) {
        let timeline = log.timeline(&group[0].customer_id)?;
        for point in group {
            let features = rfm_at(&timeline, point.cutoff_ts_ms_utc, cfg);
            out.push((point.clone(), features));
        }
    }
    Ok(out)
}

fn days_between(from_ts_ms_utc: i64, to_ts_ms_utc: i64) -> f64 {
    (to_ts_ms_utc - from_ts_ms_utc) as f64 / DAY_MS as f64
}

pub(crate) fn rfm_at(
    timeline: &Timeline<'_>,
    cutoff_ts_ms_utc: i64,
    cfg: &PipelineConfig,
) -> RfmFeatures {
    let prior = timeline.prior(cutoff_ts_ms_utc);
    let windows = &cfg.features.trailing_windows_days;

    let (Some(first), Some(last)) = (prior.first(), prior.last()) else {
        return empty_history(timeline, cutoff_ts_ms_utc, windows.len());
    };

    let tenure_days = days_between(first.ts_ms_utc, cutoff_ts_ms_utc);
    let recency_days = days_between(last.ts_ms_utc, cutoff_ts_ms_utc);
    let orders_lifetime = prior.len() as i64;

    let orders_in_windows = windows
        .iter()
        .map(|window| {
            let window_start = cutoff_ts_ms_utc - i64::from(*window) * DAY_MS;
            let older = prior.partition_point(|order| order.ts_ms_utc <= window_start);
            (prior.len() - older) as i64
        })
        .collect();

    let basket_sizes: Vec<f64> = prior.iter().map(|o| f64::from(o.item_count)).collect();
    let avg_basket_size = mean(&basket_sizes).unwrap_or(0.0);
    let basket_size_std = std_dev(&basket_sizes).unwrap_or(0.0);
    let total_items = prior.iter().map(|o| i64::from(o.item_count)).sum();

    let distinct_per_order: Vec<f64> = prior
        .iter()
        .map(|order| distinct_products_in(timeline, order) as f64)
        .collect();

    RfmFeatures {
        last_input_ts_ms_utc: Some(last.ts_ms_utc),
        recency_days,
        tenure_days,
        orders_lifetime,
        orders_in_windows,
        orders_per_day: smoothed_ratio(orders_lifetime as f64, tenure_days),
        avg_basket_size,
        total_items,
        basket_size_std,
        basket_size_cv: smoothed_ratio(basket_size_std, avg_basket_size),
        avg_distinct_products: mean(&distinct_per_order).unwrap_or(0.0),
    }
}

fn distinct_products_in(timeline: &Timeline<'_>, order: &OrderEvent) -> usize {
    timeline
        .lines_of(order)
        .iter()
        .map(|line| line.product)
        .collect::<HashSet<_>>()
        .len()
}

// Sentinel set for a cutoff with no prior order.
fn empty_history(timeline: &Timeline<'_>, cutoff_ts_ms_utc: i64, windows: usize) -> RfmFeatures {
    let tenure_days = days_between(timeline.first_ts_ms_utc(), cutoff_ts_ms_utc).max(0.0);
    RfmFeatures {
        last_input_ts_ms_utc: None,
        recency_days: tenure_days,
        tenure_days,
        orders_lifetime: 1,
        orders_in_windows: vec![0; windows],
        orders_per_day: smoothed_ratio(1.0, tenure_days),
        avg_basket_size: 0.0,
        total_items: 0,
        basket_size_std: 0.0,
        basket_size_cv: 0.0,
        avg_distinct_products: 0.0,
    }
}
