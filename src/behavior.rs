//! Second-order behavioral signals: order cadence, trends, product diversity and
//! time-of-day habits.
//!
//! Trend slopes need `features.trend_min_samples` points. Below that the column takes
//! `features.trend_neutral_value` and `low_confidence_trend` is set on the row.

use std::collections::{HashMap, HashSet};

use chrono::{Datelike, TimeZone, Timelike, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{validate_config, ConfigError, FeatureConfig, PipelineConfig};
use crate::cutoffs::{customer_groups, ObservationPoint};
use crate::orders::{EventLog, OrderEvent, Timeline, UnknownCustomerError, DAY_MS};
use crate::stats::{linear_slope, mean, smoothed_ratio, std_dev};
use crate::store::{FeatureColumn, FeatureDType, FeatureValue};

/// Distinct orders a product must appear in to count as a favorite.
pub const FAVORITE_MIN_ORDERS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorFeatures {
    pub last_input_ts_ms_utc: Option<i64>,
    pub interval_mean_days: f64,
    pub interval_std_days: f64,
    pub interval_cv: f64,
    pub overdue_ratio: f64,
    pub order_count_trend: f64,
    pub order_count_acceleration: f64,
    pub basket_size_trend: f64,
    pub interval_trend: f64,
    pub low_confidence_trend: bool,
    pub distinct_products: i64,
    pub distinct_categories: i64,
    pub category_exploration: f64,
    pub product_diversity: f64,
    pub exploration_rate: f64,
    pub reorder_rate: f64,
    pub favorite_products: i64,
    pub avg_order_hour: f64,
    pub weekend_order_ratio: f64,
    pub night_order_ratio: f64,
    pub morning_order_ratio: f64,
    pub afternoon_order_ratio: f64,
}

impl BehaviorFeatures {
    pub fn values(&self) -> Vec<FeatureValue> {
        vec![
            FeatureValue::F64(self.interval_mean_days),
            FeatureValue::F64(self.interval_std_days),
            FeatureValue::F64(self.interval_cv),
            FeatureValue::F64(self.overdue_ratio),
            FeatureValue::F64(self.order_count_trend),
            FeatureValue::F64(self.order_count_acceleration),
            FeatureValue::F64(self.basket_size_trend),
            FeatureValue::F64(self.interval_trend),
            FeatureValue::Bool(self.low_confidence_trend),
            FeatureValue::I64(self.distinct_products),
            FeatureValue::I64(self.distinct_categories),
            FeatureValue::F64(self.category_exploration),
            FeatureValue::F64(self.product_diversity),
            FeatureValue::F64(self.exploration_rate),
            FeatureValue::F64(self.reorder_rate),
            FeatureValue::I64(self.favorite_products),
            FeatureValue::F64(self.avg_order_hour),
            FeatureValue::F64(self.weekend_order_ratio),
            FeatureValue::F64(self.night_order_ratio),
            FeatureValue::F64(self.morning_order_ratio),
            FeatureValue::F64(self.afternoon_order_ratio),
        ]
    }
}

pub fn behavior_columns() -> Vec<FeatureColumn> {
    use FeatureDType::{Bool, F64, I64};
    [
        ("interval_mean_days", F64),
        ("interval_std_days", F64),
        ("interval_cv", F64),
        ("overdue_ratio", F64),
        ("order_count_trend", F64),
        ("order_count_acceleration", F64),
        ("basket_size_trend", F64),
        ("interval_trend", F64),
        ("low_confidence_trend", Bool),
        ("distinct_products", I64),
        ("distinct_categories", I64),
        ("category_exploration", F64),
        ("product_diversity", F64),
        ("exploration_rate", F64),
        ("reorder_rate", F64),
        ("favorite_products", I64),
        ("avg_order_hour", F64),
        ("weekend_order_ratio", F64),
        ("night_order_ratio", F64),
        ("morning_order_ratio", F64),
        ("afternoon_order_ratio", F64),
    ]
    .into_iter()
    .map(|(name, dtype)| FeatureColumn::new(name, dtype))
    .collect()
}

/// Builds behavioral features for `points`, sorted by `(customer_id, cutoff_ts_ms_utc)`.
pub fn build_behavior_features(
    log: &EventLog,
    points: &[ObservationPoint],
    cfg: &PipelineConfig,
) -> Result<Vec<(ObservationPoint, BehaviorFeatures)>, BehaviorError> {
    validate_config(cfg)?;
    let tz = cfg.features.tz()?;
    let mut out = Vec::with_capacity(points.len());
    for group in customer_groups(points) {
        let timeline = log.timeline(&group[0].customer_id)?;
        for point in group {
            let features = behavior_at(&timeline, point.cutoff_ts_ms_utc, &cfg.features, tz);
            out.push((point.clone(), features));
        }
    }
    Ok(out)
}

#[derive(Debug, Error)]
pub enum BehaviorError {
    #[error(transparent)]
    UnknownCustomer(#[from] UnknownCustomerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct TrendFit {
    neutral: f64,
    min_samples: usize,
    fell_back: bool,
}

impl TrendFit {
    fn slope(&mut self, ys: &[f64]) -> f64 {
        match linear_slope(ys, self.min_samples) {
            Some(slope) => slope,
            None => self.fallback(),
        }
    }

    /// Slope of the newer half minus slope of the older half.
    fn slope_change(&mut self, older: &[f64], newer: &[f64]) -> f64 {
        match (
            linear_slope(older, self.min_samples),
            linear_slope(newer, self.min_samples),
        ) {
            (Some(older), Some(newer)) => newer - older,
            _ => self.fallback(),
        }
    }

    fn fallback(&mut self) -> f64 {
        self.fell_back = true;
        self.neutral
    }
}

pub(crate) fn behavior_at(
    timeline: &Timeline<'_>,
    cutoff_ts_ms_utc: i64,
    cfg: &FeatureConfig,
    tz: Tz,
) -> BehaviorFeatures {
    let prior = timeline.prior(cutoff_ts_ms_utc);
    let first_ts = prior
        .first()
        .map(|o| o.ts_ms_utc)
        .unwrap_or_else(|| timeline.first_ts_ms_utc().min(cutoff_ts_ms_utc));
    let last_ts = prior.last().map(|o| o.ts_ms_utc).unwrap_or(first_ts);
    let tenure_days = to_days(cutoff_ts_ms_utc - first_ts);
    let recency_days = to_days(cutoff_ts_ms_utc - last_ts);

    let gaps = gaps_days(prior);
    let interval_mean_days = mean(&gaps).unwrap_or(tenure_days);
    let interval_std_days = std_dev(&gaps).unwrap_or(0.0);

    let mut fit = TrendFit {
        neutral: cfg.trend_neutral_value,
        min_samples: cfg.trend_min_samples,
        fell_back: false,
    };

    let buckets = bucket_counts(prior, cutoff_ts_ms_utc, first_ts, cfg);
    let order_count_trend = fit.slope(&buckets);
    let half = (buckets.len() + 1) / 2;
    let order_count_acceleration =
        fit.slope_change(&buckets[..half], &buckets[buckets.len() / 2..]);

    let recent = &prior[prior.len().saturating_sub(cfg.basket_trend_orders)..];
    let recent_baskets: Vec<f64> = recent.iter().map(|o| f64::from(o.item_count)).collect();
    let basket_size_trend = fit.slope(&recent_baskets);
    let interval_trend = fit.slope(&gaps_days(recent));

    let diversity = Diversity::collect(timeline, prior);
    let habits = Habits::collect(prior, tz);
    let orders_lifetime = prior.len().max(1) as f64;

    BehaviorFeatures {
        last_input_ts_ms_utc: prior.last().map(|o| o.ts_ms_utc),
        interval_mean_days,
        interval_std_days,
        interval_cv: smoothed_ratio(interval_std_days, interval_mean_days),
        overdue_ratio: smoothed_ratio(recency_days, interval_mean_days),
        order_count_trend,
        order_count_acceleration,
        basket_size_trend,
        interval_trend,
        low_confidence_trend: fit.fell_back,
        distinct_products: diversity.products as i64,
        distinct_categories: diversity.categories as i64,
        category_exploration: diversity.categories as f64 / orders_lifetime,
        product_diversity: smoothed_ratio(diversity.products as f64, diversity.line_items as f64),
        exploration_rate: diversity.exploration_rate,
        reorder_rate: diversity.reorder_rate,
        favorite_products: diversity.favorites as i64,
        avg_order_hour: habits.avg_hour,
        weekend_order_ratio: habits.weekend,
        night_order_ratio: habits.night,
        morning_order_ratio: habits.morning,
        afternoon_order_ratio: habits.afternoon,
    }
}

fn to_days(ms: i64) -> f64 {
    ms as f64 / DAY_MS as f64
}

fn gaps_days(orders: &[OrderEvent]) -> Vec<f64> {
    orders
        .windows(2)
        .map(|pair| to_days(pair[1].ts_ms_utc - pair[0].ts_ms_utc))
        .collect()
}

/// Order counts in the trailing full buckets ending at the cutoff, oldest first.
fn bucket_counts(
    prior: &[OrderEvent],
    cutoff_ts_ms_utc: i64,
    first_ts_ms_utc: i64,
    cfg: &FeatureConfig,
) -> Vec<f64> {
    let bucket_ms = i64::from(cfg.trend_bucket_days) * DAY_MS;
    if bucket_ms == 0 {
        return Vec::new();
    }
    let full_buckets = ((cutoff_ts_ms_utc - first_ts_ms_utc).max(0) / bucket_ms) as usize;
    let n = full_buckets.min(cfg.trend_buckets);

    (0..n)
        .rev()
        .map(|back| {
            let end = cutoff_ts_ms_utc - back as i64 * bucket_ms;
            let start = end - bucket_ms;
            let lo = prior.partition_point(|o| o.ts_ms_utc <= start);
            let hi = prior.partition_point(|o| o.ts_ms_utc <= end);
            (hi - lo) as f64
        })
        .collect()
}

#[derive(Debug, Default)]
struct Diversity {
    products: usize,
    categories: usize,
    line_items: usize,
    exploration_rate: f64,
    reorder_rate: f64,
    favorites: usize,
}

impl Diversity {
    fn collect(timeline: &Timeline<'_>, prior: &[OrderEvent]) -> Self {
        let mut seen_products: HashSet<u32> = HashSet::new();
        let mut categories: HashSet<u32> = HashSet::new();
        let mut orders_per_product: HashMap<u32, usize> = HashMap::new();
        let mut line_items = 0usize;
        let mut reordered = 0usize;

        let half = prior.len() / 2;
        let mut earlier_products: HashSet<u32> = HashSet::new();
        let mut later_products: HashSet<u32> = HashSet::new();

        for (idx, order) in prior.iter().enumerate() {
            let lines = timeline.lines_of(order);
            let mut in_order: Vec<u32> = lines.iter().map(|line| line.product).collect();
            in_order.sort_unstable();
            in_order.dedup();

            for line in lines {
                line_items += 1;
                if seen_products.contains(&line.product) {
                    reordered += 1;
                }
                if let Some(category) = line.category {
                    categories.insert(category);
                }
            }
            for product in &in_order {
                *orders_per_product.entry(*product).or_default() += 1;
                if idx < half {
                    earlier_products.insert(*product);
                } else {
                    later_products.insert(*product);
                }
            }
            seen_products.extend(in_order);
        }

        let exploration_rate = if later_products.is_empty() {
            0.0
        } else {
            let new = later_products.difference(&earlier_products).count();
            new as f64 / later_products.len() as f64
        };
        let reorder_rate = if line_items == 0 {
            0.0
        } else {
            reordered as f64 / line_items as f64
        };

        Self {
            products: seen_products.len(),
            categories: categories.len(),
            line_items,
            exploration_rate,
            reorder_rate,
            favorites: orders_per_product
                .values()
                .filter(|count| **count >= FAVORITE_MIN_ORDERS)
                .count(),
        }
    }
}

#[derive(Debug, Default)]
struct Habits {
    avg_hour: f64,
    weekend: f64,
    night: f64,
    morning: f64,
    afternoon: f64,
}

impl Habits {
    fn collect(prior: &[OrderEvent], tz: Tz) -> Self {
        let mut habits = Habits::default();
        let mut counted = 0usize;
        let mut hour_sum = 0u64;

        for order in prior {
            let Some(local) = tz.timestamp_millis_opt(order.ts_ms_utc).single() else {
                continue;
            };
            let hour = local.hour();
            counted += 1;
            hour_sum += u64::from(hour);
            if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
                habits.weekend += 1.0;
            }
            match hour {
                6..=11 => habits.morning += 1.0,
                12..=17 => habits.afternoon += 1.0,
                20..=23 | 0..=5 => habits.night += 1.0,
                _ => {}
            }
        }

        if counted == 0 {
            return habits;
        }
        let n = counted as f64;
        habits.avg_hour = hour_sum as f64 / n;
        habits.weekend /= n;
        habits.night /= n;
        habits.morning /= n;
        habits.afternoon /= n;
        habits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{LineItemRecord, OrderRecord, ProductRecord};

    const HOUR_MS: i64 = 3_600_000;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn log_from(orders: &[(&str, i64)], lines: &[(&str, &str)]) -> EventLog {
        let orders = orders
            .iter()
            .map(|(id, ts)| OrderRecord {
                order_id: id.to_string(),
                customer_id: "c1".to_string(),
                ts_ms_utc: *ts,
            })
            .collect();
        let lines = lines
            .iter()
            .map(|(order_id, product_id)| LineItemRecord {
                order_id: order_id.to_string(),
                product_id: product_id.to_string(),
                quantity: 1,
            })
            .collect();
        let products = ["p1", "p2", "p3"]
            .iter()
            .enumerate()
            .map(|(idx, id)| ProductRecord {
                product_id: id.to_string(),
                category_id: Some(format!("cat{}", idx % 2)),
            })
            .collect();
        EventLog::from_records(orders, lines, products).0
    }

    #[test]
    fn short_history_falls_back_to_neutral_trend_and_sets_flag() {
        let log = log_from(&[("a", 0), ("b", 10 * DAY_MS)], &[("a", "p1"), ("b", "p1")]);
        let timeline = log.timeline("c1").unwrap();
        let mut cfg = FeatureConfig::default();
        cfg.trend_neutral_value = -7.5;
        let features = behavior_at(&timeline, 20 * DAY_MS, &cfg, Tz::UTC);

        assert!(features.low_confidence_trend);
        assert_close(features.order_count_trend, -7.5);
        assert_close(features.order_count_acceleration, -7.5);
        assert_close(features.basket_size_trend, -7.5);
        assert_close(features.interval_trend, -7.5);
        assert!(features.values().iter().all(FeatureValue::is_finite));
    }

    #[test]
    fn long_regular_history_produces_measured_trends() {
        // Weekly orders for a year, then the cadence doubles in the last 90 days.
        let mut orders = Vec::new();
        let mut day = 0;
        while day < 270 {
            orders.push((format!("w{day}"), day * DAY_MS));
            day += 7;
        }
        while day < 360 {
            orders.push((format!("w{day}"), day * DAY_MS));
            day += 3;
        }
        let refs: Vec<(&str, i64)> = orders.iter().map(|(id, ts)| (id.as_str(), *ts)).collect();
        let log = log_from(&refs, &[]);
        let timeline = log.timeline("c1").unwrap();
        let features = behavior_at(&timeline, 360 * DAY_MS, &FeatureConfig::default(), Tz::UTC);

        assert!(!features.low_confidence_trend);
        assert!(features.order_count_trend > 0.0);
        assert!(features.interval_trend <= 0.0);
        assert_close(features.basket_size_trend, 0.0);
    }

    #[test]
    fn interval_statistics_and_sentinels() {
        let log = log_from(
            &[("a", 0), ("b", 10 * DAY_MS), ("c", 30 * DAY_MS)],
            &[],
        );
        let timeline = log.timeline("c1").unwrap();
        let cfg = FeatureConfig::default();

        let features = behavior_at(&timeline, 40 * DAY_MS, &cfg, Tz::UTC);
        assert_close(features.interval_mean_days, 15.0);
        assert_close(features.interval_std_days, 5.0);
        assert_close(features.overdue_ratio, 10.0 / 16.0);

        let single = behavior_at(&timeline, 5 * DAY_MS, &cfg, Tz::UTC);
        assert_close(single.interval_mean_days, 5.0);
        assert_close(single.interval_std_days, 0.0);
    }

    #[test]
    fn diversity_metrics_track_products_and_reorders() {
        let log = log_from(
            &[("a", 0), ("b", DAY_MS), ("c", 2 * DAY_MS), ("d", 3 * DAY_MS)],
            &[
                ("a", "p1"),
                ("b", "p1"),
                ("b", "p2"),
                ("c", "p1"),
                ("c", "p3"),
                ("d", "p9"),
            ],
        );
        let timeline = log.timeline("c1").unwrap();
        let features = behavior_at(&timeline, 4 * DAY_MS, &FeatureConfig::default(), Tz::UTC);

        assert_eq!(features.distinct_products, 4);
        // p1 and p3 map to cat0, p2 to cat1, p9 is unknown.
        assert_eq!(features.distinct_categories, 2);
        assert_close(features.category_exploration, 0.5);
        assert_close(features.product_diversity, 4.0 / 7.0);
        assert_close(features.reorder_rate, 2.0 / 6.0);
        // Later half {p1, p3, p9} against earlier half {p1, p2}.
        assert_close(features.exploration_rate, 2.0 / 3.0);
        assert_eq!(features.favorite_products, 0);
    }

    #[test]
    fn time_of_day_habits_use_configured_timezone() {
        // 2024-01-06 is a Saturday. 03:00 UTC is 22:00 the previous day in New York.
        let saturday_3am_utc = 1_704_510_000_000;
        let log = log_from(
            &[("a", saturday_3am_utc), ("b", saturday_3am_utc + 10 * HOUR_MS)],
            &[],
        );
        let timeline = log.timeline("c1").unwrap();
        let cutoff = saturday_3am_utc + DAY_MS;

        let utc = behavior_at(&timeline, cutoff, &FeatureConfig::default(), Tz::UTC);
        assert_close(utc.weekend_order_ratio, 1.0);
        assert_close(utc.night_order_ratio, 0.5);
        assert_close(utc.afternoon_order_ratio, 0.5);
        assert_close(utc.avg_order_hour, 8.0);

        let ny = behavior_at(
            &timeline,
            cutoff,
            &FeatureConfig::default(),
            Tz::America__New_York,
        );
        assert_close(ny.weekend_order_ratio, 0.5);
        assert_close(ny.night_order_ratio, 0.5);
        assert_close(ny.morning_order_ratio, 0.5);
    }

    #[test]
    fn zero_bucket_width_is_rejected_not_divided_by() {
        let log = log_from(
            &[("a", 0), ("b", 40 * DAY_MS), ("c", 80 * DAY_MS)],
            &[("a", "p1"), ("b", "p2"), ("c", "p3")],
        );
        let mut cfg = PipelineConfig::default();
        cfg.features.trend_bucket_days = 0;
        let point = ObservationPoint {
            customer_id: "c1".to_string(),
            cutoff_ts_ms_utc: 90 * DAY_MS,
        };

        let err = build_behavior_features(&log, &[point], &cfg)
            .expect_err("zero-day buckets are invalid");
        assert!(matches!(err, BehaviorError::Config(ConfigError::Invalid(_))));

        let timeline = log.timeline("c1").unwrap();
        let features = behavior_at(&timeline, 90 * DAY_MS, &cfg.features, Tz::UTC);
        assert!(features.low_confidence_trend);
        assert_eq!(features.order_count_trend, cfg.features.trend_neutral_value);
    }
}
