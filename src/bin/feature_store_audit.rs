use std::path::PathBuf;

use churnlab::{
    assert_schema_compatible, build_feature_schema, init_logging, log_app_start,
    logging_config_from_env, read_feature_store, FeatureDType,
};

#[derive(Debug, Clone, Copy)]
struct ColumnSummary {
    min: f64,
    max: f64,
    sum: f64,
    zeros: u64,
}

impl Default for ColumnSummary {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            zeros: 0,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start("feature_store_audit", &logging);

    let store_path = std::env::var("CHURNLAB_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/processed/feature_store.sqlite"));
    let store = read_feature_store(&store_path)?;

    println!(
        "Feature store audit | path={} schema v{} {} | columns={} rows={}",
        store_path.display(),
        store.schema.version,
        store.schema.fingerprint,
        store.schema.columns.len(),
        store.rows.len()
    );

    // The stamp must reproduce the recorded fingerprint.
    let rebuilt = build_feature_schema(&store.stamp.to_config());
    assert_schema_compatible(rebuilt.version, &rebuilt.fingerprint, &store.schema)?;
    println!(
        "Config stamp: horizon_days={} lead_time_days={} cutoff_mode={:?} windows={:?}",
        store.stamp.horizon_days,
        store.stamp.lead_time_days,
        store.stamp.cutoff.mode,
        store.stamp.features.trailing_windows_days
    );

    let churned = store.churned_count();
    let customers = {
        let mut ids: Vec<&str> = store.rows.iter().map(|r| r.customer_id.as_str()).collect();
        ids.dedup();
        ids.len()
    };
    let churn_rate = if store.rows.is_empty() {
        0.0
    } else {
        churned as f64 / store.rows.len() as f64
    };
    println!(
        "Labels: {} churned / {} active across {} customers (churn rate {:.3})",
        churned,
        store.rows.len() - churned,
        customers,
        churn_rate
    );

    let mut summaries = vec![ColumnSummary::default(); store.schema.columns.len()];
    for row in &store.rows {
        for (summary, value) in summaries.iter_mut().zip(&row.values) {
            let v = value.as_f64();
            summary.min = summary.min.min(v);
            summary.max = summary.max.max(v);
            summary.sum += v;
            if v == 0.0 {
                summary.zeros += 1;
            }
        }
    }

    println!(
        "{:<28} {:>6} {:>12} {:>12} {:>12} {:>8}",
        "column", "dtype", "min", "mean", "max", "zeros"
    );
    for (column, summary) in store.schema.columns.iter().zip(&summaries) {
        let dtype = match column.dtype {
            FeatureDType::F64 => "f64",
            FeatureDType::I64 => "i64",
            FeatureDType::Bool => "bool",
        };
        if store.rows.is_empty() {
            println!(
                "{:<28} {:>6} {:>12} {:>12} {:>12} {:>8}",
                column.name, dtype, "-", "-", "-", 0
            );
            continue;
        }
        println!(
            "{:<28} {:>6} {:>12.4} {:>12.4} {:>12.4} {:>8}",
            column.name,
            dtype,
            summary.min,
            summary.sum / store.rows.len() as f64,
            summary.max,
            summary.zeros
        );
    }

    Ok(())
}
