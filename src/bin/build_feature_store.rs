use std::fs;
use std::path::{Path, PathBuf};

use churnlab::{
    apply_env_overrides, init_logging, load_config, log_app_start, logging_config_from_env,
    run_pipeline, validate_config, PipelineConfig, SourcePaths,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start("build_feature_store", &logging);

    let data_dir = std::env::var("CHURNLAB_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/raw"));
    let store_path = std::env::var("CHURNLAB_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/processed/feature_store.sqlite"));

    let base = match std::env::var("CHURNLAB_CONFIG") {
        Ok(path) if !path.trim().is_empty() => load_config(Path::new(path.trim()))?,
        _ => PipelineConfig::default(),
    };
    let cfg = apply_env_overrides(base);
    validate_config(&cfg)?;

    let sources = discover_sources(&data_dir)?;
    println!(
        "Feature store build start | data_dir={} store={} horizon_days={} cutoff_mode={:?} line_files={}",
        data_dir.display(),
        store_path.display(),
        cfg.horizon_days,
        cfg.cutoff.mode,
        sources.order_lines.len()
    );

    let report = run_pipeline(&sources, &cfg, &store_path)?;

    let churn_rate = if report.rows == 0 {
        0.0
    } else {
        report.churned_rows as f64 / report.rows as f64
    };
    println!(
        "Loaded {} orders for {} customers (dropped={} duplicates={} orphan_lines={})",
        report.load.orders_loaded,
        report.load.customers,
        report.load.orders_dropped,
        report.load.duplicate_orders_removed,
        report.load.orphan_lines
    );
    println!(
        "Observation points: {} selected, {} excluded, {} customers without a point",
        report.cutoffs.points_selected,
        report.cutoffs.excluded_total(),
        report.cutoffs.customers_without_points
    );
    println!(
        "Wrote {} rows ({} churned, rate {:.3}) with {} feature columns | schema v{} {}",
        report.rows,
        report.churned_rows,
        churn_rate,
        report.schema.columns.len(),
        report.schema.version,
        report.schema.fingerprint
    );
    Ok(())
}

fn discover_sources(data_dir: &Path) -> Result<SourcePaths, Box<dyn std::error::Error>> {
    let orders = find_table(data_dir, "orders")?
        .ok_or_else(|| format!("no orders.csv[.zip] under {}", data_dir.display()))?;
    let products = find_table(data_dir, "products")?
        .ok_or_else(|| format!("no products.csv[.zip] under {}", data_dir.display()))?;

    let mut order_lines: Vec<PathBuf> = fs::read_dir(data_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().to_ascii_lowercase())
                .map(|name| {
                    name.starts_with("order_products")
                        && (name.ends_with(".csv") || name.ends_with(".csv.zip"))
                })
                .unwrap_or(false)
        })
        .collect();
    order_lines.sort();
    if order_lines.is_empty() {
        return Err(format!("no order_products*.csv[.zip] under {}", data_dir.display()).into());
    }

    Ok(SourcePaths {
        orders,
        order_lines,
        products,
    })
}

fn find_table(data_dir: &Path, stem: &str) -> Result<Option<PathBuf>, std::io::Error> {
    for candidate in [format!("{stem}.csv"), format!("{stem}.csv.zip")] {
        let path = data_dir.join(candidate);
        if path.is_file() {
            return Ok(Some(path));
        }
    }
    if !data_dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("data dir {} does not exist", data_dir.display()),
        ));
    }
    Ok(None)
}
