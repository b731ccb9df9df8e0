use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use churnlab::{
    assert_schema_compatible, build_feature_schema, build_feature_table, read_feature_store,
    run_pipeline, CutoffConfig, CutoffMode, EventLog, FeatureColumn, FeatureRow, FeatureValue,
    LineItemRecord, OrderRecord, PipelineConfig, PipelineError, ProductRecord, SourcePaths,
    StoreError, DAY_MS,
};
use regex::Regex;
use tempfile::TempDir;

const BASE_SECS: i64 = 1_700_006_400;

struct Order {
    id: String,
    customer: String,
    day: i64,
    hour: i64,
    products: Vec<String>,
}

fn ts_ms(day: i64, hour: i64) -> i64 {
    BASE_SECS * 1000 + day * DAY_MS + hour * 3_600_000
}

/// Six customers with different cadences over roughly 300 days.
fn synthetic_orders() -> Vec<Order> {
    let cadences: [(&str, i64, i64, i64); 6] = [
        ("c-daily", 0, 3, 300),
        ("c-weekly", 2, 7, 300),
        ("c-monthly", 5, 28, 300),
        ("c-sparse", 1, 45, 300),
        ("c-lapsed", 0, 10, 140),
        ("c-late", 220, 6, 300),
    ];
    let mut orders = Vec::new();
    for (ci, (customer, start, gap, end)) in cadences.iter().enumerate() {
        let mut day = *start;
        let mut k = 0i64;
        while day <= *end {
            let basket = 1 + ((k + ci as i64) % 4);
            let products = (0..basket)
                .map(|j| format!("p{}", (k * 3 + j + ci as i64) % 9))
                .collect();
            orders.push(Order {
                id: format!("{customer}-{k}"),
                customer: customer.to_string(),
                day,
                hour: (8 + 5 * k) % 24,
                products,
            });
            day += gap;
            k += 1;
        }
    }
    orders
}

fn products() -> Vec<ProductRecord> {
    (0..12)
        .map(|idx| ProductRecord {
            product_id: format!("p{idx}"),
            category_id: Some(format!("cat{}", idx % 3)),
        })
        .collect()
}

fn event_log(orders: &[Order]) -> EventLog {
    let order_records = orders
        .iter()
        .map(|o| OrderRecord {
            order_id: o.id.clone(),
            customer_id: o.customer.clone(),
            ts_ms_utc: ts_ms(o.day, o.hour),
        })
        .collect();
    let line_records = orders
        .iter()
        .flat_map(|o| {
            o.products.iter().map(move |p| LineItemRecord {
                order_id: o.id.clone(),
                product_id: p.clone(),
                quantity: 1,
            })
        })
        .collect();
    EventLog::from_records(order_records, line_records, products()).0
}

fn write_sources(dir: &Path, orders: &[Order]) -> SourcePaths {
    let mut orders_csv = String::from("order_id,user_id,order_timestamp\n");
    let mut lines_csv = String::from("order_id,product_id,add_to_cart_order,reordered\n");
    for order in orders {
        let secs = ts_ms(order.day, order.hour) / 1000;
        writeln!(orders_csv, "{},{},{}", order.id, order.customer, secs).expect("write");
        for (pos, product) in order.products.iter().enumerate() {
            writeln!(lines_csv, "{},{},{},0", order.id, product, pos + 1).expect("write");
        }
    }
    let mut products_csv = String::from("product_id,product_name,category_id\n");
    for product in products() {
        writeln!(
            products_csv,
            "{},item,{}",
            product.product_id,
            product.category_id.unwrap_or_default()
        )
        .expect("write");
    }

    let sources = SourcePaths {
        orders: dir.join("orders.csv"),
        order_lines: vec![dir.join("order_products__prior.csv")],
        products: dir.join("products.csv"),
    };
    fs::write(&sources.orders, orders_csv).expect("orders fixture");
    fs::write(&sources.order_lines[0], lines_csv).expect("lines fixture");
    fs::write(&sources.products, products_csv).expect("products fixture");
    sources
}

fn rolling_config() -> PipelineConfig {
    PipelineConfig {
        cutoff: CutoffConfig {
            mode: CutoffMode::Rolling { stride_days: 30 },
            ..CutoffConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn fixed_config(cutoff_day: i64) -> PipelineConfig {
    PipelineConfig {
        cutoff: CutoffConfig {
            mode: CutoffMode::FixedDate {
                cutoff_ts_ms_utc: ts_ms(cutoff_day, 0),
            },
            min_history_orders: 2,
            min_history_days: 10,
            require_later_order: true,
        },
        ..PipelineConfig::default()
    }
}

fn value_of(columns: &[FeatureColumn], row: &FeatureRow, name: &str) -> FeatureValue {
    let idx = columns
        .iter()
        .position(|c| c.name == name)
        .expect("column should exist");
    row.values[idx]
}

#[test]
fn rolling_table_has_both_classes_and_finite_values() {
    let log = event_log(&synthetic_orders());
    let table = build_feature_table(&log, &rolling_config()).expect("table should build");

    assert!(!table.rows.is_empty());
    assert!(table.churned_count() > 0);
    assert!(table.churned_count() < table.rows.len());
    assert!(table
        .rows
        .windows(2)
        .all(|pair| (&pair[0].customer_id, pair[0].cutoff_ts_ms_utc)
            < (&pair[1].customer_id, pair[1].cutoff_ts_ms_utc)));
    for row in &table.rows {
        assert_eq!(row.values.len(), table.schema.columns.len());
        assert!(row.values.iter().all(FeatureValue::is_finite));
    }
    // Cutoffs whose horizon runs past the data are excluded, never labeled active.
    let last_data_ms = ts_ms(300, 23);
    assert!(table
        .rows
        .iter()
        .all(|row| row.cutoff_ts_ms_utc + 30 * DAY_MS <= last_data_ms));
}

#[test]
fn orders_after_cutoff_never_change_features() {
    let cutoff_day = 200;
    let base = synthetic_orders();
    let mut extended = synthetic_orders();
    for customer in ["c-daily", "c-weekly", "c-monthly", "c-sparse"] {
        extended.push(Order {
            id: format!("{customer}-future-near"),
            customer: customer.to_string(),
            day: cutoff_day,
            hour: 1,
            products: vec!["p11".to_string()],
        });
        extended.push(Order {
            id: format!("{customer}-future-far"),
            customer: customer.to_string(),
            day: 290,
            hour: 3,
            products: (0..40).map(|idx| format!("new{idx}")).collect(),
        });
    }

    let cfg = fixed_config(cutoff_day);
    let before = build_feature_table(&event_log(&base), &cfg).expect("base table");
    let after = build_feature_table(&event_log(&extended), &cfg).expect("extended table");

    assert_eq!(before.schema, after.schema);
    assert_eq!(before.rows.len(), after.rows.len());
    assert!(!before.rows.is_empty());
    for (a, b) in before.rows.iter().zip(&after.rows) {
        assert_eq!(a.customer_id, b.customer_id);
        assert_eq!(a.cutoff_ts_ms_utc, b.cutoff_ts_ms_utc);
        assert_eq!(a.values, b.values, "features leaked for {}", a.customer_id);
    }
}

#[test]
fn short_history_falls_back_to_neutral_trend_with_flag() {
    let mut orders = synthetic_orders();
    for (k, day) in [150, 170, 185, 195].into_iter().enumerate() {
        orders.push(Order {
            id: format!("c-newbie-{k}"),
            customer: "c-newbie".to_string(),
            day,
            hour: 12,
            products: vec!["p1".to_string(), "p2".to_string()],
        });
    }
    let mut cfg = fixed_config(190);
    cfg.features.trend_neutral_value = -7.5;

    let table = build_feature_table(&event_log(&orders), &cfg).expect("table");
    let columns = &table.schema.columns;

    let newbie = table
        .rows
        .iter()
        .find(|row| row.customer_id == "c-newbie")
        .expect("newbie should have a point");
    assert_eq!(
        value_of(columns, newbie, "low_confidence_trend"),
        FeatureValue::Bool(true)
    );
    assert_eq!(
        value_of(columns, newbie, "order_count_trend"),
        FeatureValue::F64(-7.5)
    );

    let veteran = table
        .rows
        .iter()
        .find(|row| row.customer_id == "c-daily")
        .expect("daily customer should have a point");
    assert_eq!(
        value_of(columns, veteran, "low_confidence_trend"),
        FeatureValue::Bool(false)
    );
}

#[test]
fn partition_count_does_not_change_output() {
    let log = event_log(&synthetic_orders());
    let mut single = rolling_config();
    single.partitions = 1;
    let mut many = rolling_config();
    many.partitions = 5;

    let a = build_feature_table(&log, &single).expect("single partition");
    let b = build_feature_table(&log, &many).expect("many partitions");
    assert_eq!(a, b);
    assert_eq!(a, build_feature_table(&log, &single).expect("repeat run"));
}

#[test]
fn persisted_store_round_trips_and_reruns_are_identical() {
    let tmp = TempDir::new().expect("tempdir should be created");
    let sources = write_sources(tmp.path(), &synthetic_orders());
    let cfg = rolling_config();

    let first_path = tmp.path().join("out/first.sqlite");
    let second_path = tmp.path().join("out/second.sqlite");
    let report = run_pipeline(&sources, &cfg, &first_path).expect("first run");
    run_pipeline(&sources, &cfg, &second_path).expect("second run");

    let fingerprint_re = Regex::new(r"^[0-9a-f]{64}$").expect("regex");
    assert!(fingerprint_re.is_match(&report.schema.fingerprint));

    let first = read_feature_store(&first_path).expect("first store");
    let second = read_feature_store(&second_path).expect("second store");
    assert_eq!(first, second);
    assert_eq!(first.schema, report.schema);
    assert_eq!(first.stamp, cfg.stamp());
    assert_eq!(first.label_column, "is_churned");
    assert_eq!(first.rows.len() as u64, report.rows);
    assert_eq!(first.churned_count() as u64, report.churned_rows);

    let in_memory = build_feature_table(&event_log(&synthetic_orders()), &cfg).expect("table");
    assert_eq!(first.rows, in_memory.rows);
}

#[test]
fn failed_run_leaves_previous_store_untouched() {
    let tmp = TempDir::new().expect("tempdir should be created");
    let good_dir = tmp.path().join("good");
    let bad_dir = tmp.path().join("bad");
    fs::create_dir_all(&good_dir).expect("good dir");
    fs::create_dir_all(&bad_dir).expect("bad dir");

    let cfg = rolling_config();
    let store_path = tmp.path().join("feature_store.sqlite");
    let good = write_sources(&good_dir, &synthetic_orders());
    run_pipeline(&good, &cfg, &store_path).expect("good run");
    let published = read_feature_store(&store_path).expect("published store");

    let bad = write_sources(&bad_dir, &synthetic_orders());
    let mut corrupted = fs::read_to_string(&bad.orders).expect("orders");
    for idx in 0..40 {
        corrupted.push_str(&format!("broken-{idx},c-daily,not-a-timestamp\n"));
    }
    fs::write(&bad.orders, corrupted).expect("corrupt orders");

    let err = run_pipeline(&bad, &cfg, &store_path).expect_err("drop rate should fail");
    assert!(matches!(err, PipelineError::Load(_)));

    let after = read_feature_store(&store_path).expect("store still readable");
    assert_eq!(after, published);
    assert!(!tmp.path().join("feature_store.sqlite.tmp").exists());
}

#[test]
fn reader_rejects_store_built_with_other_settings() {
    let tmp = TempDir::new().expect("tempdir should be created");
    let sources = write_sources(tmp.path(), &synthetic_orders());
    let store_path = tmp.path().join("feature_store.sqlite");
    run_pipeline(&sources, &rolling_config(), &store_path).expect("run");
    let store = read_feature_store(&store_path).expect("store");

    let same = build_feature_schema(&rolling_config());
    assert_schema_compatible(same.version, &same.fingerprint, &store.schema)
        .expect("same settings should be compatible");

    let mut other = rolling_config();
    other.horizon_days = 45;
    let expected = build_feature_schema(&other);
    let err = assert_schema_compatible(expected.version, &expected.fingerprint, &store.schema)
        .expect_err("different horizon should not match");
    assert!(matches!(err, StoreError::SchemaFingerprintMismatch { .. }));

    let err = assert_schema_compatible(expected.version + 1, &same.fingerprint, &store.schema)
        .expect_err("version bump should not match");
    assert!(matches!(err, StoreError::SchemaVersionMismatch { .. }));

    let missing = read_feature_store(&tmp.path().join("absent.sqlite"))
        .expect_err("missing store should fail");
    assert!(matches!(missing, StoreError::MissingStore(_)));
}
