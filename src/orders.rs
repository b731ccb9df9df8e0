//! Order repository loading: raw order, line-item and product tables into a
//! per-customer, time-sorted event log.
//!
//! The log is an arena of orders sorted by `(customer_id, ts_ms_utc, order_id)`, an
//! arena of line items, and an index from customer id to the contiguous slice of that
//! customer's orders. Nothing mutates it after [`EventLog::from_records`] returns.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::{Cursor, Read};
use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::config::{ConfigError, PipelineConfig};

pub const DAY_MS: i64 = 86_400_000;
const MAX_REPORTED_MALFORMED: usize = 32;

const ORDER_ID_COLUMNS: &[&str] = &["order_id"];
const CUSTOMER_ID_COLUMNS: &[&str] = &["customer_id", "user_id"];
const TIMESTAMP_COLUMNS: &[&str] = &["order_timestamp", "timestamp", "order_ts"];
const PRODUCT_ID_COLUMNS: &[&str] = &["product_id"];
const QUANTITY_COLUMNS: &[&str] = &["quantity", "qty"];

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceTable {
    Orders,
    OrderLines,
    Products,
}

impl SourceTable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::OrderLines => "order_lines",
            Self::Products => "products",
        }
    }
}

impl fmt::Display for SourceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePaths {
    pub orders: PathBuf,
    pub order_lines: Vec<PathBuf>,
    pub products: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub customer_id: String,
    pub ts_ms_utc: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemRecord {
    pub order_id: String,
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_id: String,
    pub category_id: Option<String>,
}

/// A single source row that could not be parsed. Recovered by dropping the row.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("malformed {table} record at line {line}: {reason}")]
pub struct MalformedRecordError {
    pub table: SourceTable,
    pub line: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataQualityError {
    #[error("{table} drop rate {dropped}/{total} exceeds max_drop_rate {max_drop_rate}")]
    DropRateExceeded {
        table: SourceTable,
        dropped: u64,
        total: u64,
        max_drop_rate: f64,
    },
    #[error("{table} table has no usable rows ({dropped} dropped)")]
    EmptyTable { table: SourceTable, dropped: u64 },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive at {path} has no CSV entry")]
    MissingCsvEntry { path: PathBuf },
    #[error("{table} source {path} has no column named any of {candidates:?}")]
    MissingColumn {
        table: SourceTable,
        path: PathBuf,
        candidates: Vec<String>,
    },
    #[error("data quality check failed: {0}")]
    DataQuality(#[from] DataQualityError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("observation point references customer {customer_id} absent from the event log")]
pub struct UnknownCustomerError {
    pub customer_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub orders_read: u64,
    pub orders_dropped: u64,
    pub duplicate_orders_removed: u64,
    pub lines_read: u64,
    pub lines_dropped: u64,
    pub orphan_lines: u64,
    pub products_read: u64,
    pub products_dropped: u64,
    pub unknown_product_lines: u64,
    pub customers: u64,
    pub orders_loaded: u64,
    pub lines_loaded: u64,
    pub first_order_ts_ms_utc: Option<i64>,
    pub last_order_ts_ms_utc: Option<i64>,
    pub malformed_samples: Vec<MalformedRecordError>,
}

impl LoadReport {
    fn record_malformed(&mut self, err: MalformedRecordError) {
        debug!(
            component = "loader",
            event = "loader.record.malformed",
            table = err.table.as_str(),
            line = err.line,
            reason = %err.reason
        );
        match err.table {
            SourceTable::Orders => self.orders_dropped += 1,
            SourceTable::OrderLines => self.lines_dropped += 1,
            SourceTable::Products => self.products_dropped += 1,
        }
        if self.malformed_samples.len() < MAX_REPORTED_MALFORMED {
            self.malformed_samples.push(err);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub duplicate_orders_removed: u64,
    pub orphan_lines: u64,
    pub unknown_product_lines: u64,
}

#[derive(Debug)]
pub struct LoadResult {
    pub log: EventLog,
    pub report: LoadReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderEvent {
    pub order_id: String,
    pub ts_ms_utc: i64,
    /// Sum of line-item quantities.
    pub item_count: u32,
    lines: Range<usize>,
}

impl OrderEvent {
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

/// One line item with product and category interned to dense ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineItem {
    pub product: u32,
    pub category: Option<u32>,
    pub quantity: u32,
}

#[derive(Debug, Clone)]
struct CustomerSpan {
    customer_id: String,
    orders: Range<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    orders: Vec<OrderEvent>,
    lines: Vec<LineItem>,
    customers: Vec<CustomerSpan>,
    index: HashMap<String, usize>,
    product_count: usize,
    category_count: usize,
}

/// Read-only view of one customer's time-sorted orders.
#[derive(Debug, Clone, Copy)]
pub struct Timeline<'a> {
    customer_id: &'a str,
    orders: &'a [OrderEvent],
    lines: &'a [LineItem],
}

impl<'a> Timeline<'a> {
    pub fn customer_id(&self) -> &'a str {
        self.customer_id
    }

    pub fn orders(&self) -> &'a [OrderEvent] {
        self.orders
    }

    pub fn lines_of(&self, order: &OrderEvent) -> &'a [LineItem] {
        &self.lines[order.lines.clone()]
    }

    pub fn first_ts_ms_utc(&self) -> i64 {
        self.orders.first().map(|o| o.ts_ms_utc).unwrap_or(i64::MIN)
    }

    pub fn last_ts_ms_utc(&self) -> i64 {
        self.orders.last().map(|o| o.ts_ms_utc).unwrap_or(i64::MIN)
    }

    /// Number of orders with timestamp at or before `cutoff_ts_ms_utc`.
    pub fn prior_len(&self, cutoff_ts_ms_utc: i64) -> usize {
        self.orders
            .partition_point(|order| order.ts_ms_utc <= cutoff_ts_ms_utc)
    }

    /// Orders with timestamp at or before `cutoff_ts_ms_utc`. Feature builders read only this.
    pub fn prior(&self, cutoff_ts_ms_utc: i64) -> &'a [OrderEvent] {
        &self.orders[..self.prior_len(cutoff_ts_ms_utc)]
    }
}

impl EventLog {
    /// Builds the log from typed records. Deduplicates orders by `order_id` keeping the
    /// first occurrence; line items whose order is unknown are dropped as orphans.
    pub fn from_records(
        orders: Vec<OrderRecord>,
        lines: Vec<LineItemRecord>,
        products: Vec<ProductRecord>,
    ) -> (Self, BuildStats) {
        let mut stats = BuildStats::default();

        let mut product_categories: HashMap<String, Option<String>> = HashMap::new();
        for product in products {
            product_categories
                .entry(product.product_id)
                .or_insert(product.category_id);
        }

        let mut seen_orders = HashSet::with_capacity(orders.len());
        let mut kept = Vec::with_capacity(orders.len());
        for order in orders {
            if seen_orders.insert(order.order_id.clone()) {
                kept.push(order);
            } else {
                stats.duplicate_orders_removed += 1;
            }
        }

        let mut lines_by_order: HashMap<String, Vec<LineItemRecord>> = HashMap::new();
        for line in lines {
            if seen_orders.contains(&line.order_id) {
                lines_by_order
                    .entry(line.order_id.clone())
                    .or_default()
                    .push(line);
            } else {
                stats.orphan_lines += 1;
            }
        }

        kept.sort_by(|a, b| {
            a.customer_id
                .cmp(&b.customer_id)
                .then(a.ts_ms_utc.cmp(&b.ts_ms_utc))
                .then_with(|| a.order_id.cmp(&b.order_id))
        });

        let mut product_ids: HashMap<String, u32> = HashMap::new();
        let mut category_ids: HashMap<String, u32> = HashMap::new();
        let mut log = EventLog {
            orders: Vec::with_capacity(kept.len()),
            ..EventLog::default()
        };

        for order in kept {
            let start = log.lines.len();
            let mut item_count = 0u32;
            for line in lines_by_order.remove(&order.order_id).unwrap_or_default() {
                let next_product = product_ids.len() as u32;
                let product = *product_ids
                    .entry(line.product_id.clone())
                    .or_insert(next_product);
                let category = match product_categories.get(&line.product_id) {
                    Some(Some(category_id)) => {
                        let next_category = category_ids.len() as u32;
                        Some(
                            *category_ids
                                .entry(category_id.clone())
                                .or_insert(next_category),
                        )
                    }
                    Some(None) => None,
                    None => {
                        stats.unknown_product_lines += 1;
                        None
                    }
                };
                item_count = item_count.saturating_add(line.quantity);
                log.lines.push(LineItem {
                    product,
                    category,
                    quantity: line.quantity,
                });
            }
            let end = log.lines.len();

            let order_idx = log.orders.len();
            match log.customers.last_mut() {
                Some(span) if span.customer_id == order.customer_id => {
                    span.orders.end = order_idx + 1;
                }
                _ => {
                    log.index
                        .insert(order.customer_id.clone(), log.customers.len());
                    log.customers.push(CustomerSpan {
                        customer_id: order.customer_id,
                        orders: order_idx..order_idx + 1,
                    });
                }
            }
            log.orders.push(OrderEvent {
                order_id: order.order_id,
                ts_ms_utc: order.ts_ms_utc,
                item_count,
                lines: start..end,
            });
        }

        log.product_count = product_ids.len();
        log.category_count = category_ids.len();
        (log, stats)
    }

    pub fn customer_count(&self) -> usize {
        self.customers.len()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn product_count(&self) -> usize {
        self.product_count
    }

    pub fn category_count(&self) -> usize {
        self.category_count
    }

    /// Earliest and latest order timestamps across all customers.
    pub fn time_range(&self) -> Option<(i64, i64)> {
        let first = self.orders.iter().map(|o| o.ts_ms_utc).min()?;
        let last = self.orders.iter().map(|o| o.ts_ms_utc).max()?;
        Some((first, last))
    }

    /// Timeline of the customer at position `idx` in customer-id order.
    pub fn timeline_at(&self, idx: usize) -> Option<Timeline<'_>> {
        let span = self.customers.get(idx)?;
        Some(Timeline {
            customer_id: &span.customer_id,
            orders: &self.orders[span.orders.clone()],
            lines: &self.lines,
        })
    }

    pub fn timeline(&self, customer_id: &str) -> Result<Timeline<'_>, UnknownCustomerError> {
        self.index
            .get(customer_id)
            .and_then(|idx| self.timeline_at(*idx))
            .ok_or_else(|| UnknownCustomerError {
                customer_id: customer_id.to_string(),
            })
    }
}

pub fn load_event_log(
    sources: &SourcePaths,
    cfg: &PipelineConfig,
) -> Result<LoadResult, LoadError> {
    let mut report = LoadReport::default();
    let log = load_event_log_into(sources, cfg, &mut report)?;
    Ok(LoadResult { log, report })
}

/// Same as [`load_event_log`], but counters accumulate in `report` so they survive a
/// failed load.
pub fn load_event_log_into(
    sources: &SourcePaths,
    cfg: &PipelineConfig,
    report: &mut LoadReport,
) -> Result<EventLog, LoadError> {
    let tz = cfg.features.tz()?;
    let max_drop_rate = cfg.loader.max_drop_rate;

    info!(
        component = "loader",
        event = "loader.load.start",
        orders_path = %sources.orders.display(),
        order_line_files = sources.order_lines.len(),
        products_path = %sources.products.display(),
        max_drop_rate
    );

    let orders = read_orders(&sources.orders, tz, report)?;
    check_drop_rate(
        SourceTable::Orders,
        report.orders_dropped,
        report.orders_read,
        max_drop_rate,
    )?;
    if orders.is_empty() {
        return Err(DataQualityError::EmptyTable {
            table: SourceTable::Orders,
            dropped: report.orders_dropped,
        }
        .into());
    }

    let mut lines = Vec::new();
    for path in &sources.order_lines {
        lines.append(&mut read_order_lines(path, report)?);
    }
    check_drop_rate(
        SourceTable::OrderLines,
        report.lines_dropped,
        report.lines_read,
        max_drop_rate,
    )?;

    let products = read_products(&sources.products, &cfg.loader.category_column, report)?;
    check_drop_rate(
        SourceTable::Products,
        report.products_dropped,
        report.products_read,
        max_drop_rate,
    )?;

    let (log, stats) = EventLog::from_records(orders, lines, products);
    report.duplicate_orders_removed = stats.duplicate_orders_removed;
    report.orphan_lines = stats.orphan_lines;
    report.unknown_product_lines = stats.unknown_product_lines;
    report.customers = log.customer_count() as u64;
    report.orders_loaded = log.order_count() as u64;
    report.lines_loaded = log.line_count() as u64;
    if let Some((first, last)) = log.time_range() {
        report.first_order_ts_ms_utc = Some(first);
        report.last_order_ts_ms_utc = Some(last);
    }

    if stats.duplicate_orders_removed > 0 {
        warn!(
            component = "loader",
            event = "loader.orders.deduplicated",
            duplicate_orders_removed = stats.duplicate_orders_removed
        );
    }
    if stats.orphan_lines > 0 || stats.unknown_product_lines > 0 {
        warn!(
            component = "loader",
            event = "loader.lines.unmatched",
            orphan_lines = stats.orphan_lines,
            unknown_product_lines = stats.unknown_product_lines
        );
    }
    if log.line_count() == 0 {
        warn!(
            component = "loader",
            event = "loader.quality.failed",
            table = SourceTable::OrderLines.as_str(),
            lines_read = report.lines_read,
            orphan_lines = report.orphan_lines
        );
        return Err(DataQualityError::EmptyTable {
            table: SourceTable::OrderLines,
            dropped: report.lines_dropped + report.orphan_lines,
        }
        .into());
    }

    info!(
        component = "loader",
        event = "loader.load.finish",
        customers = report.customers,
        orders_loaded = report.orders_loaded,
        orders_dropped = report.orders_dropped,
        lines_loaded = report.lines_loaded,
        lines_dropped = report.lines_dropped,
        products = log.product_count(),
        categories = log.category_count()
    );

    Ok(log)
}

fn check_drop_rate(
    table: SourceTable,
    dropped: u64,
    total: u64,
    max_drop_rate: f64,
) -> Result<(), DataQualityError> {
    if total == 0 {
        return Ok(());
    }
    let rate = dropped as f64 / total as f64;
    if rate > max_drop_rate {
        warn!(
            component = "loader",
            event = "loader.quality.failed",
            table = table.as_str(),
            dropped,
            total,
            max_drop_rate
        );
        return Err(DataQualityError::DropRateExceeded {
            table,
            dropped,
            total,
            max_drop_rate,
        });
    }
    Ok(())
}

fn read_orders(
    path: &Path,
    tz: Tz,
    report: &mut LoadReport,
) -> Result<Vec<OrderRecord>, LoadError> {
    let mut reader = open_table(path)?;
    let headers = reader.headers()?.clone();
    let order_col = require_column(&headers, ORDER_ID_COLUMNS, SourceTable::Orders, path)?;
    let customer_col = require_column(&headers, CUSTOMER_ID_COLUMNS, SourceTable::Orders, path)?;
    let ts_col = require_column(&headers, TIMESTAMP_COLUMNS, SourceTable::Orders, path)?;

    let mut out = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        report.orders_read += 1;
        let record = match record {
            Ok(record) => record,
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(err) => {
                report.record_malformed(malformed(SourceTable::Orders, idx, None, err));
                continue;
            }
        };
        match parse_order_record(&record, order_col, customer_col, ts_col, tz) {
            Ok(order) => out.push(order),
            Err(reason) => {
                report.record_malformed(malformed(SourceTable::Orders, idx, Some(&record), reason))
            }
        }
    }

    info!(
        component = "loader",
        event = "loader.table.read",
        table = SourceTable::Orders.as_str(),
        path = %path.display(),
        rows_read = report.orders_read,
        rows_dropped = report.orders_dropped
    );
    Ok(out)
}

fn read_order_lines(
    path: &Path,
    report: &mut LoadReport,
) -> Result<Vec<LineItemRecord>, LoadError> {
    let mut reader = open_table(path)?;
    let headers = reader.headers()?.clone();
    let order_col = require_column(&headers, ORDER_ID_COLUMNS, SourceTable::OrderLines, path)?;
    let product_col =
        require_column(&headers, PRODUCT_ID_COLUMNS, SourceTable::OrderLines, path)?;
    let quantity_col = find_column(&headers, QUANTITY_COLUMNS);

    let mut out = Vec::new();
    let mut read = 0u64;
    for (idx, record) in reader.records().enumerate() {
        read += 1;
        report.lines_read += 1;
        let record = match record {
            Ok(record) => record,
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(err) => {
                report.record_malformed(malformed(SourceTable::OrderLines, idx, None, err));
                continue;
            }
        };
        match parse_line_record(&record, order_col, product_col, quantity_col) {
            Ok(line) => out.push(line),
            Err(reason) => report.record_malformed(malformed(
                SourceTable::OrderLines,
                idx,
                Some(&record),
                reason,
            )),
        }
    }

    info!(
        component = "loader",
        event = "loader.table.read",
        table = SourceTable::OrderLines.as_str(),
        path = %path.display(),
        rows_read = read,
        rows_kept = out.len()
    );
    Ok(out)
}

fn read_products(
    path: &Path,
    category_column: &str,
    report: &mut LoadReport,
) -> Result<Vec<ProductRecord>, LoadError> {
    let mut reader = open_table(path)?;
    let headers = reader.headers()?.clone();
    let product_col = require_column(&headers, PRODUCT_ID_COLUMNS, SourceTable::Products, path)?;
    let category_col =
        require_column(&headers, &[category_column], SourceTable::Products, path)?;

    let mut out = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        report.products_read += 1;
        let record = match record {
            Ok(record) => record,
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(err) => {
                report.record_malformed(malformed(SourceTable::Products, idx, None, err));
                continue;
            }
        };
        let Some(product_id) = non_empty(&record, product_col) else {
            report.record_malformed(malformed(
                SourceTable::Products,
                idx,
                Some(&record),
                "missing product_id",
            ));
            continue;
        };
        out.push(ProductRecord {
            product_id: product_id.to_string(),
            category_id: non_empty(&record, category_col).map(str::to_string),
        });
    }

    info!(
        component = "loader",
        event = "loader.table.read",
        table = SourceTable::Products.as_str(),
        path = %path.display(),
        rows_read = report.products_read,
        rows_dropped = report.products_dropped
    );
    Ok(out)
}

fn parse_order_record(
    record: &StringRecord,
    order_col: usize,
    customer_col: usize,
    ts_col: usize,
    tz: Tz,
) -> Result<OrderRecord, String> {
    let order_id = non_empty(record, order_col).ok_or("missing order_id")?;
    let customer_id = non_empty(record, customer_col).ok_or("missing customer_id")?;
    let raw_ts = non_empty(record, ts_col).ok_or("missing order timestamp")?;
    let ts_ms_utc =
        parse_timestamp_ms(raw_ts, tz).ok_or_else(|| format!("unparsable timestamp '{raw_ts}'"))?;
    Ok(OrderRecord {
        order_id: order_id.to_string(),
        customer_id: customer_id.to_string(),
        ts_ms_utc,
    })
}

fn parse_line_record(
    record: &StringRecord,
    order_col: usize,
    product_col: usize,
    quantity_col: Option<usize>,
) -> Result<LineItemRecord, String> {
    let order_id = non_empty(record, order_col).ok_or("missing order_id")?;
    let product_id = non_empty(record, product_col).ok_or("missing product_id")?;
    let quantity = match quantity_col.and_then(|col| non_empty(record, col)) {
        None => 1,
        Some(raw) => match raw.parse::<u32>() {
            Ok(0) => return Err("quantity must be positive".to_string()),
            Ok(q) => q,
            Err(_) => return Err(format!("unparsable quantity '{raw}'")),
        },
    };
    Ok(LineItemRecord {
        order_id: order_id.to_string(),
        product_id: product_id.to_string(),
        quantity,
    })
}

/// Parses RFC 3339, naive date/datetime (interpreted in `tz`), or integer epoch values.
pub fn parse_timestamp_ms(raw: &str, tz: Tz) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(epoch) = raw.parse::<i64>() {
        return Some(normalize_epoch_to_millis(epoch));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.timestamp_millis());
        }
    }

    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let naive = date.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

fn normalize_epoch_to_millis(epoch: i64) -> i64 {
    let magnitude = epoch.unsigned_abs();
    if magnitude >= 100_000_000_000_000_000 {
        epoch / 1_000_000
    } else if magnitude >= 100_000_000_000_000 {
        epoch / 1_000
    } else if magnitude >= 100_000_000_000 {
        epoch
    } else {
        epoch.saturating_mul(1_000)
    }
}

fn open_table(path: &Path) -> Result<csv::Reader<Box<dyn Read>>, LoadError> {
    let is_zip = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);

    let source: Box<dyn Read> = if is_zip {
        Box::new(Cursor::new(read_zip_csv(path)?))
    } else {
        Box::new(fs::File::open(path)?)
    };

    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(source))
}

fn read_zip_csv(path: &Path) -> Result<Vec<u8>, LoadError> {
    let file = fs::File::open(path)?;
    let mut zip = ZipArchive::new(file)?;
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        return Ok(buf);
    }
    Err(LoadError::MissingCsvEntry {
        path: path.to_path_buf(),
    })
}

fn find_column(headers: &StringRecord, candidates: &[&str]) -> Option<usize> {
    headers.iter().position(|header| {
        let header = header.trim();
        candidates
            .iter()
            .any(|candidate| header.eq_ignore_ascii_case(candidate))
    })
}

fn require_column(
    headers: &StringRecord,
    candidates: &[&str],
    table: SourceTable,
    path: &Path,
) -> Result<usize, LoadError> {
    find_column(headers, candidates).ok_or_else(|| LoadError::MissingColumn {
        table,
        path: path.to_path_buf(),
        candidates: candidates.iter().map(|c| c.to_string()).collect(),
    })
}

fn non_empty(record: &StringRecord, idx: usize) -> Option<&str> {
    record
        .get(idx)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn malformed(
    table: SourceTable,
    idx: usize,
    record: Option<&StringRecord>,
    reason: impl fmt::Display,
) -> MalformedRecordError {
    // Header is line 1, so the n-th data record sits on line n + 2 when positions are unknown.
    let line = record
        .and_then(|r| r.position())
        .map(|pos| pos.line())
        .unwrap_or(idx as u64 + 2);
    MalformedRecordError {
        table,
        line,
        reason: reason.to_string(),
    }
}
