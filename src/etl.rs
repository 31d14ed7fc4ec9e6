//! Billing ETL: parse → validate → load.
//!
//! Raw billing exports arrive as CSV (`.csv`, `.txt`) or a JSON array of
//! objects (`.json`). Column names are trimmed and resolved through a small
//! alias table so both the `date/category/amount/units` layout and the
//! `invoice_month/service/cost/usage_qty` layout load without conversion.
//!
//! A missing required **column** fails the whole file. A malformed **row**
//! is rejected with its 1-based row number and reason; the remaining rows
//! still load. Every accepted row is written in a single transaction.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::error::CopilotError;
use crate::models::{month_of, BillingRecord};

/// Canonical column → accepted header names, in priority order.
const COLUMN_ALIASES: &[(&str, &[&str])] = &[
    ("resource_id", &["resource_id"]),
    ("date", &["date", "usage_date", "invoice_month"]),
    ("category", &["category", "service"]),
    ("amount", &["amount", "cost"]),
    ("units", &["units", "usage_qty"]),
    ("currency", &["currency"]),
    ("unit_cost", &["unit_cost"]),
    ("account_id", &["account_id"]),
    ("subscription", &["subscription"]),
    ("resource_group", &["resource_group"]),
    ("region", &["region"]),
];

const REQUIRED_COLUMNS: &[&str] = &["resource_id", "date", "category", "amount", "units"];

/// One raw row keyed by canonical column name. Absent cells have no entry.
type RawRow = HashMap<&'static str, String>;

/// Outcome of parsing and validating one input file.
#[derive(Debug, Default)]
pub struct EtlReport {
    pub rows_read: usize,
    pub records: Vec<BillingRecord>,
    pub rejected: Vec<CopilotError>,
    pub warnings: Vec<String>,
}

impl EtlReport {
    pub fn accepted(&self) -> usize {
        self.records.len()
    }
}

/// Counts from a committed load.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub inserted: usize,
    pub new_resources: usize,
}

/// CLI entry point for `copilot ingest`.
pub async fn run_ingest(config: &Config, path: &Path, replace: bool) -> Result<()> {
    let report = parse_file(path, &config.etl.default_currency)?;

    println!("ingest {}", path.display());
    println!("  rows read: {}", report.rows_read);
    println!("  accepted: {}", report.accepted());
    println!("  rejected: {}", report.rejected.len());
    for err in &report.rejected {
        println!("    - {}", err);
    }
    if report.warnings.is_empty() {
        println!("  quality: no issues detected");
    } else {
        println!("  quality warnings:");
        for w in &report.warnings {
            println!("    - {}", w);
        }
    }

    let pool = db::connect(config).await?;
    let summary = load(&pool, &report.records, replace).await?;
    pool.close().await;

    println!("  inserted: {}", summary.inserted);
    println!("  new resources: {}", summary.new_resources);
    println!("ok");
    Ok(())
}

/// Read, validate and quality-check a billing file without touching the store.
pub fn parse_file(path: &Path, default_currency: &str) -> Result<EtlReport> {
    if !path.exists() {
        bail!("Input file not found: {}", path.display());
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let rows = match ext.as_str() {
        "csv" | "txt" => read_csv_rows(&content)?,
        "json" => read_json_rows(&content)?,
        other => bail!("Unsupported file type: .{}", other),
    };

    Ok(validate_rows(rows, default_currency))
}

/// Validate already-split rows. Row numbers are 1-based, header excluded.
fn validate_rows(rows: Vec<std::result::Result<RawRow, String>>, default_currency: &str) -> EtlReport {
    let mut report = EtlReport {
        rows_read: rows.len(),
        ..Default::default()
    };

    for (i, row) in rows.into_iter().enumerate() {
        let row_no = i + 1;
        let parsed = row
            .map_err(|reason| CopilotError::validation(row_no, reason))
            .and_then(|raw| validate_row(row_no, &raw, default_currency));
        match parsed {
            Ok(record) => report.records.push(record),
            Err(e) => {
                tracing::debug!(error = %e, "rejected billing row");
                report.rejected.push(e);
            }
        }
    }

    report.warnings = quality_checks(&report.records);
    report
}

fn resolve_columns<'a>(headers: impl Iterator<Item = &'a str>) -> Result<Vec<(usize, &'static str)>> {
    let trimmed: Vec<String> = headers.map(|h| h.trim().to_string()).collect();
    let mut mapping = Vec::new();
    let mut missing = Vec::new();

    for (canonical, aliases) in COLUMN_ALIASES {
        let found = aliases
            .iter()
            .find_map(|alias| trimmed.iter().position(|h| h == alias));
        match found {
            Some(idx) => mapping.push((idx, *canonical)),
            None if REQUIRED_COLUMNS.contains(canonical) => missing.push(*canonical),
            None => {}
        }
    }

    if !missing.is_empty() {
        bail!("Missing required columns: {}", missing.join(", "));
    }
    Ok(mapping)
}

fn read_csv_rows(content: &str) -> Result<Vec<std::result::Result<RawRow, String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = reader.headers().context("Failed to read CSV header")?.clone();
    let mapping = resolve_columns(headers.iter())?;

    let mut rows = Vec::new();
    for result in reader.records() {
        match result {
            Ok(record) => {
                let mut raw = RawRow::new();
                for (idx, canonical) in &mapping {
                    if let Some(value) = record.get(*idx) {
                        raw.insert(*canonical, value.to_string());
                    }
                }
                rows.push(Ok(raw));
            }
            Err(e) => rows.push(Err(format!("unreadable CSV record: {}", e))),
        }
    }
    Ok(rows)
}

fn read_json_rows(content: &str) -> Result<Vec<std::result::Result<RawRow, String>>> {
    let value: serde_json::Value =
        serde_json::from_str(content).context("Failed to parse JSON input")?;
    let items = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("JSON input must be an array of objects"))?;

    // Union of keys across all objects acts as the header.
    let mut keys: Vec<String> = Vec::new();
    for item in items {
        if let Some(obj) = item.as_object() {
            for k in obj.keys() {
                if !keys.iter().any(|existing| existing == k.trim()) {
                    keys.push(k.trim().to_string());
                }
            }
        }
    }
    let mapping = resolve_columns(keys.iter().map(|k| k.as_str()))?;

    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let Some(obj) = item.as_object() else {
            rows.push(Err("row is not a JSON object".to_string()));
            continue;
        };
        let trimmed: HashMap<&str, &serde_json::Value> =
            obj.iter().map(|(k, v)| (k.trim(), v)).collect();
        let mut raw = RawRow::new();
        for (idx, canonical) in &mapping {
            let key = keys[*idx].as_str();
            match trimmed.get(key) {
                Some(serde_json::Value::Null) | None => {}
                Some(serde_json::Value::String(s)) => {
                    raw.insert(*canonical, s.clone());
                }
                Some(other) => {
                    raw.insert(*canonical, other.to_string());
                }
            }
        }
        rows.push(Ok(raw));
    }
    Ok(rows)
}

fn cell<'a>(raw: &'a RawRow, column: &str) -> Option<&'a str> {
    raw.get(column).map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn parse_number(row: usize, raw: &RawRow, column: &str) -> crate::error::Result<f64> {
    let text = cell(raw, column)
        .ok_or_else(|| CopilotError::validation(row, format!("missing {}", column)))?;
    let value: f64 = text
        .parse()
        .map_err(|_| CopilotError::validation(row, format!("{} is not a number: {:?}", column, text)))?;
    if !value.is_finite() {
        return Err(CopilotError::validation(row, format!("{} is not finite", column)));
    }
    if value < 0.0 {
        return Err(CopilotError::validation(row, format!("{} is negative: {}", column, value)));
    }
    Ok(value)
}

/// Accepts `YYYY-MM-DD` or `YYYY-MM` (first of the month).
pub fn parse_usage_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(&format!("{}-01", text), "%Y-%m-%d").ok())
}

fn validate_row(row: usize, raw: &RawRow, default_currency: &str) -> crate::error::Result<BillingRecord> {
    let resource_id = cell(raw, "resource_id")
        .ok_or_else(|| CopilotError::validation(row, "empty resource_id"))?;

    let date_text = cell(raw, "date").ok_or_else(|| CopilotError::validation(row, "missing date"))?;
    let usage_date = parse_usage_date(date_text)
        .ok_or_else(|| CopilotError::validation(row, format!("unparseable date: {:?}", date_text)))?;

    let category = cell(raw, "category")
        .ok_or_else(|| CopilotError::validation(row, "empty category"))?;

    let amount = parse_number(row, raw, "amount")?;
    let units = parse_number(row, raw, "units")?;

    let currency = cell(raw, "currency")
        .unwrap_or(default_currency)
        .to_ascii_uppercase();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(CopilotError::validation(row, format!("invalid currency code: {:?}", currency)));
    }

    let unit_cost = match cell(raw, "unit_cost") {
        Some(_) => Some(parse_number(row, raw, "unit_cost")?),
        None if units > 0.0 => Some(amount / units),
        None => None,
    };

    let optional = |col: &str| cell(raw, col).map(|s| s.to_string());

    Ok(BillingRecord {
        resource_id: resource_id.to_string(),
        invoice_month: month_of(usage_date),
        usage_date,
        category: category.to_string(),
        amount,
        currency,
        units,
        unit_cost,
        account_id: optional("account_id"),
        subscription: optional("subscription"),
        resource_group: optional("resource_group"),
        region: optional("region"),
    })
}

/// `numpy.isclose`-style comparison: `|a - b| <= atol + rtol * |b|`.
fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-2 + 1e-3 * b.abs()
}

/// Warnings over accepted rows. These never reject a row.
pub fn quality_checks(records: &[BillingRecord]) -> Vec<String> {
    let mut warnings = Vec::new();

    let mut seen: HashSet<(&str, &str, &str)> = HashSet::new();
    let mut duplicates = 0usize;
    for r in records {
        if !seen.insert((&r.resource_id, &r.invoice_month, &r.category)) {
            duplicates += 1;
        }
    }
    if duplicates > 0 {
        warnings.push(format!(
            "{} duplicate rows by (resource_id, invoice_month, category)",
            duplicates
        ));
    }

    let mismatched = records
        .iter()
        .filter(|r| match r.unit_cost {
            Some(uc) => !is_close(r.units * uc, r.amount),
            None => false,
        })
        .count();
    if mismatched > 0 {
        warnings.push(format!(
            "{} rows where units * unit_cost != amount (possible data issue)",
            mismatched
        ));
    }

    warnings
}

/// Insert validated records in one transaction.
///
/// Creates an untagged resource row for every unseen resource id and
/// advances each resource's `last_seen_at` to its newest date with usage.
pub async fn load(pool: &SqlitePool, records: &[BillingRecord], replace: bool) -> Result<LoadSummary> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    if replace {
        sqlx::query("DELETE FROM billing_records")
            .execute(&mut *tx)
            .await?;
    }

    for r in records {
        sqlx::query(
            r#"
            INSERT INTO billing_records (resource_id, usage_date, invoice_month, category, amount, currency, units, unit_cost, account_id, subscription, resource_group, region, loaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.resource_id)
        .bind(r.usage_date.format("%Y-%m-%d").to_string())
        .bind(&r.invoice_month)
        .bind(&r.category)
        .bind(r.amount)
        .bind(&r.currency)
        .bind(r.units)
        .bind(r.unit_cost)
        .bind(&r.account_id)
        .bind(&r.subscription)
        .bind(&r.resource_group)
        .bind(&r.region)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    // Newest date with usage per resource; None when a resource never had units.
    let mut latest_usage: BTreeMap<&str, Option<NaiveDate>> = BTreeMap::new();
    for r in records {
        let entry = latest_usage.entry(r.resource_id.as_str()).or_insert(None);
        if r.units > 0.0 && entry.map_or(true, |d| r.usage_date > d) {
            *entry = Some(r.usage_date);
        }
    }

    let mut new_resources = 0usize;
    for (resource_id, last_usage) in &latest_usage {
        let created = sqlx::query("INSERT OR IGNORE INTO resources (resource_id) VALUES (?)")
            .bind(resource_id)
            .execute(&mut *tx)
            .await?;
        new_resources += created.rows_affected() as usize;

        if let Some(date) = last_usage {
            let ts = date
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp())
                .unwrap_or_default();
            sqlx::query(
                "UPDATE resources SET last_seen_at = MAX(COALESCE(last_seen_at, 0), ?) WHERE resource_id = ?",
            )
            .bind(ts)
            .bind(resource_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;

    tracing::info!(
        inserted = records.len(),
        new_resources,
        replace,
        "billing load committed"
    );

    Ok(LoadSummary {
        inserted: records.len(),
        new_resources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tmp(name: &str, content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn csv_with_canonical_columns() {
        let (_dir, path) = write_tmp(
            "billing.csv",
            "resource_id,date,category,amount,units\nvm-1,2025-08-03,Compute,12.5,5\n",
        );
        let report = parse_file(&path, "USD").unwrap();
        assert_eq!(report.rows_read, 1);
        assert_eq!(report.accepted(), 1);
        let r = &report.records[0];
        assert_eq!(r.invoice_month, "2025-08");
        assert_eq!(r.currency, "USD");
        assert_eq!(r.unit_cost, Some(2.5));
    }

    #[test]
    fn csv_with_invoice_layout_aliases() {
        let (_dir, path) = write_tmp(
            "billing.csv",
            " invoice_month ,account_id,subscription,service,resource_group,resource_id,region,usage_qty,unit_cost,cost\n\
             2025-07,acct-1,sub-1,Storage,rg-1,st-9,eastus,100,0.02,2.0\n",
        );
        let report = parse_file(&path, "USD").unwrap();
        assert_eq!(report.accepted(), 1);
        let r = &report.records[0];
        assert_eq!(r.usage_date, NaiveDate::from_ymd_opt(2025, 7, 1).unwrap());
        assert_eq!(r.category, "Storage");
        assert_eq!(r.region.as_deref(), Some("eastus"));
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let (_dir, path) = write_tmp("billing.csv", "resource_id,date,category,amount\nvm-1,2025-08-01,Compute,1\n");
        let err = parse_file(&path, "USD").unwrap_err();
        assert!(err.to_string().contains("units"));
    }

    #[test]
    fn malformed_rows_rejected_with_reasons() {
        let (_dir, path) = write_tmp(
            "billing.csv",
            "resource_id,date,category,amount,units,currency\n\
             vm-1,2025-08-01,Compute,10,2,USD\n\
             ,2025-08-01,Compute,10,2,USD\n\
             vm-3,not-a-date,Compute,10,2,USD\n\
             vm-4,2025-08-01,Compute,abc,2,USD\n\
             vm-5,2025-08-01,Compute,-4,2,USD\n\
             vm-6,2025-08-01,Compute,10,2,DOLLARS\n\
             vm-7,2025-08-01,,10,2,USD\n",
        );
        let report = parse_file(&path, "USD").unwrap();
        assert_eq!(report.rows_read, 7);
        assert_eq!(report.accepted(), 1);
        assert_eq!(report.rejected.len(), 6);

        let rows: Vec<usize> = report
            .rejected
            .iter()
            .map(|e| match e {
                CopilotError::Validation { row, .. } => *row,
                other => panic!("unexpected error: {:?}", other),
            })
            .collect();
        assert_eq!(rows, vec![2, 3, 4, 5, 6, 7]);
        assert!(report.rejected[0].to_string().contains("resource_id"));
        assert!(report.rejected[1].to_string().contains("date"));
        assert!(report.rejected[3].to_string().contains("negative"));
    }

    #[test]
    fn json_array_input() {
        let (_dir, path) = write_tmp(
            "billing.json",
            r#"[
                {"resource_id": "vm-1", "usage_date": "2025-08-02", "service": "Compute", "cost": 9.0, "usage_qty": 3},
                {"resource_id": "vm-2", "usage_date": "2025-08-02", "service": "Compute", "cost": null, "usage_qty": 3},
                "junk"
            ]"#,
        );
        let report = parse_file(&path, "EUR").unwrap();
        assert_eq!(report.rows_read, 3);
        assert_eq!(report.accepted(), 1);
        assert_eq!(report.records[0].currency, "EUR");
        assert_eq!(report.rejected.len(), 2);
    }

    #[test]
    fn unsupported_extension_rejected() {
        let (_dir, path) = write_tmp("billing.xlsx", "whatever");
        assert!(parse_file(&path, "USD").is_err());
    }

    #[test]
    fn quality_checks_flag_duplicates_and_mismatches() {
        let d = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        let a = BillingRecord::new("vm-1", d, "Compute", 10.0, 2.0);
        let b = BillingRecord::new("vm-1", d, "Compute", 10.0, 2.0);
        let mut c = BillingRecord::new("vm-2", d, "Compute", 10.0, 2.0);
        c.unit_cost = Some(7.0);
        let warnings = quality_checks(&[a, b, c]);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("1 duplicate"));
        assert!(warnings[1].contains("1 rows"));
    }

    #[test]
    fn tolerance_matches_rounding() {
        assert!(is_close(10.004, 10.0));
        assert!(!is_close(10.5, 10.0));
    }

    #[tokio::test]
    async fn load_creates_untagged_resources_and_advances_last_seen() {
        let pool = crate::db::memory_pool().await.unwrap();

        let d1 = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2025, 8, 20).unwrap();
        let records = vec![
            BillingRecord::new("vm-1", d1, "Compute", 10.0, 2.0),
            BillingRecord::new("vm-1", d2, "Compute", 3.0, 0.0),
            BillingRecord::new("vm-2", d2, "Storage", 1.0, 4.0),
        ];
        let summary = load(&pool, &records, false).await.unwrap();
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.new_resources, 2);

        let (owner, last_seen): (Option<String>, Option<i64>) =
            sqlx::query_as("SELECT owner, last_seen_at FROM resources WHERE resource_id = 'vm-1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(owner.is_none());
        // The zero-usage row on the 20th must not count as usage.
        let expected = d1.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();
        assert_eq!(last_seen, Some(expected));

        let summary = load(&pool, &records[..1], true).await.unwrap();
        assert_eq!(summary.new_resources, 0);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM billing_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
