//! Read side of the schema store.
//!
//! Loads billing rows and resources into domain types for the analytics and
//! recommendation layers. Rows that fail to decode (null or non-finite
//! numerics, unparseable dates, unknown status) are skipped and counted so a
//! single bad row never takes down a KPI or recommendation request.

use chrono::{DateTime, NaiveDate};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::models::{BillingRecord, Resource, ResourceStatus};

/// Items decoded from the store plus the number of rows that were skipped.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub items: Vec<T>,
    pub skipped: usize,
}

pub async fn load_billing(pool: &SqlitePool) -> Result<Loaded<BillingRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT resource_id, usage_date, invoice_month, category, amount, currency,
               units, unit_cost, account_id, subscription, resource_group, region
        FROM billing_records
        ORDER BY invoice_month, usage_date, id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut items = Vec::with_capacity(rows.len());
    let mut skipped = 0usize;
    for row in &rows {
        match decode_billing(row) {
            Some(r) => items.push(r),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!(skipped, "skipped malformed billing rows");
    }
    Ok(Loaded { items, skipped })
}

fn decode_billing(row: &SqliteRow) -> Option<BillingRecord> {
    let resource_id: String = row.try_get::<Option<String>, _>("resource_id").ok()??;
    let resource_id = resource_id.trim().to_string();
    if resource_id.is_empty() {
        return None;
    }
    let date_text: String = row.try_get::<Option<String>, _>("usage_date").ok()??;
    let usage_date = NaiveDate::parse_from_str(&date_text, "%Y-%m-%d").ok()?;
    let invoice_month: String = row.try_get::<Option<String>, _>("invoice_month").ok()??;
    let category: String = row.try_get::<Option<String>, _>("category").ok()??;
    let amount: f64 = row.try_get::<Option<f64>, _>("amount").ok()??;
    let units: f64 = row.try_get::<Option<f64>, _>("units").ok()??;
    if !amount.is_finite() || !units.is_finite() {
        return None;
    }
    let unit_cost = row
        .try_get::<Option<f64>, _>("unit_cost")
        .ok()
        .flatten()
        .filter(|c| c.is_finite());
    let text = |col: &str| row.try_get::<Option<String>, _>(col).ok().flatten();

    Some(BillingRecord {
        resource_id,
        usage_date,
        invoice_month,
        category,
        amount,
        currency: text("currency").unwrap_or_else(|| "USD".to_string()),
        units,
        unit_cost,
        account_id: text("account_id"),
        subscription: text("subscription"),
        resource_group: text("resource_group"),
        region: text("region"),
    })
}

pub async fn load_resources(pool: &SqlitePool) -> Result<Loaded<Resource>> {
    let rows = sqlx::query(
        "SELECT resource_id, owner, project, env, status, last_seen_at, tags_json FROM resources ORDER BY resource_id",
    )
    .fetch_all(pool)
    .await?;

    let mut items = Vec::with_capacity(rows.len());
    let mut skipped = 0usize;
    for row in &rows {
        match decode_resource(row) {
            Some(r) => items.push(r),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!(skipped, "skipped malformed resource rows");
    }
    Ok(Loaded { items, skipped })
}

fn decode_resource(row: &SqliteRow) -> Option<Resource> {
    let resource_id: String = row.try_get("resource_id").ok()?;
    let status = row
        .try_get::<Option<String>, _>("status")
        .ok()
        .flatten()
        .map(|s| s.parse::<ResourceStatus>())
        .transpose()
        .ok()?
        .unwrap_or(ResourceStatus::Active);
    let last_seen_at = match row.try_get::<Option<i64>, _>("last_seen_at").ok()? {
        Some(ts) => Some(DateTime::from_timestamp(ts, 0)?),
        None => None,
    };
    let text = |col: &str| row.try_get::<Option<String>, _>(col).ok().flatten();

    Some(Resource {
        resource_id,
        owner: text("owner"),
        project: text("project"),
        env: text("env"),
        status,
        last_seen_at,
        tags_json: text("tags_json").unwrap_or_else(|| "{}".to_string()),
    })
}

/// Sorted distinct invoice months.
pub async fn available_months(pool: &SqlitePool) -> Result<Vec<String>> {
    let months: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT invoice_month FROM billing_records WHERE invoice_month IS NOT NULL ORDER BY invoice_month",
    )
    .fetch_all(pool)
    .await?;
    Ok(months)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QualityIssue {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: i64,
}

/// Store-level data quality scan: null key fields, negative costs and
/// resource ids that appear more than once.
pub async fn quality_issues(pool: &SqlitePool) -> Result<Vec<QualityIssue>> {
    let mut issues = Vec::new();

    let nulls: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM billing_records
        WHERE invoice_month IS NULL OR resource_id IS NULL OR TRIM(resource_id) = '' OR amount IS NULL
        "#,
    )
    .fetch_one(pool)
    .await?;
    if nulls > 0 {
        issues.push(QualityIssue {
            kind: "null_values".to_string(),
            count: nulls,
        });
    }

    let negative: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM billing_records WHERE amount < 0")
        .fetch_one(pool)
        .await?;
    if negative > 0 {
        issues.push(QualityIssue {
            kind: "negative_costs".to_string(),
            count: negative,
        });
    }

    // Case or whitespace variants of the same id slip past the primary key.
    let duplicates: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(n - 1), 0) FROM (
            SELECT COUNT(*) AS n FROM resources
            GROUP BY LOWER(TRIM(resource_id))
            HAVING COUNT(*) > 1
        )
        "#,
    )
    .fetch_one(pool)
    .await?;
    if duplicates > 0 {
        issues.push(QualityIssue {
            kind: "duplicate_resource_ids".to_string(),
            count: duplicates,
        });
    }

    Ok(issues)
}
