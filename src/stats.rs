//! Store and index overview for `copilot stats`.
//!
//! Answers "is the data in and is the index fresh?": billing row counts,
//! the month range, resource status and tag coverage, and what the
//! retrieval index on disk was built from.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::index::RetrievalIndex;
use crate::resources::{assignment_status, AssignmentRow};

#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub billing_rows: i64,
    pub total_cost: f64,
    pub first_month: Option<String>,
    pub last_month: Option<String>,
    pub resources: i64,
    pub idle_resources: i64,
    pub assignment: Vec<AssignmentRow>,
}

pub async fn store_stats(pool: &SqlitePool) -> Result<StoreStats> {
    let (billing_rows, total_cost, first_month, last_month): (i64, f64, Option<String>, Option<String>) =
        sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(amount), 0.0), MIN(invoice_month), MAX(invoice_month) FROM billing_records",
        )
        .fetch_one(pool)
        .await?;

    let (resources, idle_resources): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'idle' THEN 1 ELSE 0 END), 0) FROM resources",
    )
    .fetch_one(pool)
    .await?;

    Ok(StoreStats {
        billing_rows,
        total_cost,
        first_month,
        last_month,
        resources,
        idle_resources,
        assignment: assignment_status(pool).await?,
    })
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = store_stats(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Cost Copilot Store Stats");
    println!("========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Billing rows: {}", stats.billing_rows);
    println!("  Total cost:   {:.2}", stats.total_cost);
    match (&stats.first_month, &stats.last_month) {
        (Some(first), Some(last)) => println!("  Months:       {} .. {}", first, last),
        _ => println!("  Months:       none"),
    }
    println!(
        "  Resources:    {} ({} idle)",
        stats.resources, stats.idle_resources
    );

    if !stats.assignment.is_empty() {
        println!();
        println!("  {:<24} {:>6} {:>8}", "ASSIGNMENT", "COUNT", "SHARE");
        println!("  {}", "-".repeat(40));
        for row in &stats.assignment {
            println!(
                "  {:<24} {:>6} {:>7.1}%",
                row.status, row.count, row.percentage
            );
        }
    }

    println!();
    let index_path = &config.retrieval.index_path;
    if index_path.exists() {
        match RetrievalIndex::load(index_path) {
            Ok(index) => {
                let size = std::fs::metadata(index_path).map(|m| m.len()).unwrap_or(0);
                println!("  Index:       {} ({})", index_path.display(), format_bytes(size));
                println!("  Chunks:      {}", index.len());
                println!("  Model:       {} ({} dims)", index.model, index.dims);
                println!("  Built:       {}", format_ts_relative(index.built_at.timestamp()));
            }
            Err(e) => println!("  Index:       unreadable ({})", e),
        }
    } else {
        println!("  Index:       not built");
    }
    println!();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative time ("3 hours ago") for the last 30 days, ISO-ish after that.
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn recent_timestamps_are_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }

    #[tokio::test]
    async fn empty_store() {
        let pool = memory_pool().await.unwrap();
        let stats = store_stats(&pool).await.unwrap();
        assert_eq!(stats.billing_rows, 0);
        assert_eq!(stats.total_cost, 0.0);
        assert!(stats.first_month.is_none());
        assert!(stats.assignment.is_empty());
    }

    #[tokio::test]
    async fn counts_rows_months_and_idle() {
        let pool = memory_pool().await.unwrap();
        sqlx::query(
            r#"
            INSERT INTO billing_records (resource_id, usage_date, invoice_month, category, amount, units, loaded_at)
            VALUES ('a', '2025-06-01', '2025-06', 'C', 10, 1, 0),
                   ('b', '2025-08-01', '2025-08', 'C', 5.5, 1, 0)
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO resources (resource_id, owner, env, status) VALUES ('a', 'team-A', 'prod', 'idle'), ('b', NULL, NULL, 'active')")
            .execute(&pool)
            .await
            .unwrap();

        let stats = store_stats(&pool).await.unwrap();
        assert_eq!(stats.billing_rows, 2);
        assert_eq!(stats.total_cost, 15.5);
        assert_eq!(stats.first_month.as_deref(), Some("2025-06"));
        assert_eq!(stats.last_month.as_deref(), Some("2025-08"));
        assert_eq!((stats.resources, stats.idle_resources), (2, 1));
        assert_eq!(stats.assignment.len(), 2);
    }
}
