use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Billing line items, one per resource/day/category
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS billing_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resource_id TEXT NOT NULL,
            usage_date TEXT NOT NULL,
            invoice_month TEXT NOT NULL,
            category TEXT NOT NULL,
            amount REAL NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD',
            units REAL NOT NULL,
            unit_cost REAL,
            account_id TEXT,
            subscription TEXT,
            resource_group TEXT,
            region TEXT,
            loaded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Resource metadata; tags may be null
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resources (
            resource_id TEXT PRIMARY KEY,
            owner TEXT,
            project TEXT,
            env TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            last_seen_at INTEGER,
            tags_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_billing_month ON billing_records(invoice_month)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_billing_resource ON billing_records(resource_id, invoice_month)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
