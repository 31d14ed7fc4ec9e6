//! Resource metadata jobs: seeding, assignment gaps, and status refresh.
//!
//! Billing feeds carry resource ids but no ownership. These jobs fill the
//! `resources` table with synthetic owner/project/env tags, punch controlled
//! holes in that tagging for demos and tests, and keep `status` in step with
//! the idleness rule. Every job runs in a single transaction.

use anyhow::{bail, Result};
use chrono::NaiveDate;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::models::ResourceStatus;
use crate::recommend::{default_as_of, last_usage_by_resource};
use crate::store;

pub const OWNERS: &[&str] = &["team-A", "team-B", "team-C", "team-D"];
pub const PROJECTS: &[&str] = &["proj-alpha", "proj-beta", "proj-gamma", "infra", "platform"];
pub const ENVS: &[&str] = &["dev", "staging", "prod"];
/// Dev-heavy, as most estates are.
const ENV_WEIGHTS: &[f64] = &[0.5, 0.2, 0.3];

/// Seeded when `seed` is given, otherwise from OS entropy.
pub fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Give synthetic tags to billed resource ids that have none.
///
/// A resource "has none" when it has no row or a row whose owner, project
/// and env are all null (the rows ETL creates). `force` re-seeds every
/// billed id. Returns the number of resources written.
pub async fn seed_resources(pool: &SqlitePool, force: bool, rng: &mut StdRng) -> Result<usize> {
    let ids: Vec<String> = if force {
        sqlx::query_scalar("SELECT DISTINCT resource_id FROM billing_records ORDER BY resource_id")
            .fetch_all(pool)
            .await?
    } else {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT b.resource_id FROM billing_records b
            LEFT JOIN resources r ON r.resource_id = b.resource_id
            WHERE r.resource_id IS NULL
               OR (r.owner IS NULL AND r.project IS NULL AND r.env IS NULL)
            ORDER BY b.resource_id
            "#,
        )
        .fetch_all(pool)
        .await?
    };

    let env_dist = WeightedIndex::new(ENV_WEIGHTS)?;
    let mut tx = pool.begin().await?;
    for id in &ids {
        let owner = OWNERS.choose(rng).copied().unwrap_or("team-A");
        let project = PROJECTS.choose(rng).copied().unwrap_or("infra");
        let env = ENVS[env_dist.sample(rng)];
        let tags = serde_json::json!({
            "project": project,
            "critical": if rng.gen_bool(0.5) { "yes" } else { "no" },
        });

        sqlx::query(
            r#"
            INSERT INTO resources (resource_id, owner, project, env, tags_json)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(resource_id) DO UPDATE SET
                owner = excluded.owner,
                project = excluded.project,
                env = excluded.env,
                tags_json = excluded.tags_json
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(project)
        .bind(env)
        .bind(tags.to_string())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    tracing::info!(seeded = ids.len(), force, "resources seeded");
    Ok(ids.len())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GapSummary {
    pub fully_unassigned: usize,
    pub missing_owner: usize,
    pub missing_env: usize,
}

/// Clear tags on a random share of resources.
///
/// `unassigned_pct` percent lose owner and env; the next `partial_pct`
/// percent are split between losing only the owner and only the env.
pub async fn assign_gaps(
    pool: &SqlitePool,
    unassigned_pct: f64,
    partial_pct: f64,
    rng: &mut StdRng,
) -> Result<GapSummary> {
    if !(0.0..=100.0).contains(&unassigned_pct)
        || !(0.0..=100.0).contains(&partial_pct)
        || unassigned_pct + partial_pct > 100.0
    {
        bail!("percentages must be within 0..=100 and sum to at most 100");
    }

    let mut ids: Vec<String> =
        sqlx::query_scalar("SELECT resource_id FROM resources ORDER BY resource_id")
            .fetch_all(pool)
            .await?;
    ids.shuffle(rng);

    let total = ids.len() as f64;
    let full_n = (total * unassigned_pct / 100.0) as usize;
    let partial_n = (total * partial_pct / 100.0) as usize;

    let fully = &ids[..full_n];
    let partial = &ids[full_n..full_n + partial_n];
    let (no_owner, no_env) = partial.split_at(partial.len() / 2);

    let mut tx = pool.begin().await?;
    for (group, sql) in [
        (fully, "UPDATE resources SET owner = NULL, env = NULL WHERE resource_id = ?"),
        (no_owner, "UPDATE resources SET owner = NULL WHERE resource_id = ?"),
        (no_env, "UPDATE resources SET env = NULL WHERE resource_id = ?"),
    ] {
        for id in group {
            sqlx::query(sql).bind(id).execute(&mut *tx).await?;
        }
    }
    tx.commit().await?;

    Ok(GapSummary {
        fully_unassigned: fully.len(),
        missing_owner: no_owner.len(),
        missing_env: no_env.len(),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub active: usize,
    pub idle: usize,
}

/// Mark each resource `idle` when its last usage is more than `idle_days`
/// before `as_of` (or it has never been used), `active` otherwise.
pub async fn refresh_status(
    pool: &SqlitePool,
    idle_days: i64,
    as_of: Option<NaiveDate>,
) -> Result<StatusSummary> {
    let billing = store::load_billing(pool).await?;
    let resources = store::load_resources(pool).await?;
    let as_of = as_of.unwrap_or_else(|| default_as_of(&billing.items));
    let last_usage = last_usage_by_resource(&billing.items, &resources.items);

    let mut summary = StatusSummary::default();
    let mut tx = pool.begin().await?;
    for r in &resources.items {
        let idle = match last_usage.get(r.resource_id.as_str()).copied().flatten() {
            Some(date) => (as_of - date).num_days() > idle_days,
            None => true,
        };
        let status = if idle {
            summary.idle += 1;
            ResourceStatus::Idle
        } else {
            summary.active += 1;
            ResourceStatus::Active
        };
        sqlx::query("UPDATE resources SET status = ? WHERE resource_id = ?")
            .bind(status.as_str())
            .bind(&r.resource_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(summary)
}

/// One line of the tag-assignment breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentRow {
    pub status: String,
    pub count: i64,
    pub percentage: f64,
}

pub async fn assignment_status(pool: &SqlitePool) -> Result<Vec<AssignmentRow>> {
    let rows: Vec<(String, i64, f64)> = sqlx::query_as(
        r#"
        SELECT
            CASE
                WHEN owner IS NULL AND env IS NULL THEN 'Completely Unassigned'
                WHEN owner IS NULL THEN 'Missing Owner'
                WHEN env IS NULL THEN 'Missing Environment'
                ELSE 'Fully Assigned'
            END AS status,
            COUNT(*) AS count,
            ROUND(COUNT(*) * 100.0 / (SELECT COUNT(*) FROM resources), 1) AS percentage
        FROM resources
        GROUP BY status
        ORDER BY count DESC, status
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(status, count, percentage)| AssignmentRow {
            status,
            count,
            percentage,
        })
        .collect())
}

fn print_assignment_status(rows: &[AssignmentRow]) {
    println!();
    println!("  Resource assignment status:");
    for row in rows {
        println!("    {:<24} {:>6} ({:.1}%)", row.status, row.count, row.percentage);
    }
}

// ============ CLI ============

pub async fn run_seed(config: &Config, force: bool, seed: Option<u64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let mut rng = make_rng(seed);
    let n = seed_resources(&pool, force, &mut rng).await?;
    if n == 0 {
        println!("No new resources to seed. Use --force to re-seed existing ones.");
    } else {
        println!("Seeded {} resources (force={}).", n, force);
    }
    print_assignment_status(&assignment_status(&pool).await?);
    pool.close().await;
    Ok(())
}

pub async fn run_assign_gaps(
    config: &Config,
    unassigned_pct: f64,
    partial_pct: f64,
    seed: Option<u64>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let mut rng = make_rng(seed);
    let s = assign_gaps(&pool, unassigned_pct, partial_pct, &mut rng).await?;
    println!(
        "Cleared tags: {} fully unassigned, {} missing owner, {} missing env.",
        s.fully_unassigned, s.missing_owner, s.missing_env
    );
    print_assignment_status(&assignment_status(&pool).await?);
    pool.close().await;
    Ok(())
}

pub async fn run_refresh_status(config: &Config, as_of: Option<NaiveDate>) -> Result<()> {
    let pool = db::connect(config).await?;
    let s = refresh_status(&pool, config.analytics.idle_days, as_of).await?;
    println!("Resource status: {} active, {} idle.", s.active, s.idle);
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::etl;
    use crate::models::BillingRecord;

    async fn pool_with_billing(n: usize) -> SqlitePool {
        let pool = memory_pool().await.unwrap();
        let d = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        let records: Vec<BillingRecord> = (0..n)
            .map(|i| BillingRecord::new(format!("res-{:03}", i), d, "Compute", 10.0, 1.0))
            .collect();
        etl::load(&pool, &records, false).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn seed_fills_untagged_rows_once() {
        let pool = pool_with_billing(10).await;
        let mut rng = make_rng(Some(7));
        assert_eq!(seed_resources(&pool, false, &mut rng).await.unwrap(), 10);
        assert_eq!(seed_resources(&pool, false, &mut rng).await.unwrap(), 0);
        assert_eq!(seed_resources(&pool, true, &mut rng).await.unwrap(), 10);

        let untagged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM resources WHERE owner IS NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(untagged, 0);
    }

    #[tokio::test]
    async fn seeding_is_reproducible_with_a_seed() {
        let a = pool_with_billing(8).await;
        let b = pool_with_billing(8).await;
        seed_resources(&a, false, &mut make_rng(Some(42))).await.unwrap();
        seed_resources(&b, false, &mut make_rng(Some(42))).await.unwrap();

        let q = "SELECT resource_id, owner, project, env FROM resources ORDER BY resource_id";
        let ra: Vec<(String, String, String, String)> = sqlx::query_as(q).fetch_all(&a).await.unwrap();
        let rb: Vec<(String, String, String, String)> = sqlx::query_as(q).fetch_all(&b).await.unwrap();
        assert_eq!(ra, rb);
    }

    #[tokio::test]
    async fn assign_gaps_splits_partial_between_owner_and_env() {
        let pool = pool_with_billing(50).await;
        let mut rng = make_rng(Some(1));
        seed_resources(&pool, false, &mut rng).await.unwrap();

        let s = assign_gaps(&pool, 10.0, 12.0, &mut rng).await.unwrap();
        assert_eq!(s.fully_unassigned, 5);
        assert_eq!(s.missing_owner + s.missing_env, 6);
        assert_eq!(s.missing_owner, 3);

        let rows = assignment_status(&pool).await.unwrap();
        let count = |name: &str| rows.iter().find(|r| r.status == name).map(|r| r.count).unwrap_or(0);
        assert_eq!(count("Completely Unassigned"), 5);
        assert_eq!(count("Missing Owner"), 3);
        assert_eq!(count("Missing Environment"), 3);
        assert_eq!(count("Fully Assigned"), 39);
    }

    #[tokio::test]
    async fn assign_gaps_rejects_bad_percentages() {
        let pool = pool_with_billing(2).await;
        let mut rng = make_rng(Some(1));
        assert!(assign_gaps(&pool, 80.0, 30.0, &mut rng).await.is_err());
        assert!(assign_gaps(&pool, -1.0, 0.0, &mut rng).await.is_err());
    }

    #[tokio::test]
    async fn refresh_status_marks_stale_resources_idle() {
        let pool = memory_pool().await.unwrap();
        let fresh = NaiveDate::from_ymd_opt(2025, 8, 30).unwrap();
        let stale = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        etl::load(
            &pool,
            &[
                BillingRecord::new("fresh", fresh, "Compute", 1.0, 1.0),
                BillingRecord::new("stale", stale, "Compute", 1.0, 1.0),
                BillingRecord::new("never", fresh, "Compute", 1.0, 0.0),
            ],
            false,
        )
        .await
        .unwrap();

        let s = refresh_status(&pool, 30, None).await.unwrap();
        assert_eq!(s, StatusSummary { active: 1, idle: 2 });

        let status: String = sqlx::query_scalar("SELECT status FROM resources WHERE resource_id = 'stale'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "idle");
    }
}
