//! KPI analytics over enriched billing rows.
//!
//! Enrichment left-joins billing rows to resources; a missing or blank owner,
//! project or env becomes the configured sentinel (`"unassigned"`), so cost is
//! never dropped by the join. Every aggregation here is a pure function over a
//! [`Dataset`]; the `run_*` functions at the bottom back the `copilot kpi`
//! subcommands.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::Config;
use crate::db;
use crate::models::{BillingRecord, Kpi, Resource};
use crate::store;

/// Billing rows and resources as loaded from the store.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub billing: Vec<BillingRecord>,
    pub resources: Vec<Resource>,
    /// Store rows that failed to decode.
    pub skipped: usize,
}

impl Dataset {
    pub async fn load(pool: &SqlitePool) -> crate::error::Result<Self> {
        let billing = store::load_billing(pool).await?;
        let resources = store::load_resources(pool).await?;
        Ok(Self {
            billing: billing.items,
            resources: resources.items,
            skipped: billing.skipped + resources.skipped,
        })
    }

    /// Left join of billing to resources with the sentinel filled in.
    pub fn enrich(&self, sentinel: &str) -> Vec<EnrichedRecord<'_>> {
        let by_id: HashMap<&str, &Resource> = self
            .resources
            .iter()
            .map(|r| (r.resource_id.as_str(), r))
            .collect();
        let fill = |tag: Option<&String>| -> String {
            match tag.map(|t| t.trim()) {
                Some(t) if !t.is_empty() => t.to_string(),
                _ => sentinel.to_string(),
            }
        };

        self.billing
            .iter()
            .map(|record| {
                let resource = by_id.get(record.resource_id.as_str());
                EnrichedRecord {
                    record,
                    owner: fill(resource.and_then(|r| r.owner.as_ref())),
                    project: fill(resource.and_then(|r| r.project.as_ref())),
                    env: fill(resource.and_then(|r| r.env.as_ref())),
                }
            })
            .collect()
    }

    pub fn months(&self) -> Vec<String> {
        available_months(&self.billing)
    }

    pub fn latest_month(&self) -> Option<String> {
        self.months().pop()
    }
}

#[derive(Debug, Clone)]
pub struct EnrichedRecord<'a> {
    pub record: &'a BillingRecord,
    pub owner: String,
    pub project: String,
    pub env: String,
}

/// Dimension for breakdowns and trends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Owner,
    Env,
    Project,
    Category,
}

impl GroupBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupBy::Owner => "owner",
            GroupBy::Env => "env",
            GroupBy::Project => "project",
            GroupBy::Category => "category",
        }
    }

    fn key<'r>(&self, row: &'r EnrichedRecord<'_>) -> &'r str {
        match self {
            GroupBy::Owner => &row.owner,
            GroupBy::Env => &row.env,
            GroupBy::Project => &row.project,
            GroupBy::Category => &row.record.category,
        }
    }
}

impl FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(GroupBy::Owner),
            "env" => Ok(GroupBy::Env),
            "project" => Ok(GroupBy::Project),
            "category" | "service" => Ok(GroupBy::Category),
            other => Err(format!(
                "unknown group_by '{}': expected owner, env, project or category",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GroupTotal {
    pub key: String,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OwnerCoverage {
    pub month: String,
    pub total_cost: f64,
    pub assigned_cost: f64,
    /// Fraction of cost carrying an owner, rounded to 4 decimals.
    pub coverage_pct: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrendRow {
    pub invoice_month: String,
    #[serde(flatten)]
    pub totals: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostDriver {
    pub resource_id: String,
    pub category: String,
    pub resource_group: Option<String>,
    pub owner: String,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UnitCostChange {
    pub resource_id: String,
    pub invoice_month: String,
    pub unit_cost: f64,
    pub prev_unit_cost: f64,
    pub pct_change: f64,
}

/// Everything `GET /kpi` returns for one month.
#[derive(Debug, Clone, Serialize)]
pub struct MonthSummary {
    pub month: String,
    pub kpis: Vec<Kpi>,
    pub cost_by_owner: Vec<GroupTotal>,
    pub cost_by_env: Vec<GroupTotal>,
    pub owner_coverage: OwnerCoverage,
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

pub fn available_months(billing: &[BillingRecord]) -> Vec<String> {
    billing
        .iter()
        .map(|r| r.invoice_month.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn previous_month(months: &[String], month: &str) -> Option<String> {
    months.iter().rev().find(|m| m.as_str() < month).cloned()
}

fn category_totals(billing: &[BillingRecord], month: &str) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for r in billing.iter().filter(|r| r.invoice_month == month) {
        *totals.entry(r.category.clone()).or_insert(0.0) += r.amount;
    }
    totals
}

/// Per-category totals for `month` with the change against the previous
/// available month. With no previous month every delta is `None`; a category
/// absent last month has a previous total of zero and no percentage.
pub fn monthly_category_kpis(
    billing: &[BillingRecord],
    month: &str,
    category: Option<&str>,
) -> Vec<Kpi> {
    let months = available_months(billing);
    let prev_month = previous_month(&months, month);
    let current = category_totals(billing, month);
    let previous = prev_month
        .as_deref()
        .map(|m| category_totals(billing, m))
        .unwrap_or_default();

    current
        .into_iter()
        .filter(|(cat, _)| category.map_or(true, |c| c == cat))
        .map(|(cat, total)| {
            let previous_total = prev_month
                .as_ref()
                .map(|_| previous.get(&cat).copied().unwrap_or(0.0));
            let delta = previous_total.map(|p| total - p);
            let delta_pct = previous_total
                .filter(|p| *p > 0.0)
                .map(|p| round4((total - p) / p));
            Kpi {
                period: month.to_string(),
                category: cat,
                total,
                previous_total,
                delta,
                delta_pct,
            }
        })
        .collect()
}

/// Cost per group for one month, highest first (ties by key).
pub fn cost_by(rows: &[EnrichedRecord<'_>], month: &str, group_by: GroupBy) -> Vec<GroupTotal> {
    let mut totals: HashMap<&str, f64> = HashMap::new();
    for row in rows.iter().filter(|r| r.record.invoice_month == month) {
        *totals.entry(group_by.key(row)).or_insert(0.0) += row.record.amount;
    }
    let mut out: Vec<GroupTotal> = totals
        .into_iter()
        .map(|(key, cost)| GroupTotal {
            key: key.to_string(),
            cost,
        })
        .collect();
    out.sort_by(|a, b| b.cost.total_cmp(&a.cost).then_with(|| a.key.cmp(&b.key)));
    out
}

pub fn owner_coverage(rows: &[EnrichedRecord<'_>], month: &str, sentinel: &str) -> OwnerCoverage {
    let mut total_cost = 0.0;
    let mut assigned_cost = 0.0;
    for row in rows.iter().filter(|r| r.record.invoice_month == month) {
        total_cost += row.record.amount;
        if !row.owner.eq_ignore_ascii_case(sentinel) {
            assigned_cost += row.record.amount;
        }
    }
    let coverage = if total_cost > 0.0 {
        assigned_cost / total_cost
    } else {
        0.0
    };
    OwnerCoverage {
        month: month.to_string(),
        total_cost,
        assigned_cost,
        coverage_pct: round4(coverage),
    }
}

/// Group totals for the last `months` invoice months, zero-filled.
pub fn trend(rows: &[EnrichedRecord<'_>], group_by: GroupBy, months: usize) -> Vec<TrendRow> {
    let all_months: BTreeSet<&str> = rows.iter().map(|r| r.record.invoice_month.as_str()).collect();
    let window: Vec<&str> = all_months
        .iter()
        .rev()
        .take(months)
        .rev()
        .copied()
        .collect();
    let groups: BTreeSet<&str> = rows
        .iter()
        .filter(|r| window.contains(&r.record.invoice_month.as_str()))
        .map(|r| group_by.key(r))
        .collect();

    window
        .iter()
        .map(|month| {
            let mut totals: BTreeMap<String, f64> =
                groups.iter().map(|g| (g.to_string(), 0.0)).collect();
            for row in rows.iter().filter(|r| r.record.invoice_month == *month) {
                if let Some(t) = totals.get_mut(group_by.key(row)) {
                    *t += row.record.amount;
                }
            }
            TrendRow {
                invoice_month: month.to_string(),
                totals,
            }
        })
        .collect()
}

pub fn top_cost_drivers(rows: &[EnrichedRecord<'_>], month: &str, n: usize) -> Vec<CostDriver> {
    let mut totals: HashMap<(&str, &str, Option<&str>, &str), f64> = HashMap::new();
    for row in rows.iter().filter(|r| r.record.invoice_month == month) {
        let key = (
            row.record.resource_id.as_str(),
            row.record.category.as_str(),
            row.record.resource_group.as_deref(),
            row.owner.as_str(),
        );
        *totals.entry(key).or_insert(0.0) += row.record.amount;
    }
    let mut drivers: Vec<CostDriver> = totals
        .into_iter()
        .map(|((resource_id, category, group, owner), cost)| CostDriver {
            resource_id: resource_id.to_string(),
            category: category.to_string(),
            resource_group: group.map(|g| g.to_string()),
            owner: owner.to_string(),
            cost,
        })
        .collect();
    drivers.sort_by(|a, b| {
        b.cost
            .total_cmp(&a.cost)
            .then_with(|| a.resource_id.cmp(&b.resource_id))
            .then_with(|| a.category.cmp(&b.category))
    });
    drivers.truncate(n);
    drivers
}

/// Month-over-month unit-cost moves per resource with `|pct_change| >= threshold`.
///
/// Unit cost is the mean per (resource, month) over rows that have one.
/// Consecutive means consecutive in that resource's own series.
pub fn unit_cost_changes(billing: &[BillingRecord], threshold: f64) -> Vec<UnitCostChange> {
    let mut sums: BTreeMap<(&str, &str), (f64, usize)> = BTreeMap::new();
    for r in billing {
        if let Some(uc) = r.effective_unit_cost() {
            let e = sums
                .entry((r.resource_id.as_str(), r.invoice_month.as_str()))
                .or_insert((0.0, 0));
            e.0 += uc;
            e.1 += 1;
        }
    }

    let mut changes = Vec::new();
    let mut prev: Option<(&str, f64)> = None;
    for ((resource_id, month), (sum, count)) in &sums {
        let mean = sum / *count as f64;
        if let Some((prev_id, prev_cost)) = prev {
            if prev_id == *resource_id && prev_cost != 0.0 {
                let pct = (mean - prev_cost) / prev_cost;
                if pct.abs() >= threshold {
                    changes.push(UnitCostChange {
                        resource_id: resource_id.to_string(),
                        invoice_month: month.to_string(),
                        unit_cost: mean,
                        prev_unit_cost: prev_cost,
                        pct_change: round4(pct),
                    });
                }
            }
        }
        prev = Some((*resource_id, mean));
    }

    changes.sort_by(|a, b| {
        b.pct_change
            .total_cmp(&a.pct_change)
            .then_with(|| a.resource_id.cmp(&b.resource_id))
    });
    changes
}

pub fn month_summary(data: &Dataset, month: &str, sentinel: &str, category: Option<&str>) -> MonthSummary {
    let rows = data.enrich(sentinel);
    MonthSummary {
        month: month.to_string(),
        kpis: monthly_category_kpis(&data.billing, month, category),
        cost_by_owner: cost_by(&rows, month, GroupBy::Owner),
        cost_by_env: cost_by(&rows, month, GroupBy::Env),
        owner_coverage: owner_coverage(&rows, month, sentinel),
    }
}

fn write_csv<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for item in items {
        writer.serialize(item)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write latest-month owner/env/top-resource breakdowns and unit-cost
/// changes as CSV files. Returns the written paths.
pub fn export_csvs(data: &Dataset, out_dir: &Path, sentinel: &str, threshold: f64) -> Result<Vec<PathBuf>> {
    let Some(latest) = data.latest_month() else {
        bail!("No months found in billing data");
    };
    std::fs::create_dir_all(out_dir)?;
    let rows = data.enrich(sentinel);

    let owner_path = out_dir.join(format!("monthly_by_owner_{}.csv", latest));
    write_csv(&owner_path, &cost_by(&rows, &latest, GroupBy::Owner))?;

    let env_path = out_dir.join(format!("monthly_by_env_{}.csv", latest));
    write_csv(&env_path, &cost_by(&rows, &latest, GroupBy::Env))?;

    let top_path = out_dir.join(format!("top_resources_{}.csv", latest));
    write_csv(&top_path, &top_cost_drivers(&rows, &latest, 50))?;

    let changes_path = out_dir.join("unit_cost_changes.csv");
    write_csv(&changes_path, &unit_cost_changes(&data.billing, threshold))?;

    Ok(vec![owner_path, env_path, top_path, changes_path])
}

// ============ CLI ============

async fn load_dataset(config: &Config) -> Result<Dataset> {
    let pool = db::connect(config).await?;
    let data = Dataset::load(&pool).await?;
    pool.close().await;
    Ok(data)
}

fn resolve_month(data: &Dataset, month: Option<String>) -> Result<String> {
    match month {
        Some(m) if data.months().contains(&m) => Ok(m),
        Some(m) => anyhow::bail!("No billing data for month {}", m),
        None => data
            .latest_month()
            .ok_or_else(|| anyhow::anyhow!("No billing data loaded. Run `copilot ingest` first.")),
    }
}

pub async fn run_months(config: &Config) -> Result<()> {
    let data = load_dataset(config).await?;
    let months = data.months();
    if months.is_empty() {
        println!("No billing data found.");
    }
    for m in months {
        println!("{}", m);
    }
    Ok(())
}

pub async fn run_summary(config: &Config, month: Option<String>, category: Option<String>) -> Result<()> {
    let data = load_dataset(config).await?;
    let month = resolve_month(&data, month)?;
    let sentinel = &config.analytics.unassigned_sentinel;
    let summary = month_summary(&data, &month, sentinel, category.as_deref());

    println!("KPIs for {}", summary.month);
    println!();
    println!("  {:<24} {:>12} {:>12} {:>9}", "CATEGORY", "TOTAL", "DELTA", "DELTA %");
    println!("  {}", "-".repeat(60));
    for k in &summary.kpis {
        println!(
            "  {:<24} {:>12.2} {:>12} {:>9}",
            k.category,
            k.total,
            k.delta.map(|d| format!("{:+.2}", d)).unwrap_or_else(|| "-".to_string()),
            k.delta_pct
                .map(|p| format!("{:+.1}%", p * 100.0))
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    for (title, totals) in [("By owner", &summary.cost_by_owner), ("By env", &summary.cost_by_env)] {
        println!();
        println!("  {}:", title);
        for t in totals {
            println!("    {:<22} {:>12.2}", t.key, t.cost);
        }
    }

    let cov = &summary.owner_coverage;
    println!();
    println!(
        "  Owner coverage: {:.2} / {:.2} ({:.1}%)",
        cov.assigned_cost,
        cov.total_cost,
        cov.coverage_pct * 100.0
    );
    Ok(())
}

pub async fn run_top(config: &Config, month: Option<String>, n: usize) -> Result<()> {
    let data = load_dataset(config).await?;
    let month = resolve_month(&data, month)?;
    let rows = data.enrich(&config.analytics.unassigned_sentinel);
    let drivers = top_cost_drivers(&rows, &month, n);

    println!("Top {} cost drivers for {}", n, month);
    println!("  {:<20} {:<16} {:<14} {:>12}", "RESOURCE", "CATEGORY", "OWNER", "COST");
    for d in &drivers {
        println!(
            "  {:<20} {:<16} {:<14} {:>12.2}",
            d.resource_id, d.category, d.owner, d.cost
        );
    }
    Ok(())
}

pub async fn run_unit_changes(config: &Config, threshold: Option<f64>) -> Result<()> {
    let data = load_dataset(config).await?;
    let threshold = threshold.unwrap_or(config.analytics.unit_change_threshold);
    let changes = unit_cost_changes(&data.billing, threshold);

    println!("Unit-cost changes >= {:.0}%", threshold * 100.0);
    if changes.is_empty() {
        println!("  none");
    }
    for c in &changes {
        println!(
            "  {:<20} {}  {:.4} -> {:.4}  ({:+.1}%)",
            c.resource_id,
            c.invoice_month,
            c.prev_unit_cost,
            c.unit_cost,
            c.pct_change * 100.0
        );
    }
    Ok(())
}

pub async fn run_trend(config: &Config, group_by: &str, months: Option<usize>) -> Result<()> {
    let group: GroupBy = group_by.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let data = load_dataset(config).await?;
    let rows = data.enrich(&config.analytics.unassigned_sentinel);
    let table = trend(&rows, group, months.unwrap_or(config.analytics.trend_months));

    println!("Trend by {}", group.as_str());
    for row in &table {
        let cells: Vec<String> = row
            .totals
            .iter()
            .map(|(k, v)| format!("{}={:.2}", k, v))
            .collect();
        println!("  {}  {}", row.invoice_month, cells.join("  "));
    }
    Ok(())
}

pub async fn run_export(config: &Config, out_dir: &Path) -> Result<()> {
    let data = load_dataset(config).await?;
    let paths = export_csvs(
        &data,
        out_dir,
        &config.analytics.unassigned_sentinel,
        config.analytics.unit_change_threshold,
    )?;
    for p in &paths {
        println!("  wrote {}", p.display());
    }
    println!("ok");
    Ok(())
}
