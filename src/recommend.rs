//! Cost-optimization recommendation engine.
//!
//! Three rules run over a window of billing rows and the current resource set:
//!
//! | Rule | Flags when | Severity (est. monthly savings) |
//! |------|------------|---------------------------------|
//! | idle resource | last usage older than `idle_days` before `as_of` | 70% of latest-period cost |
//! | tagging gap | owner, project or env missing, blank or the sentinel | 20% of latest-period cost |
//! | cost spike | current unit cost / trailing baseline >= `spike_ratio` | 50% of current cost × (ratio − 1) |
//!
//! The engine is pure: [`recommend`] takes data in and returns a
//! [`RecommendationReport`]. Nothing is persisted. Tags are never assumed to
//! be complete, and a billed resource id with no resource row is treated as
//! fully untagged.

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::analytics::Dataset;
use crate::config::{AnalyticsConfig, Config};
use crate::db;
use crate::error::CopilotError;
use crate::models::{BillingRecord, Recommendation, RecommendationKind, Resource};

const IDLE_SAVINGS_FACTOR: f64 = 0.7;
const TAGGING_SAVINGS_FACTOR: f64 = 0.2;
const SPIKE_RECOVERY_FACTOR: f64 = 0.5;

/// Rule thresholds. Built from config, optionally overridden per request.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub idle_days: i64,
    pub spike_ratio: f64,
    pub baseline_periods: usize,
    pub sentinel: String,
}

impl From<&AnalyticsConfig> for Thresholds {
    fn from(a: &AnalyticsConfig) -> Self {
        Self {
            idle_days: a.idle_days,
            spike_ratio: a.spike_ratio,
            baseline_periods: a.baseline_periods,
            sentinel: a.unassigned_sentinel.clone(),
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.idle_days <= 0 {
            return Err(CopilotError::InvalidRequest("idle_days must be > 0".into()));
        }
        if !self.spike_ratio.is_finite() || self.spike_ratio <= 1.0 {
            return Err(CopilotError::InvalidRequest("spike_ratio must be > 1.0".into()));
        }
        if self.baseline_periods == 0 {
            return Err(CopilotError::InvalidRequest("baseline_periods must be >= 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecommendationReport {
    pub as_of: NaiveDate,
    /// Invoice month treated as "current"; `None` when there is no billing data.
    pub latest_period: Option<String>,
    pub recommendations: Vec<Recommendation>,
    pub total_estimated_monthly_savings: f64,
    /// Store rows that could not be decoded and were left out.
    pub skipped_rows: usize,
    /// Spike series skipped for having fewer prior periods than the baseline needs.
    pub insufficient_baseline: usize,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Is this tag value a gap? Null, blank and the sentinel all count.
pub fn is_missing_tag(value: Option<&str>, sentinel: &str) -> bool {
    match value.map(str::trim) {
        None => true,
        Some(v) => v.is_empty() || v.eq_ignore_ascii_case(sentinel),
    }
}

/// Default `as_of`: the newest usage date in the data, else today.
pub fn default_as_of(billing: &[BillingRecord]) -> NaiveDate {
    billing
        .iter()
        .map(|r| r.usage_date)
        .max()
        .unwrap_or_else(|| chrono::Utc::now().date_naive())
}

/// Run every rule and return the ordered report.
///
/// `skipped_rows` is carried through from the store loader.
pub fn recommend(
    billing: &[BillingRecord],
    resources: &[Resource],
    as_of: NaiveDate,
    thresholds: &Thresholds,
    skipped_rows: usize,
) -> RecommendationReport {
    let latest_period = billing.iter().map(|r| r.invoice_month.as_str()).max();

    let mut latest_cost: HashMap<&str, f64> = HashMap::new();
    if let Some(latest) = latest_period {
        for r in billing.iter().filter(|r| r.invoice_month == latest) {
            *latest_cost.entry(r.resource_id.as_str()).or_insert(0.0) += r.amount;
        }
    }
    let cost_of = |id: &str| latest_cost.get(id).copied().unwrap_or(0.0);

    let mut recommendations = Vec::new();
    recommendations.extend(idle_resources(billing, resources, as_of, thresholds, &cost_of));
    recommendations.extend(tagging_gaps(billing, resources, thresholds, &cost_of));
    let (spikes, insufficient_baseline) = cost_spikes(billing, latest_period, thresholds);
    recommendations.extend(spikes);

    recommendations.sort_by(|a, b| {
        b.severity
            .total_cmp(&a.severity)
            .then_with(|| a.resource_id.cmp(&b.resource_id))
            .then_with(|| a.kind.cmp(&b.kind))
    });

    let total = round2(recommendations.iter().map(|r| r.severity).sum());

    RecommendationReport {
        as_of,
        latest_period: latest_period.map(str::to_string),
        recommendations,
        total_estimated_monthly_savings: total,
        skipped_rows,
        insufficient_baseline,
    }
}

/// Newest usage date per resource id, across the resource set and every
/// billed id: the newer of `last_seen_at` and the newest row with `units > 0`.
pub fn last_usage_by_resource<'a>(
    billing: &'a [BillingRecord],
    resources: &'a [Resource],
) -> BTreeMap<&'a str, Option<NaiveDate>> {
    let mut last_usage: BTreeMap<&str, Option<NaiveDate>> = BTreeMap::new();
    for r in resources {
        last_usage.insert(
            r.resource_id.as_str(),
            r.last_seen_at.map(|ts| ts.date_naive()),
        );
    }
    for r in billing {
        let entry = last_usage.entry(r.resource_id.as_str()).or_insert(None);
        if r.units > 0.0 && entry.map_or(true, |d| r.usage_date > d) {
            *entry = Some(r.usage_date);
        }
    }
    last_usage
}

/// Flag resources whose newest usage is more than `idle_days` before `as_of`.
/// A resource with no usage at all is flagged.
fn idle_resources(
    billing: &[BillingRecord],
    resources: &[Resource],
    as_of: NaiveDate,
    t: &Thresholds,
    cost_of: &dyn Fn(&str) -> f64,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    for (resource_id, last) in last_usage_by_resource(billing, resources) {
        let rationale = match last {
            None => "No recorded usage for this resource".to_string(),
            Some(date) => {
                let age = (as_of - date).num_days();
                if age <= t.idle_days {
                    continue;
                }
                format!(
                    "No usage since {} ({} days before {}, threshold {} days)",
                    date, age, as_of, t.idle_days
                )
            }
        };
        out.push(Recommendation::new(
            RecommendationKind::IdleResource,
            resource_id,
            round2(cost_of(resource_id) * IDLE_SAVINGS_FACTOR),
            rationale,
        ));
    }
    out
}

/// One recommendation per under-tagged resource, listing every missing tag.
fn tagging_gaps(
    billing: &[BillingRecord],
    resources: &[Resource],
    t: &Thresholds,
    cost_of: &dyn Fn(&str) -> f64,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    let mut known: BTreeSet<&str> = BTreeSet::new();

    for r in resources {
        if !known.insert(r.resource_id.as_str()) {
            continue;
        }
        let missing: Vec<&str> = [
            ("owner", r.owner.as_deref()),
            ("project", r.project.as_deref()),
            ("env", r.env.as_deref()),
        ]
        .into_iter()
        .filter(|(_, v)| is_missing_tag(*v, &t.sentinel))
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            continue;
        }
        out.push(Recommendation::new(
            RecommendationKind::TaggingGap,
            &r.resource_id,
            round2(cost_of(&r.resource_id) * TAGGING_SAVINGS_FACTOR),
            format!("Missing tags: {}", missing.join(", ")),
        ));
    }

    let orphans: BTreeSet<&str> = billing
        .iter()
        .map(|r| r.resource_id.as_str())
        .filter(|id| !known.contains(id))
        .collect();
    for id in orphans {
        out.push(Recommendation::new(
            RecommendationKind::TaggingGap,
            id,
            round2(cost_of(id) * TAGGING_SAVINGS_FACTOR),
            "Missing tags: owner, project, env (no resource record)",
        ));
    }
    out
}

/// Flag (resource, category) series whose current unit cost jumped against
/// the mean of its `baseline_periods` most recent prior periods.
///
/// Returns the spikes and the number of series with too short a history.
fn cost_spikes(
    billing: &[BillingRecord],
    latest_period: Option<&str>,
    t: &Thresholds,
) -> (Vec<Recommendation>, usize) {
    let Some(current) = latest_period else {
        return (Vec::new(), 0);
    };

    // (resource, category) -> month -> (Σ amount, Σ units)
    let mut series: BTreeMap<(&str, &str), BTreeMap<&str, (f64, f64)>> = BTreeMap::new();
    for r in billing {
        let period = series
            .entry((r.resource_id.as_str(), r.category.as_str()))
            .or_default()
            .entry(r.invoice_month.as_str())
            .or_insert((0.0, 0.0));
        period.0 += r.amount;
        period.1 += r.units;
    }

    let mut out = Vec::new();
    let mut insufficient = 0usize;

    for ((resource_id, category), periods) in &series {
        let Some(&(current_cost, current_units)) = periods.get(current) else {
            continue;
        };
        if current_units <= 0.0 {
            continue;
        }
        let current_unit_cost = current_cost / current_units;

        let prior: Vec<f64> = periods
            .range(..current)
            .rev()
            .filter(|(_, (_, units))| *units > 0.0)
            .take(t.baseline_periods)
            .map(|(_, (amount, units))| amount / units)
            .collect();

        if prior.len() < t.baseline_periods {
            let err = CopilotError::InsufficientData(format!(
                "{}/{}: {} of {} baseline periods",
                resource_id,
                category,
                prior.len(),
                t.baseline_periods
            ));
            tracing::debug!(error = %err, "spike check skipped");
            insufficient += 1;
            continue;
        }

        let baseline = prior.iter().sum::<f64>() / prior.len() as f64;
        if baseline <= 0.0 {
            insufficient += 1;
            continue;
        }

        let ratio = current_unit_cost / baseline;
        if ratio < t.spike_ratio {
            continue;
        }

        out.push(Recommendation::new(
            RecommendationKind::CostSpike,
            *resource_id,
            round2(current_cost * (ratio - 1.0) * SPIKE_RECOVERY_FACTOR),
            format!(
                "{} unit cost {:.4} in {} is {:.2}x the {}-period baseline {:.4}",
                category,
                current_unit_cost,
                current,
                ratio,
                t.baseline_periods,
                baseline
            ),
        ));
    }

    (out, insufficient)
}

/// Load the store and run the engine.
pub async fn generate(
    pool: &SqlitePool,
    thresholds: &Thresholds,
    as_of: Option<NaiveDate>,
) -> crate::error::Result<RecommendationReport> {
    thresholds.validate()?;
    let data = Dataset::load(pool).await?;
    let as_of = as_of.unwrap_or_else(|| default_as_of(&data.billing));
    Ok(recommend(
        &data.billing,
        &data.resources,
        as_of,
        thresholds,
        data.skipped,
    ))
}

/// CLI entry point for `copilot recommend`.
pub async fn run_recommend(config: &Config, as_of: Option<NaiveDate>, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let thresholds = Thresholds::from(&config.analytics);
    let report = generate(&pool, &thresholds, as_of).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Recommendations as of {} (latest period: {})",
        report.as_of,
        report.latest_period.as_deref().unwrap_or("none")
    );
    println!();
    if report.recommendations.is_empty() {
        println!("  No recommendations.");
    }
    for (i, rec) in report.recommendations.iter().enumerate() {
        println!(
            "{}. [{}] {} (est. savings {:.2}/month)",
            i + 1,
            rec.kind,
            rec.resource_id,
            rec.severity
        );
        println!("   {}", rec.rationale);
    }
    println!();
    println!(
        "Total estimated monthly savings: {:.2}",
        report.total_estimated_monthly_savings
    );
    if report.skipped_rows > 0 {
        println!("Skipped malformed rows: {}", report.skipped_rows);
    }
    if report.insufficient_baseline > 0 {
        println!(
            "Series without enough history for spike checks: {}",
            report.insufficient_baseline
        );
    }
    Ok(())
}
