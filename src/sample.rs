//! Synthetic billing data.
//!
//! Produces a CSV in the invoice layout (`invoice_month, account_id, …,
//! usage_qty, unit_cost, cost`) that `copilot ingest` accepts directly.
//! Each resource gets a service with its own base usage and volatility, a
//! lifetime inside the window, a seasonal factor and a mild growth trend.
//! A small share of resources get a unit-cost spike in the final month or
//! go quiet (zero usage) for the last two months, so every recommendation
//! rule has something to find.

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Months, NaiveDate};
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::Serialize;
use std::path::Path;

use crate::etl::parse_usage_date;
use crate::models::month_of;
use crate::resources::make_rng;

/// (service, base usage, volatility, selection weight)
const SERVICES: &[(&str, f64, f64, f64)] = &[
    ("Compute", 100.0, 0.3, 0.25),
    ("Storage", 50.0, 0.1, 0.2),
    ("Database", 200.0, 0.15, 0.15),
    ("Networking", 80.0, 0.2, 0.15),
    ("Analytics", 150.0, 0.25, 0.1),
    ("AI/ML", 300.0, 0.4, 0.1),
    ("Containers", 120.0, 0.35, 0.05),
];

const RESOURCE_GROUPS: &[&str] = &["rg-prod", "rg-dev", "rg-staging", "rg-test"];
const ACCOUNTS: &[&str] = &["prod-acct", "dev-acct", "shared-acct"];
const REGIONS: &[&str] = &["us-east-1", "eu-west-1", "ap-south-1", "us-west-2"];

#[derive(Debug, Clone)]
pub struct SampleOptions {
    pub resources: usize,
    pub months: usize,
    /// Last month of the window, `YYYY-MM`.
    pub end_month: String,
    pub seed: Option<u64>,
    /// Share of resources whose unit cost jumps in the final month.
    pub spike_rate: f64,
    /// Share of resources with no usage in the final two months.
    pub idle_rate: f64,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            resources: 60,
            months: 6,
            end_month: "2025-09".to_string(),
            seed: None,
            spike_rate: 0.05,
            idle_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleRow {
    pub invoice_month: String,
    pub account_id: String,
    pub subscription: String,
    pub service: String,
    pub resource_group: String,
    pub resource_id: String,
    pub region: String,
    pub usage_qty: f64,
    pub unit_cost: f64,
    pub cost: f64,
}

struct SampleResource {
    id: String,
    service: usize,
    resource_group: &'static str,
    account: &'static str,
    region: &'static str,
    start: usize,
    lifetime: usize,
    unit_cost: f64,
    spikes: bool,
    goes_idle: bool,
}

fn month_window(end_month: &str, n: usize) -> Result<Vec<NaiveDate>> {
    let end = parse_usage_date(end_month)
        .with_context(|| format!("Invalid end month: {:?} (expected YYYY-MM)", end_month))?;
    let end = end.with_day(1).unwrap_or(end);
    let mut months = Vec::with_capacity(n);
    for back in (0..n).rev() {
        let m = end
            .checked_sub_months(Months::new(back as u32))
            .ok_or_else(|| anyhow::anyhow!("month window out of range"))?;
        months.push(m);
    }
    Ok(months)
}

fn seasonal_factor(month: u32) -> f64 {
    match month {
        6..=8 => 1.2,
        11 | 12 => 1.3,
        1 | 2 => 0.8,
        _ => 1.0,
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Generate rows for the whole window.
pub fn generate_rows(opts: &SampleOptions) -> Result<Vec<SampleRow>> {
    if opts.resources == 0 || opts.months == 0 {
        bail!("resources and months must both be > 0");
    }
    if !(0.0..=1.0).contains(&opts.spike_rate) || !(0.0..=1.0).contains(&opts.idle_rate) {
        bail!("spike_rate and idle_rate must be within 0..=1");
    }
    let months = month_window(&opts.end_month, opts.months)?;
    let mut rng: StdRng = make_rng(opts.seed);

    let weights: Vec<f64> = SERVICES.iter().map(|s| s.3).collect();
    let service_dist = rand::distributions::WeightedIndex::new(&weights)?;
    let n = opts.months;

    let resources: Vec<SampleResource> = (0..opts.resources)
        .map(|i| {
            let start = rng.gen_range(0..=n / 2);
            SampleResource {
                id: format!("res-{}", i + 1),
                service: service_dist.sample(&mut rng),
                resource_group: RESOURCE_GROUPS.choose(&mut rng).copied().unwrap_or("rg-dev"),
                account: ACCOUNTS.choose(&mut rng).copied().unwrap_or("shared-acct"),
                region: REGIONS.choose(&mut rng).copied().unwrap_or("us-east-1"),
                start,
                // Most resources live to the end of the window.
                lifetime: if rng.gen_bool(0.8) { n } else { rng.gen_range((n / 2).max(1)..=n) },
                unit_cost: rng.gen_range(0.01..2.0),
                spikes: rng.gen_bool(opts.spike_rate),
                goes_idle: rng.gen_bool(opts.idle_rate),
            }
        })
        .collect();

    let mut rows = Vec::new();
    for (idx, month) in months.iter().enumerate() {
        let is_last = idx + 1 == n;
        for res in &resources {
            if idx < res.start || idx >= res.start + res.lifetime {
                continue;
            }
            let (service, base, volatility, _) = SERVICES[res.service];

            let growth = 1.0 + (idx as f64 / n as f64) * 0.15;
            let noise = rng.gen_range((1.0 - volatility)..(1.0 + volatility));
            let mut usage = (base * seasonal_factor(month.month()) * growth * noise).max(0.0);
            if res.goes_idle && idx + 2 >= n {
                usage = 0.0;
            }

            let mut unit_cost = res.unit_cost * (1.0 + idx as f64 * 0.02);
            if res.spikes && is_last {
                unit_cost *= rng.gen_range(1.8..2.5);
            }
            let unit_cost = round4(unit_cost);

            rows.push(SampleRow {
                invoice_month: month_of(*month),
                account_id: res.account.to_string(),
                subscription: (if res.account == "prod-acct" { "enterprise" } else { "basic" }).to_string(),
                service: service.to_string(),
                resource_group: res.resource_group.to_string(),
                resource_id: res.id.clone(),
                region: res.region.to_string(),
                usage_qty: round4(usage),
                unit_cost,
                cost: round4(round4(usage) * unit_cost),
            });
        }
    }
    Ok(rows)
}

/// CLI entry point for `copilot generate`.
pub fn run_generate(out: &Path, opts: &SampleOptions) -> Result<()> {
    let rows = generate_rows(opts)?;
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(out)
        .with_context(|| format!("Failed to create {}", out.display()))?;
    for row in &rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    println!("Generated {} with {} rows", out.display(), rows.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> SampleOptions {
        SampleOptions {
            resources: 20,
            months: 6,
            end_month: "2025-09".to_string(),
            seed: Some(11),
            ..Default::default()
        }
    }

    #[test]
    fn window_ends_at_end_month() {
        let months = month_window("2025-02", 3).unwrap();
        let labels: Vec<String> = months.into_iter().map(month_of).collect();
        assert_eq!(labels, vec!["2024-12", "2025-01", "2025-02"]);
    }

    #[test]
    fn rows_are_consistent() {
        let rows = generate_rows(&opts()).unwrap();
        assert!(!rows.is_empty());
        for r in &rows {
            assert!(r.usage_qty >= 0.0);
            assert!(r.unit_cost > 0.0);
            assert!((r.usage_qty * r.unit_cost - r.cost).abs() < 0.01);
            assert!(r.invoice_month.as_str() <= "2025-09");
        }
    }

    #[test]
    fn same_seed_same_rows() {
        let a = generate_rows(&opts()).unwrap();
        let b = generate_rows(&opts()).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.resource_id, y.resource_id);
            assert_eq!(x.cost, y.cost);
        }
    }

    #[test]
    fn spike_and_idle_injection() {
        let rows = generate_rows(&SampleOptions {
            spike_rate: 1.0,
            idle_rate: 1.0,
            ..opts()
        })
        .unwrap();
        assert!(rows
            .iter()
            .filter(|r| r.invoice_month == "2025-09")
            .all(|r| r.usage_qty == 0.0));
    }

    #[test]
    fn generated_csv_ingests_cleanly() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sample.csv");
        run_generate(&path, &opts()).unwrap();
        let report = crate::etl::parse_file(&path, "USD").unwrap();
        assert!(report.rows_read > 0);
        assert!(report.rejected.is_empty());
    }

    #[test]
    fn bad_end_month_rejected() {
        let bad = SampleOptions {
            end_month: "September".to_string(),
            ..opts()
        };
        assert!(generate_rows(&bad).is_err());
    }
}
