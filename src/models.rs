//! Core data models used throughout the copilot.
//!
//! These types represent the billing rows, resources, derived KPIs,
//! recommendations, and retrieval chunks that flow between the ETL,
//! analytics, recommendation, and RAG layers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A validated billing line item. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub resource_id: String,
    pub usage_date: NaiveDate,
    /// `YYYY-MM`, derived from `usage_date`.
    pub invoice_month: String,
    pub category: String,
    pub amount: f64,
    pub currency: String,
    pub units: f64,
    pub unit_cost: Option<f64>,
    pub account_id: Option<String>,
    pub subscription: Option<String>,
    pub resource_group: Option<String>,
    pub region: Option<String>,
}

impl BillingRecord {
    pub fn new(
        resource_id: impl Into<String>,
        usage_date: NaiveDate,
        category: impl Into<String>,
        amount: f64,
        units: f64,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            invoice_month: month_of(usage_date),
            usage_date,
            category: category.into(),
            amount,
            currency: "USD".to_string(),
            units,
            unit_cost: None,
            account_id: None,
            subscription: None,
            resource_group: None,
            region: None,
        }
    }

    /// Unit cost as reported, or `amount / units` when usage is non-zero.
    pub fn effective_unit_cost(&self) -> Option<f64> {
        match self.unit_cost {
            Some(c) if c.is_finite() => Some(c),
            _ if self.units > 0.0 => Some(self.amount / self.units),
            _ => None,
        }
    }
}

/// Format a date as its `YYYY-MM` invoice month.
pub fn month_of(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Active,
    Idle,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Active => "active",
            ResourceStatus::Idle => "idle",
        }
    }
}

impl FromStr for ResourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ResourceStatus::Active),
            "idle" => Ok(ResourceStatus::Idle),
            other => Err(format!("unknown resource status: {}", other)),
        }
    }
}

/// A cloud resource and its ownership tags. Any tag may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: String,
    pub owner: Option<String>,
    pub project: Option<String>,
    pub env: Option<String>,
    pub status: ResourceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub tags_json: String,
}

impl Resource {
    /// An untagged resource, as ETL creates for ids it has not seen before.
    pub fn untagged(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            owner: None,
            project: None,
            env: None,
            status: ResourceStatus::Active,
            last_seen_at: None,
            tags_json: "{}".to_string(),
        }
    }

    pub fn tagged(
        resource_id: impl Into<String>,
        owner: &str,
        project: &str,
        env: &str,
    ) -> Self {
        Self {
            owner: Some(owner.to_string()),
            project: Some(project.to_string()),
            env: Some(env.to_string()),
            ..Self::untagged(resource_id)
        }
    }
}

/// Per-period, per-category spend with the change against the prior period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kpi {
    pub period: String,
    pub category: String,
    pub total: f64,
    pub previous_total: Option<f64>,
    pub delta: Option<f64>,
    pub delta_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    IdleResource,
    TaggingGap,
    CostSpike,
}

impl RecommendationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationKind::IdleResource => "idle_resource",
            RecommendationKind::TaggingGap => "tagging_gap",
            RecommendationKind::CostSpike => "cost_spike",
        }
    }

    /// Suggested remediation steps for this kind of finding.
    pub fn actions(&self) -> &'static [&'static str] {
        match self {
            RecommendationKind::IdleResource => &[
                "Review and terminate resources with no recent usage",
                "Right-size resources with low utilization",
                "Enable automated start/stop schedules for non-production resources",
            ],
            RecommendationKind::TaggingGap => &[
                "Add the missing owner, project, and environment tags",
                "Enforce a mandatory tagging policy at provisioning time",
                "Set up automated tag compliance checks",
            ],
            RecommendationKind::CostSpike => &[
                "Investigate recent configuration or pricing-tier changes",
                "Check for unexpected usage patterns",
                "Consider reserved capacity or savings plans",
            ],
        }
    }
}

impl fmt::Display for RecommendationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding against one resource. Regenerated per request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub resource_id: String,
    /// Estimated monthly savings in the billing currency.
    pub severity: f64,
    pub rationale: String,
    pub actions: Vec<String>,
}

impl Recommendation {
    pub fn new(
        kind: RecommendationKind,
        resource_id: impl Into<String>,
        severity: f64,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            resource_id: resource_id.into(),
            severity,
            rationale: rationale.into(),
            actions: kind.actions().iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// An embedded text span in the retrieval index.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    /// Citation id, e.g. `finops_3` or `bill_vm-12_2025-08`.
    pub id: String,
    pub source: String,
    pub text: String,
    pub meta: serde_json::Value,
    /// SHA-256 of `text`; lets a rebuild reuse unchanged embeddings.
    pub hash: String,
    pub embedding: Vec<f32>,
}
