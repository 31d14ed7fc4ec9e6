//! TOML configuration.
//!
//! Every threshold the analytics, recommendation, and retrieval layers use
//! is read from here: idleness window, spike ratio, baseline length,
//! retrieval `k`, context budget, and the guard denylist. Secrets are never
//! stored in the file; `[generation].api_key_env` names the environment
//! variable that holds the key.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub etl: EtlConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EtlConfig {
    #[serde(default = "default_currency")]
    pub default_currency: String,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            default_currency: default_currency(),
        }
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Thresholds for KPIs and recommendation rules.
#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    /// A resource with no usage newer than this many days is idle.
    #[serde(default = "default_idle_days")]
    pub idle_days: i64,
    /// Current unit cost / trailing baseline at or above this ratio is a spike.
    #[serde(default = "default_spike_ratio")]
    pub spike_ratio: f64,
    /// Number of prior periods averaged into the spike baseline.
    #[serde(default = "default_baseline_periods")]
    pub baseline_periods: usize,
    /// Tag value treated the same as a missing tag.
    #[serde(default = "default_unassigned")]
    pub unassigned_sentinel: String,
    #[serde(default = "default_trend_months")]
    pub trend_months: usize,
    #[serde(default = "default_unit_change_threshold")]
    pub unit_change_threshold: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            idle_days: default_idle_days(),
            spike_ratio: default_spike_ratio(),
            baseline_periods: default_baseline_periods(),
            unassigned_sentinel: default_unassigned(),
            trend_months: default_trend_months(),
            unit_change_threshold: default_unit_change_threshold(),
        }
    }
}

fn default_idle_days() -> i64 {
    30
}
fn default_spike_ratio() -> f64 {
    1.3
}
fn default_baseline_periods() -> usize {
    3
}
fn default_unassigned() -> String {
    "unassigned".to_string()
}
fn default_trend_months() -> usize {
    6
}
fn default_unit_change_threshold() -> f64 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
    #[serde(default = "default_docs_dir")]
    pub docs_dir: PathBuf,
    #[serde(default = "default_doc_globs")]
    pub doc_globs: Vec<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Upper bound on the context block handed to the generator, in chars.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,
    #[serde(default = "default_true")]
    pub include_billing_summaries: bool,
    /// Extra case-insensitive keywords rejected by the prompt guard.
    #[serde(default)]
    pub denylist: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
            docs_dir: default_docs_dir(),
            doc_globs: default_doc_globs(),
            top_k: default_top_k(),
            max_context_chars: default_max_context_chars(),
            max_chunk_tokens: default_max_chunk_tokens(),
            include_billing_summaries: true,
            denylist: Vec::new(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from("./data/index.json")
}
fn default_docs_dir() -> PathBuf {
    PathBuf::from("./docs")
}
fn default_doc_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_top_k() -> usize {
    5
}
fn default_max_context_chars() -> usize {
    6000
}
fn default_max_chunk_tokens() -> usize {
    200
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// External chat-completion service used by the answerer.
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `"openai"` (any OpenAI-compatible endpoint) or `"disabled"`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Models a request may switch to; empty means only `model`.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            base_url: default_generation_base_url(),
            model: default_generation_model(),
            api_key_env: default_api_key_env(),
            allowed_models: Vec::new(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_generation_retries(),
            temperature: 0.0,
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_generation_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}
fn default_generation_model() -> String {
    "llama-3.1-8b-instant".to_string()
}
fn default_api_key_env() -> String {
    "GROQ_API_KEY".to_string()
}
fn default_generation_retries() -> u32 {
    2
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Whether a per-request model override is acceptable.
    pub fn allows_model(&self, model: &str) -> bool {
        model == self.model || self.allowed_models.iter().any(|m| m == model)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default `tracing` filter; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Range checks shared by [`load_config`] and configs built in code.
pub fn validate(config: &Config) -> Result<()> {
    let a = &config.analytics;
    if a.idle_days <= 0 {
        anyhow::bail!("analytics.idle_days must be > 0");
    }
    if !a.spike_ratio.is_finite() || a.spike_ratio <= 1.0 {
        anyhow::bail!("analytics.spike_ratio must be a finite number > 1.0");
    }
    if a.baseline_periods == 0 {
        anyhow::bail!("analytics.baseline_periods must be >= 1");
    }
    if a.trend_months == 0 {
        anyhow::bail!("analytics.trend_months must be >= 1");
    }

    let r = &config.retrieval;
    if !(1..=20).contains(&r.top_k) {
        anyhow::bail!("retrieval.top_k must be in [1, 20]");
    }
    if r.max_context_chars == 0 {
        anyhow::bail!("retrieval.max_context_chars must be > 0");
    }
    if r.max_chunk_tokens == 0 {
        anyhow::bail!("retrieval.max_chunk_tokens must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hashing" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashing, local, openai, or ollama.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
