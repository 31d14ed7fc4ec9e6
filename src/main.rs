//! # Cost Copilot CLI (`copilot`)
//!
//! ## Usage
//!
//! ```bash
//! copilot --config ./config/copilot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `copilot init` | Create the SQLite store and run schema migrations |
//! | `copilot ingest <file>` | Validate and load a billing export (CSV or JSON) |
//! | `copilot generate` | Write a synthetic billing CSV |
//! | `copilot resources seed\|assign-gaps\|refresh-status` | Resource tag and status jobs |
//! | `copilot kpi <months\|summary\|top\|unit-changes\|trend\|export>` | Cost KPIs |
//! | `copilot recommend` | Idle, tagging-gap and cost-spike recommendations |
//! | `copilot index build` | Build the retrieval index from docs and billing |
//! | `copilot ask "<question>"` | Answer a FinOps question from the index |
//! | `copilot eval` | Recall@k and answer-rubric evaluation |
//! | `copilot stats` | Store and index overview |
//! | `copilot serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! copilot init
//! copilot generate --out data/sample.csv --seed 7
//! copilot ingest data/sample.csv
//! copilot resources seed --seed 7
//! copilot recommend --json
//! copilot index build
//! copilot ask "Which resources are idle?"
//! copilot serve
//! ```

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use cost_copilot::sample::SampleOptions;
use cost_copilot::{
    analytics, config, etl, eval, index, migrate, rag, recommend, resources, sample, server,
    stats,
};

#[derive(Parser)]
#[command(
    name = "copilot",
    about = "Cost Copilot: cloud-cost KPIs, FinOps recommendations and grounded Q&A",
    version,
    long_about = "Cost Copilot loads cloud billing exports into SQLite, computes cost KPIs, \
    recommends savings (idle resources, tagging gaps, cost spikes), and answers FinOps \
    questions from a retrieval index through an external LLM."
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "./config/copilot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the SQLite store and apply migrations.
    Init,

    /// Validate and load a billing export.
    Ingest {
        /// CSV, TXT (CSV content) or JSON file.
        file: PathBuf,

        /// Truncate the billing table before loading.
        #[arg(long)]
        replace: bool,
    },

    /// Write a synthetic billing CSV. Does not need a config file.
    Generate {
        #[arg(long, default_value = "data/sample_billing.csv")]
        out: PathBuf,

        #[arg(long, default_value_t = 60)]
        resources: usize,

        #[arg(long, default_value_t = 6)]
        months: usize,

        /// Last month of the window, YYYY-MM.
        #[arg(long, default_value = "2025-09")]
        end_month: String,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, default_value_t = 0.05)]
        spike_rate: f64,

        #[arg(long, default_value_t = 0.05)]
        idle_rate: f64,
    },

    /// Resource tag and status jobs.
    Resources {
        #[command(subcommand)]
        action: ResourceAction,
    },

    /// Cost KPIs.
    Kpi {
        #[command(subcommand)]
        action: KpiAction,
    },

    /// Savings recommendations.
    Recommend {
        /// Evaluate idleness as of this date (YYYY-MM-DD). Defaults to the newest usage date.
        #[arg(long)]
        as_of: Option<NaiveDate>,

        #[arg(long)]
        json: bool,
    },

    /// Retrieval index management.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Answer a FinOps question.
    Ask {
        question: String,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        model: Option<String>,
    },

    /// Evaluate retrieval recall@k and, optionally, answer quality.
    Eval {
        #[arg(long, default_value = "eval/queries.json")]
        queries: PathBuf,

        /// k values for recall@k.
        #[arg(long = "k", value_delimiter = ',', default_value = "1,3,5")]
        ks: Vec<usize>,

        /// Also generate answers and score them.
        #[arg(long)]
        answers: bool,

        /// Write the JSON report here.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Store and index overview.
    Stats,

    /// Start the HTTP API.
    Serve,
}

#[derive(Subcommand)]
enum ResourceAction {
    /// Create resources for billing ids that have none, with random tags.
    Seed {
        /// Re-seed resources that already have tags.
        #[arg(long)]
        force: bool,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Blank out tags on a share of resources.
    AssignGaps {
        /// Share of resources left with no owner and no env.
        #[arg(long, default_value_t = 0.10)]
        unassigned: f64,

        /// Share of resources missing one of owner or env.
        #[arg(long, default_value_t = 0.12)]
        partial: f64,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Mark resources idle or active from their last usage.
    RefreshStatus {
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
}

#[derive(Subcommand)]
enum KpiAction {
    /// List invoice months with data.
    Months,

    /// Category KPIs, owner/env breakdown and coverage for a month.
    Summary {
        #[arg(long)]
        month: Option<String>,

        #[arg(long)]
        category: Option<String>,
    },

    /// Top cost drivers for a month.
    Top {
        #[arg(long)]
        month: Option<String>,

        #[arg(long, short = 'n', default_value_t = 10)]
        n: usize,
    },

    /// Consecutive-month unit-cost changes.
    UnitChanges {
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Monthly totals by owner, env, project or category.
    Trend {
        #[arg(long, default_value = "owner")]
        group_by: String,

        #[arg(long)]
        months: Option<usize>,
    },

    /// Write latest-month KPI CSVs.
    Export {
        #[arg(long, default_value = "data/exports")]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Chunk, embed and write the index file.
    Build,
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Generate {
        out,
        resources,
        months,
        end_month,
        seed,
        spike_rate,
        idle_rate,
    } = &cli.command
    {
        init_tracing("info");
        let opts = SampleOptions {
            resources: *resources,
            months: *months,
            end_month: end_month.clone(),
            seed: *seed,
            spike_rate: *spike_rate,
            idle_rate: *idle_rate,
        };
        return sample::run_generate(out, &opts);
    }

    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file, replace } => {
            etl::run_ingest(&cfg, &file, replace).await?;
        }
        Commands::Generate { .. } => unreachable!("handled before config load"),
        Commands::Resources { action } => match action {
            ResourceAction::Seed { force, seed } => {
                resources::run_seed(&cfg, force, seed).await?;
            }
            ResourceAction::AssignGaps {
                unassigned,
                partial,
                seed,
            } => {
                resources::run_assign_gaps(&cfg, unassigned, partial, seed).await?;
            }
            ResourceAction::RefreshStatus { as_of } => {
                resources::run_refresh_status(&cfg, as_of).await?;
            }
        },
        Commands::Kpi { action } => match action {
            KpiAction::Months => analytics::run_months(&cfg).await?,
            KpiAction::Summary { month, category } => {
                analytics::run_summary(&cfg, month, category).await?
            }
            KpiAction::Top { month, n } => analytics::run_top(&cfg, month, n).await?,
            KpiAction::UnitChanges { threshold } => {
                analytics::run_unit_changes(&cfg, threshold).await?
            }
            KpiAction::Trend { group_by, months } => {
                analytics::run_trend(&cfg, &group_by, months).await?
            }
            KpiAction::Export { out } => analytics::run_export(&cfg, &out).await?,
        },
        Commands::Recommend { as_of, json } => {
            recommend::run_recommend(&cfg, as_of, json).await?;
        }
        Commands::Index { action } => match action {
            IndexAction::Build => index::run_index_build(&cfg).await?,
        },
        Commands::Ask {
            question,
            top_k,
            model,
        } => {
            rag::run_ask(&cfg, &question, top_k, model).await?;
        }
        Commands::Eval {
            queries,
            ks,
            answers,
            out,
        } => {
            eval::run_eval(&cfg, &queries, &ks, answers, out).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
