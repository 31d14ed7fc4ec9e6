//! # Cost Copilot
//!
//! A local-first FinOps assistant for cloud billing data.
//!
//! Cost Copilot validates billing exports and loads them into SQLite,
//! computes monthly cost KPIs, recommends savings (idle resources, tagging
//! gaps, unit-cost spikes), and answers cost questions with an external LLM
//! grounded in a retrieval index of FinOps notes and billing summaries.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────┐
//! │ Billing CSV │──▶│  ETL        │──▶│  SQLite   │
//! │ / JSON      │   │  validate   │   │  billing  │
//! └─────────────┘   └─────────────┘   └─────┬─────┘
//!                                           │
//!                 ┌────────────┬────────────┤
//!                 ▼            ▼            ▼
//!           ┌──────────┐ ┌───────────┐ ┌──────────┐
//!           │ KPIs     │ │ Recommend │ │  Index   │──▶ RAG answerer
//!           └──────────┘ └───────────┘ └──────────┘
//!                 │            │            │
//!                 └────────────┴──────┬─────┘
//!                            ┌────────┴────────┐
//!                            ▼                 ▼
//!                       ┌──────────┐     ┌──────────┐
//!                       │   CLI    │     │   HTTP   │
//!                       │(copilot) │     │  (axum)  │
//!                       └──────────┘     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! copilot init                          # create database
//! copilot generate --out data/s.csv     # synthetic billing export
//! copilot ingest data/s.csv             # validate and load
//! copilot resources seed                # owner/env tags
//! copilot recommend
//! copilot index build
//! copilot ask "Which resources are idle?"
//! copilot serve                         # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed errors with API codes |
//! | [`models`] | Core data types |
//! | [`etl`] | Billing export validation and loading |
//! | [`store`] | Billing and resource queries |
//! | [`resources`] | Tag seeding, gap assignment, status refresh |
//! | [`sample`] | Synthetic billing generator |
//! | [`analytics`] | Cost KPIs |
//! | [`recommend`] | Idle, tagging and spike rules |
//! | [`chunk`] | Paragraph chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Retrieval index build, persistence and search |
//! | [`guard`] | Prompt-injection and input checks |
//! | [`generation`] | Chat-completion client |
//! | [`rag`] | Grounded answering |
//! | [`eval`] | Recall@k and answer rubric |
//! | [`stats`] | Store overview |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod analytics;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod etl;
pub mod eval;
pub mod generation;
pub mod guard;
pub mod index;
pub mod migrate;
pub mod models;
pub mod rag;
pub mod recommend;
pub mod resources;
pub mod sample;
pub mod server;
pub mod stats;
pub mod store;
