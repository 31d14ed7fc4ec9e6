//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | status, version, whether an index is loaded |
//! | `GET`  | `/kpi?month=&category=` | category KPIs with deltas, owner/env breakdown, coverage |
//! | `GET`  | `/kpi/months` | available invoice months |
//! | `GET`  | `/kpi/top?month=&n=` | top-N cost drivers |
//! | `GET`  | `/kpi/unit-changes?threshold=` | consecutive-month unit-cost changes |
//! | `GET`  | `/kpi/trend?group_by=&months=` | monthly totals per owner/env/project/category |
//! | `GET`  | `/kpi/quality-checks` | store-level data quality issues |
//! | `GET`  | `/recommendations?idle_days=&spike_ratio=&baseline_periods=&as_of=` | recommendation report |
//! | `POST` | `/ask` | `{question, top_k?, model?}` → answer with cited sources |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "n must be in [1, 100]" } }
//! ```
//!
//! Codes: `bad_request` (400), `security_rejection` (400), `not_found` (404),
//! `retrieval_unavailable` (503), `generation_failed` (502, the body also
//! carries `sources`), `internal` (500). Retrieval and generation errors
//! only ever come from `/ask`; the KPI and recommendation routes do not
//! depend on the index or the LLM.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the dashboard can be
//! served from a different origin.

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::analytics::{self, Dataset, GroupBy};
use crate::config::Config;
use crate::db;
use crate::error::CopilotError;
use crate::generation::{create_generator, Generator};
use crate::index::{RetrievalIndex, SearchHit};
use crate::migrate;
use crate::rag::{self, Answer, AskOutcome, AskRequest, Answerer};
use crate::recommend::{self, Thresholds};
use crate::store;

const MAX_TOP_N: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pool: SqlitePool,
    config: Arc<Config>,
    answerer: Arc<Answerer>,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        config: Config,
        index: Option<Arc<RetrievalIndex>>,
        generator: Arc<dyn Generator>,
    ) -> crate::error::Result<Self> {
        let answerer = Answerer::new(&config, index, generator)?;
        Ok(Self {
            pool,
            config: Arc::new(config),
            answerer: Arc::new(answerer),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/kpi", get(handle_kpi))
        .route("/kpi/months", get(handle_months))
        .route("/kpi/top", get(handle_top))
        .route("/kpi/unit-changes", get(handle_unit_changes))
        .route("/kpi/trend", get(handle_trend))
        .route("/kpi/quality-checks", get(handle_quality_checks))
        .route("/recommendations", get(handle_recommendations))
        .route("/ask", post(handle_ask))
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let index = rag::load_index(config);
    let generator = create_generator(&config.generation)?;
    let state = AppState::new(pool, config.clone(), index, generator)?;

    let app = build_router(state);

    tracing::info!(bind = %bind_addr, generator = %config.generation.provider, "starting server");
    println!("Cost Copilot API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    sources: Option<Vec<SearchHit>>,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    sources: Option<Vec<SearchHit>>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            sources: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
            sources: self.sources,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

impl From<CopilotError> for AppError {
    fn from(err: CopilotError) -> Self {
        match err {
            CopilotError::Validation { .. }
            | CopilotError::InvalidRequest(_)
            | CopilotError::InsufficientData(_) => bad_request(err.to_string()),
            CopilotError::SecurityRejection(msg) => {
                AppError::new(StatusCode::BAD_REQUEST, "security_rejection", msg)
            }
            CopilotError::Retrieval(msg) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "retrieval_unavailable", msg)
            }
            CopilotError::Generation(msg) => {
                AppError::new(StatusCode::BAD_GATEWAY, "generation_failed", msg)
            }
            other => {
                tracing::error!(error = %other, "request failed");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", other.to_string())
            }
        }
    }
}

fn query_error(rejection: QueryRejection) -> AppError {
    bad_request(rejection.body_text())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    index_loaded: bool,
    index_chunks: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let index = state.answerer.index();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        index_loaded: index.is_some(),
        index_chunks: index.map(|i| i.len()).unwrap_or(0),
    })
}

// ============ KPI routes ============

async fn load(state: &AppState) -> Result<Dataset, AppError> {
    Ok(Dataset::load(&state.pool).await?)
}

fn resolve_month(data: &Dataset, month: Option<String>) -> Result<String, AppError> {
    let months = data.months();
    match month {
        Some(m) if months.contains(&m) => Ok(m),
        Some(m) => Err(not_found(format!("no billing data for month {}", m))),
        None => months
            .last()
            .cloned()
            .ok_or_else(|| not_found("no billing data loaded")),
    }
}

#[derive(Deserialize)]
struct KpiParams {
    month: Option<String>,
    category: Option<String>,
}

async fn handle_kpi(
    State(state): State<AppState>,
    params: Result<Query<KpiParams>, QueryRejection>,
) -> Result<Json<analytics::MonthSummary>, AppError> {
    let Query(params) = params.map_err(query_error)?;
    let data = load(&state).await?;
    let month = resolve_month(&data, params.month)?;
    let summary = analytics::month_summary(
        &data,
        &month,
        &state.config.analytics.unassigned_sentinel,
        params.category.as_deref(),
    );
    Ok(Json(summary))
}

#[derive(Serialize)]
struct MonthsResponse {
    months: Vec<String>,
}

async fn handle_months(State(state): State<AppState>) -> Result<Json<MonthsResponse>, AppError> {
    let months = store::available_months(&state.pool).await?;
    Ok(Json(MonthsResponse { months }))
}

#[derive(Deserialize)]
struct TopParams {
    month: Option<String>,
    n: Option<usize>,
}

#[derive(Serialize)]
struct TopResponse {
    month: String,
    drivers: Vec<analytics::CostDriver>,
}

async fn handle_top(
    State(state): State<AppState>,
    params: Result<Query<TopParams>, QueryRejection>,
) -> Result<Json<TopResponse>, AppError> {
    let Query(params) = params.map_err(query_error)?;
    let n = params.n.unwrap_or(10);
    if !(1..=MAX_TOP_N).contains(&n) {
        return Err(bad_request(format!("n must be in [1, {}]", MAX_TOP_N)));
    }
    let data = load(&state).await?;
    let month = resolve_month(&data, params.month)?;
    let rows = data.enrich(&state.config.analytics.unassigned_sentinel);
    let drivers = analytics::top_cost_drivers(&rows, &month, n);
    Ok(Json(TopResponse { month, drivers }))
}

#[derive(Deserialize)]
struct UnitChangeParams {
    threshold: Option<f64>,
}

#[derive(Serialize)]
struct UnitChangeResponse {
    threshold: f64,
    changes: Vec<analytics::UnitCostChange>,
}

async fn handle_unit_changes(
    State(state): State<AppState>,
    params: Result<Query<UnitChangeParams>, QueryRejection>,
) -> Result<Json<UnitChangeResponse>, AppError> {
    let Query(params) = params.map_err(query_error)?;
    let threshold = params
        .threshold
        .unwrap_or(state.config.analytics.unit_change_threshold);
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(bad_request("threshold must be a non-negative number"));
    }
    let data = load(&state).await?;
    let changes = analytics::unit_cost_changes(&data.billing, threshold);
    Ok(Json(UnitChangeResponse { threshold, changes }))
}

#[derive(Deserialize)]
struct TrendParams {
    group_by: Option<String>,
    months: Option<usize>,
}

#[derive(Serialize)]
struct TrendResponse {
    group_by: &'static str,
    rows: Vec<analytics::TrendRow>,
}

async fn handle_trend(
    State(state): State<AppState>,
    params: Result<Query<TrendParams>, QueryRejection>,
) -> Result<Json<TrendResponse>, AppError> {
    let Query(params) = params.map_err(query_error)?;
    let group: GroupBy = params
        .group_by
        .as_deref()
        .unwrap_or("owner")
        .parse()
        .map_err(|e: String| bad_request(e))?;
    let months = params.months.unwrap_or(state.config.analytics.trend_months);
    if months == 0 {
        return Err(bad_request("months must be >= 1"));
    }
    let data = load(&state).await?;
    let rows = data.enrich(&state.config.analytics.unassigned_sentinel);
    Ok(Json(TrendResponse {
        group_by: group.as_str(),
        rows: analytics::trend(&rows, group, months),
    }))
}

#[derive(Serialize)]
struct QualityResponse {
    issues: Vec<store::QualityIssue>,
}

async fn handle_quality_checks(
    State(state): State<AppState>,
) -> Result<Json<QualityResponse>, AppError> {
    let issues = store::quality_issues(&state.pool).await?;
    Ok(Json(QualityResponse { issues }))
}

// ============ GET /recommendations ============

#[derive(Deserialize)]
struct RecommendationParams {
    idle_days: Option<i64>,
    spike_ratio: Option<f64>,
    baseline_periods: Option<usize>,
    as_of: Option<String>,
}

async fn handle_recommendations(
    State(state): State<AppState>,
    params: Result<Query<RecommendationParams>, QueryRejection>,
) -> Result<Json<recommend::RecommendationReport>, AppError> {
    let Query(params) = params.map_err(query_error)?;

    let mut thresholds = Thresholds::from(&state.config.analytics);
    if let Some(d) = params.idle_days {
        thresholds.idle_days = d;
    }
    if let Some(r) = params.spike_ratio {
        thresholds.spike_ratio = r;
    }
    if let Some(b) = params.baseline_periods {
        thresholds.baseline_periods = b;
    }
    let as_of = params
        .as_of
        .as_deref()
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .map_err(|_| bad_request("as_of must be YYYY-MM-DD"))?;

    let report = recommend::generate(&state.pool, &thresholds, as_of).await?;
    Ok(Json(report))
}

// ============ POST /ask ============

#[derive(Serialize)]
struct AskResponse {
    request_id: String,
    #[serde(flatten)]
    answer: Answer,
}

async fn handle_ask(
    State(state): State<AppState>,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<AskResponse>, AppError> {
    let Json(req) = payload.map_err(|e| bad_request(e.body_text()))?;
    let request_id = Uuid::new_v4().to_string();
    tracing::debug!(%request_id, "ask request");

    match state.answerer.ask(&req).await? {
        AskOutcome::Answered(answer) => Ok(Json(AskResponse { request_id, answer })),
        AskOutcome::GenerationFailed { error, sources } => {
            let mut err = AppError::new(StatusCode::BAD_GATEWAY, "generation_failed", error);
            err.sources = Some(sources);
            Err(err)
        }
    }
}
