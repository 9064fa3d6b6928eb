//! Axum JSON API over the KPI engine.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use payroll_core::{AnomalyRow, DeltaReport, DeptAggregate, Month, Summary};
use payroll_etl::PayrollConfig;
use payroll_kpi::{AnomalyParams, KpiEngine, KpiError};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "payroll-web";

#[derive(Clone)]
pub struct AppState {
    pub kpi: KpiEngine,
}

impl AppState {
    pub fn new(kpi: KpiEngine) -> Self {
        Self { kpi }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<KpiError> for ApiError {
    fn from(err: KpiError) -> Self {
        match err {
            KpiError::InvalidMonth(e) => ApiError::BadRequest(e.to_string()),
            KpiError::NoData(_) => ApiError::NotFound(err.to_string()),
            KpiError::Database(e) => {
                error!(error = %e, "kpi query failed");
                ApiError::Internal("warehouse query failed".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MonthQuery {
    pub month: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeltaQuery {
    pub m1: Option<String>,
    pub m2: Option<String>,
}

/// Numeric parameters arrive as text so malformed values get the JSON error body.
#[derive(Debug, Default, Deserialize)]
pub struct AnomalyQuery {
    pub month: Option<String>,
    pub threshold: Option<String>,
    pub limit: Option<String>,
    pub dept: Option<String>,
}

impl AnomalyQuery {
    fn params(&self) -> Result<AnomalyParams, ApiError> {
        let mut params = AnomalyParams::default();
        if let Some(raw) = non_blank(&self.threshold) {
            params.threshold = raw
                .parse::<f64>()
                .ok()
                .filter(|t| t.is_finite() && *t >= 0.0)
                .ok_or_else(|| ApiError::BadRequest(format!("invalid threshold {raw:?}")))?;
        }
        if let Some(raw) = non_blank(&self.limit) {
            params.limit = raw
                .parse()
                .map_err(|_| ApiError::BadRequest(format!("invalid limit {raw:?}")))?;
        }
        params.dept = non_blank(&self.dept).map(str::to_string);
        Ok(params)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn required_month(value: &Option<String>, name: &str) -> Result<Month, ApiError> {
    let raw = non_blank(value)
        .ok_or_else(|| ApiError::BadRequest(format!("missing query parameter {name}")))?;
    Ok(KpiEngine::month(raw)?)
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/kpi/summary", get(summary_handler))
        .route("/kpi/by-dept", get(by_dept_handler))
        .route("/kpi/delta", get(delta_handler))
        .route("/kpi/anomalies", get(anomalies_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PayrollConfig::from_env().context("reading payroll configuration")?;
    serve(&config).await
}

/// Ensures the schema, then serves until ctrl-c.
pub async fn serve(config: &PayrollConfig) -> anyhow::Result<()> {
    let warehouse = config.connect().await?;
    warehouse
        .ensure_schema()
        .await
        .context("ensuring warehouse schema")?;
    let state = AppState::new(KpiEngine::new(warehouse.pool().clone()));

    let listener = TcpListener::bind((config.web_host.as_str(), config.web_port))
        .await
        .with_context(|| format!("binding {}:{}", config.web_host, config.web_port))?;
    info!(addr = %listener.local_addr()?, "payroll kpi api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    warehouse.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MonthQuery>,
) -> Result<Json<Summary>, ApiError> {
    let month = required_month(&query.month, "month")?;
    Ok(Json(state.kpi.summary(month).await?))
}

async fn by_dept_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MonthQuery>,
) -> Result<Json<Vec<DeptAggregate>>, ApiError> {
    let month = required_month(&query.month, "month")?;
    Ok(Json(state.kpi.by_department(month).await?))
}

async fn delta_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeltaQuery>,
) -> Result<Json<DeltaReport>, ApiError> {
    let m1 = required_month(&query.m1, "m1")?;
    let m2 = required_month(&query.m2, "m2")?;
    Ok(Json(state.kpi.delta(m1, m2).await?))
}

async fn anomalies_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnomalyQuery>,
) -> Result<Json<Vec<AnomalyRow>>, ApiError> {
    let month = required_month(&query.month, "month")?;
    let params = query.params()?;
    Ok(Json(state.kpi.anomalies(month, &params).await?))
}
