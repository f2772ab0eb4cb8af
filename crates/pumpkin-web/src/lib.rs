//! HTTP trigger surface and admin page for the stats jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pumpkin_core::{CounterAction, CounterKind};
use pumpkin_stats::{
    apply_counter_event, read_counters, CounterEvent, CounterValue, Job, JobError, StatsEngine,
};
use pumpkin_storage::StoreError;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "pumpkin-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StatsEngine>,
}

impl AppState {
    pub fn new(engine: Arc<StatsEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("template error: {0}")]
    Template(#[from] askama::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Job(JobError::UnknownJob(_)) => StatusCode::NOT_FOUND,
            ApiError::Job(_) | ApiError::Store(_) | ApiError::Template(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

struct JobRow {
    name: &'static str,
    description: &'static str,
    epoch: String,
}

struct CounterRow {
    name: &'static str,
    value: u64,
}

#[derive(Template)]
#[template(path = "admin.html")]
struct AdminTemplate {
    backend: &'static str,
    counters: Vec<CounterRow>,
    jobs: Vec<JobRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(admin_handler))
        .route("/jobs", post(run_all_handler))
        .route("/jobs/{job}", get(run_job_handler).post(run_job_handler))
        .route("/events/{counter}/{action}", post(counter_event_handler))
        .route("/counters", get(counters_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(engine: Arc<StatsEngine>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, backend = engine.store().backend_name(), "serving stats triggers");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn admin_handler(State(state): State<Arc<AppState>>) -> Result<Html<String>, ApiError> {
    let store = state.engine.store();
    let counters = read_counters(store.as_ref())
        .await?
        .into_iter()
        .map(|(name, value)| CounterRow { name, value })
        .collect();
    let epochs = state.engine.published_epochs().await?;
    let jobs = Job::ALL
        .into_iter()
        .map(|job| JobRow {
            name: job.name(),
            description: job.description(),
            epoch: epochs
                .get(job.name())
                .and_then(|entry| entry.get("epoch"))
                .and_then(Value::as_str)
                .unwrap_or("never")
                .to_string(),
        })
        .collect();

    let html = AdminTemplate {
        backend: store.backend_name(),
        counters,
        jobs,
    }
    .render()?;
    Ok(Html(html))
}

async fn run_job_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(job): AxumPath<String>,
) -> Result<String, ApiError> {
    let summary = state.engine.run_by_name(&job).await?;
    Ok(summary.acknowledgment())
}

async fn run_all_handler(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    let summaries = state.engine.run_all().await?;
    Ok(summaries
        .iter()
        .map(|summary| summary.acknowledgment())
        .collect::<Vec<_>>()
        .join("\n"))
}

async fn counter_event_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((counter, action)): AxumPath<(String, String)>,
) -> Result<Json<CounterValue>, ApiError> {
    let kind: CounterKind = counter.parse().map_err(ApiError::BadRequest)?;
    let action: CounterAction = action.parse().map_err(ApiError::BadRequest)?;
    let value = apply_counter_event(state.engine.store().as_ref(), CounterEvent::new(kind, action)).await?;
    Ok(Json(value))
}

async fn counters_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BTreeMap<&'static str, u64>>, ApiError> {
    Ok(Json(read_counters(state.engine.store().as_ref()).await?))
}
