//! HTTP trigger surface for character and bulk scrapes.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rankfeed_sync::{
    maybe_build_scheduler, BulkRequest, JobStartError, PgCharacterStore, ScrapeConfig, ScrapeError,
    ScrapeService,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "rankfeed-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ScrapeService>,
}

impl AppState {
    pub fn new(service: Arc<ScrapeService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkQuery {
    pub max_pages: Option<usize>,
    pub concurrency: Option<usize>,
    pub job_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobBody<'a> {
    job_id: &'a str,
    status: &'a str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/scrape/character/{name}", post(scrape_character_handler))
        .route("/scrape/all", post(scrape_all_handler))
        .route("/scrape/status/{job_id}", get(scrape_status_handler))
        .with_state(Arc::new(state))
}

pub fn web_port_from_env() -> u16 {
    std::env::var("RANKFEED_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ScrapeConfig::from_env();
    let store = PgCharacterStore::connect_lazy(&config.database_url).context("configuring character store")?;
    let service = Arc::new(ScrapeService::from_config(&config, Arc::new(store))?);
    serve(service, &config, web_port_from_env()).await
}

/// Serves until ctrl-c, then cancels running bulk jobs and waits for them.
pub async fn serve(service: Arc<ScrapeService>, config: &ScrapeConfig, port: u16) -> anyhow::Result<()> {
    let scheduler = maybe_build_scheduler(service.clone(), config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.scrape_cron, "scrape scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(service.clone())))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler unavailable");
            }
        })
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    service.shutdown().await;
    Ok(())
}

async fn scrape_character_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.service.scrape_character(&name).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, format!("character {name} not found on the ranking")),
        Err(err) => scrape_error(err),
    }
}

async fn scrape_all_handler(State(state): State<Arc<AppState>>, Query(query): Query<BulkQuery>) -> Response {
    let Some(job_id) = query.job_id.filter(|id| !id.trim().is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "jobId is required".to_string());
    };

    let request = BulkRequest {
        job_id: job_id.clone(),
        max_pages: query.max_pages,
        concurrency: query.concurrency,
    };
    match state.service.spawn_bulk(request) {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(JobBody {
                job_id: &job_id,
                status: "accepted",
            }),
        )
            .into_response(),
        Err(err @ JobStartError::AlreadyRunning(_)) => error_body(StatusCode::CONFLICT, err.to_string()),
        Err(err) => error_body(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

async fn scrape_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(job_id): AxumPath<String>,
) -> Response {
    match state.service.job_status(&job_id) {
        Some(status) => (
            StatusCode::OK,
            Json(JobBody {
                job_id: &job_id,
                status: status.as_str(),
            }),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(JobBody {
                job_id: &job_id,
                status: "NotFound",
            }),
        )
            .into_response(),
    }
}

fn scrape_error(err: ScrapeError) -> Response {
    let status = match &err {
        ScrapeError::InvalidName(_) => StatusCode::BAD_REQUEST,
        ScrapeError::Bootstrap(_) | ScrapeError::Page(_) => StatusCode::BAD_GATEWAY,
        ScrapeError::Storage(_) | ScrapeError::Config(_) | ScrapeError::Job(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        error!(error = %err, "character scrape failed");
    }
    error_body(status, err.to_string())
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
