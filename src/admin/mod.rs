//! Operator HTTP surface: health, scheduler introspection and manual triggers.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;

use crate::{
    app::CrawlEngine,
    infrastructure::shutdown::ShutdownListener,
    tasks::{FireOutcome, SchedulerStatus},
};

type Engine = State<Arc<CrawlEngine>>;

pub fn router(engine: Arc<CrawlEngine>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/site-health", get(site_health))
        .route("/api/site-health/:domain", get(site_health_for))
        .route("/api/scheduler", get(scheduler))
        .route("/api/jobs/:id/run", post(run_job))
        .route("/api/jobs/:id/pause", post(pause_job))
        .route("/api/jobs/:id/resume", post(resume_job))
        .route("/api/run-all", post(run_all))
        .route("/api/maintenance", post(maintenance))
        .with_state(engine)
}

pub async fn serve(listener: TcpListener, router: Router, mut stop: ShutdownListener) -> Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            stop.notified().await;
            tracing::info!(target: "admin", "admin API shutting down");
        })
        .await
        .context("admin API server error")
}

async fn healthz(State(engine): Engine) -> Response {
    let status = engine.scheduler_status();
    let code = if status == SchedulerStatus::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": status,
        "opportunities": engine.opportunity_count(),
        "fetch_slots": engine.fetch_slots(),
    });
    (code, Json(body)).into_response()
}

async fn site_health(State(engine): Engine) -> Response {
    Json(engine.site_health()).into_response()
}

async fn site_health_for(State(engine): Engine, Path(domain): Path<String>) -> Response {
    match engine.site_health_for(&domain) {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "domain": domain, "error": "domain not tracked" })),
        )
            .into_response(),
    }
}

async fn maintenance(State(engine): Engine) -> Response {
    Json(engine.run_maintenance().await).into_response()
}

async fn scheduler(State(engine): Engine) -> Response {
    Json(engine.scheduler_info()).into_response()
}

async fn run_job(State(engine): Engine, Path(id): Path<String>) -> Response {
    let outcome = engine.run_job_now(&id);
    tracing::info!(target: "admin", job = %id, ?outcome, "manual run requested");
    fire_response(&id, outcome)
}

async fn run_all(State(engine): Engine) -> Response {
    let outcome = engine.run_all_now();
    tracing::info!(target: "admin", ?outcome, "manual run-all requested");
    fire_response(crate::config::RUN_ALL_JOB_ID, outcome)
}

fn fire_response(job: &str, outcome: FireOutcome) -> Response {
    let code = match outcome {
        FireOutcome::Started => StatusCode::ACCEPTED,
        FireOutcome::NotFound => StatusCode::NOT_FOUND,
        FireOutcome::Busy | FireOutcome::Misfired | FireOutcome::Paused => StatusCode::CONFLICT,
    };
    (code, Json(json!({ "job": job, "outcome": outcome }))).into_response()
}

async fn pause_job(State(engine): Engine, Path(id): Path<String>) -> Response {
    toggle_response(&id, engine.pause_job(&id), true)
}

async fn resume_job(State(engine): Engine, Path(id): Path<String>) -> Response {
    toggle_response(&id, engine.resume_job(&id), false)
}

fn toggle_response(job: &str, found: bool, paused: bool) -> Response {
    if !found {
        return (StatusCode::NOT_FOUND, Json(json!({ "job": job, "error": "unknown job" })))
            .into_response();
    }
    tracing::info!(target: "admin", job, paused, "job pause state changed");
    (StatusCode::OK, Json(json!({ "job": job, "paused": paused }))).into_response()
}
