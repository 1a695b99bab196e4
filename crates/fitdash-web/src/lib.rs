//! Axum + Askama status surface for the task engine.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use fitdash_core::Task;
use fitdash_storage::{PgStore, RejectedTask};
use fitdash_sync::EngineConfig;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "fitdash-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Option<PgStore>,
    pub max_failures: u32,
}

impl AppState {
    pub fn new(store: Option<PgStore>, max_failures: u32) -> Self {
        Self {
            store,
            max_failures,
        }
    }
}

/// One task as shown on the status page and returned by `/api/tasks`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub task_id: i64,
    pub task_name: String,
    pub service: String,
    pub frequency: String,
    pub next_planned: String,
    pub last_succeeded: String,
    pub consecutive_failures: u32,
    pub last_failure: String,
    pub circuit_open: bool,
}

fn display_ts(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl TaskRow {
    pub fn from_task(task: &Task, max_failures: u32) -> Self {
        Self {
            task_id: task.task_id,
            task_name: task.task_name.clone(),
            service: task.service().unwrap_or("-").to_string(),
            frequency: task.frequency.to_string(),
            next_planned: display_ts(task.next_planned_execution_utc),
            last_succeeded: display_ts(task.last_succeeded_utc),
            consecutive_failures: task.consecutive_failures,
            last_failure: task.last_failure_message.clone().unwrap_or_default(),
            circuit_open: task.consecutive_failures >= max_failures,
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    database_configured: bool,
    open_circuits: usize,
    tasks: Vec<TaskRow>,
    unreadable: Vec<RejectedTask>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/tasks", get(tasks_json_handler))
        .route("/tasks/{id}/reset", post(reset_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("FITDASH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = EngineConfig::from_env();
    let store = match PgStore::connect(&config.database_url).await {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(error = %err, "database unavailable; serving without task state");
            None
        }
    };
    let state = AppState::new(store, config.max_failures);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "status surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Displayable rows plus the configuration rows that could not be read.
async fn load_rows(state: &AppState) -> anyhow::Result<(Vec<TaskRow>, Vec<RejectedTask>)> {
    let Some(store) = &state.store else {
        return Ok((Vec::new(), Vec::new()));
    };
    let listing = store.list_tasks().await?;
    let rows = listing
        .tasks
        .iter()
        .map(|task| TaskRow::from_task(task, state.max_failures))
        .collect();
    Ok((rows, listing.rejected))
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_rows(&state).await {
        Ok((tasks, unreadable)) => render_html(IndexTemplate {
            database_configured: state.store.is_some(),
            open_circuits: tasks.iter().filter(|t| t.circuit_open).count(),
            tasks,
            unreadable,
        }),
        Err(err) => server_error(err),
    }
}

async fn tasks_json_handler(State(state): State<Arc<AppState>>) -> Response {
    if state.store.is_none() {
        return unavailable();
    }
    match load_rows(&state).await {
        Ok((rows, _)) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn reset_handler(State(state): State<Arc<AppState>>, Path(task_id): Path<i64>) -> Response {
    let Some(store) = &state.store else {
        return unavailable();
    };
    match store.reset_failures(task_id).await {
        Ok(true) => {
            info!(task_id, "task failures reset from status surface");
            Json(json!({ "task_id": task_id, "reset": true })).into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "task_id": task_id, "reset": false })),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(store) = &state.store else {
        return Json(json!({ "status": "ok", "database": "unconfigured" })).into_response();
    };
    match store.ping().await {
        Ok(()) => Json(json!({ "status": "ok", "database": "ok" })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": err.to_string() })),
        )
            .into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "database not configured" })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
