use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::db::models::task_status;
use crate::services::memtest::{self, DEFAULT_RUNTIME_SECS};
use crate::services::TaskOutcome;
use crate::web::{AppError, AppState};

#[derive(Deserialize, Default)]
pub struct StartMemtestRequest {
    #[serde(default)]
    runtime: Option<Value>,
}

impl StartMemtestRequest {
    /// Dashboards send the runtime either as `"7200"` or `7200`.
    fn runtime(&self) -> String {
        match &self.runtime {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Null) | None => DEFAULT_RUNTIME_SECS.to_string(),
            Some(other) => other.to_string(),
        }
    }
}

async fn deploy_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    let outcome = memtest::deploy(&app_state.tasks, &server).await;
    Ok(app_state.record_outcome(&server_id, outcome, |s| {
        s.memtest_status = task_status::DEPLOYED.to_string();
        s.memtest_phase = "Environment ready".to_string();
    }))
}

async fn start_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
    payload: Option<Json<StartMemtestRequest>>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    let runtime = payload.map(|Json(p)| p).unwrap_or_default().runtime();
    let outcome = memtest::start(&app_state.tasks, &server, &runtime).await;
    Ok(app_state.record_outcome(&server_id, outcome, |s| {
        s.memtest_status = task_status::RUNNING.to_string();
        s.memtest_phase = format!("Start command sent (limit {runtime}s)");
        s.memtest_runtime_configured = runtime.clone();
    }))
}

async fn archive_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    let outcome = memtest::archive(&app_state.tasks, &server).await;
    Ok(app_state.record_outcome(&server_id, outcome, |s| {
        s.memtest_status = task_status::FINISHED.to_string();
        s.memtest_phase = "Archived".to_string();
    }))
}

pub fn memtest_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/servers/{server_id}/memtest/deploy", post(deploy_handler))
        .route("/servers/{server_id}/memtest/start", post(start_handler))
        .route("/servers/{server_id}/memtest/archive", post(archive_handler))
}
