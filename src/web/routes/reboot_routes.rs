use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use std::sync::Arc;

use crate::db::models::task_status;
use crate::services::{TaskOutcome, reboot};
use crate::web::{AppError, AppState};

async fn deploy_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    let outcome = reboot::deploy(&app_state.tasks, &server).await;
    Ok(app_state.record_outcome(&server_id, outcome, |s| {
        s.reboot_status = task_status::DEPLOYED.to_string();
        s.reboot_phase = "Deployed".to_string();
    }))
}

async fn start_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    let outcome = reboot::start(&app_state.tasks, &server).await;
    Ok(app_state.record_outcome(&server_id, outcome, |s| {
        s.reboot_status = task_status::RUNNING.to_string();
        s.reboot_phase = "Starting...".to_string();
    }))
}

async fn stop_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    let outcome = reboot::stop(&app_state.tasks, &server).await;
    Ok(app_state.record_outcome(&server_id, outcome, |s| {
        s.reboot_status = task_status::STOPPED.to_string();
        s.reboot_phase = "Stopped by user".to_string();
    }))
}

async fn reset_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    let outcome = reboot::reset(&app_state.tasks, &server).await;
    Ok(app_state.record_outcome(&server_id, outcome, |s| {
        s.reboot_status = task_status::IDLE.to_string();
        s.reboot_phase = "Environment reset".to_string();
        s.reboot_loop = "-".to_string();
    }))
}

pub fn reboot_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/servers/{server_id}/deploy", post(deploy_handler))
        .route("/servers/{server_id}/start_test", post(start_handler))
        .route("/servers/{server_id}/stop_test", post(stop_handler))
        .route("/servers/{server_id}/reset_files", post(reset_handler))
}
