use axum::{
    Json, Router,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;

use crate::services::{TaskOutcome, meminfo};
use crate::web::{AppError, AppState};

async fn deploy_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    Ok(Json(meminfo::deploy(&app_state.tasks, &server).await))
}

async fn run_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    Ok(Json(meminfo::run(&app_state.tasks, &server).await))
}

/// Streams the collected report back as a text attachment.
async fn download_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Response, AppError> {
    let server = app_state.server(&server_id)?;
    match meminfo::download(&app_state.tasks, &server).await {
        Ok(report) => Ok((
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", report.file_name),
                ),
            ],
            report.contents,
        )
            .into_response()),
        Err(outcome) => Ok(Json(outcome).into_response()),
    }
}

pub fn meminfo_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/servers/{server_id}/meminfo/deploy", post(deploy_handler))
        .route("/servers/{server_id}/meminfo/run", post(run_handler))
        .route("/servers/{server_id}/meminfo/download", get(download_handler))
}
