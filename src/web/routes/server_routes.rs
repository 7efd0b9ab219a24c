use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{delete, get, post},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::db::models::{Server, ServerItem};
use crate::web::{AppError, AppState};

async fn list_servers_handler(State(app_state): State<Arc<AppState>>) -> Json<Vec<Server>> {
    Json(app_state.store.list())
}

async fn list_server_items_handler(State(app_state): State<Arc<AppState>>) -> Json<Vec<ServerItem>> {
    let items = app_state
        .store
        .records()
        .iter()
        .map(ServerItem::from_record)
        .collect();
    Json(items)
}

async fn add_server_handler(
    State(app_state): State<Arc<AppState>>,
    Json(mut server): Json<Server>,
) -> Result<Json<Value>, AppError> {
    server.server_id = server.server_id.trim().to_string();
    server.bmc_ip = server.bmc_ip.trim().to_string();
    Server::validate_server_id(&server.server_id).map_err(AppError::InvalidInput)?;
    if server.bmc_ip.is_empty() {
        return Err(AppError::InvalidInput("bmc_ip must not be empty".to_string()));
    }

    let server_id = server.server_id.clone();
    let created = app_state.store.upsert(server);
    info!(server_id = %server_id, created, "Server saved.");
    app_state.notify_changed();
    Ok(Json(json!({ "success": true, "message": "Server saved" })))
}

async fn delete_server_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if !app_state.store.delete(&server_id) {
        return Err(AppError::server_not_found(&server_id));
    }
    info!(server_id = %server_id, "Server deleted.");
    app_state.notify_changed();
    Ok(Json(json!({ "success": true, "status": "success" })))
}

pub fn server_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/servers", get(list_servers_handler))
        .route("/servers/items", get(list_server_items_handler))
        .route("/servers/add", post(add_server_handler))
        .route("/servers/delete/{server_id}", delete(delete_server_handler))
}
