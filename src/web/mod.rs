use axum::{
    Json, Router,
    http::Method,
    routing::get,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};

use crate::db::ServerStore;
use crate::db::models::Server;
use crate::server::update_service::{self, ServerListPush};
use crate::services::ping::Pinger;
use crate::services::{TaskContext, TaskOutcome};
use crate::web::routes::*;

pub mod error;
pub mod routes;
pub mod websocket_handler;

pub use error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub store: ServerStore,
    pub tasks: TaskContext,
    pub pinger: Arc<dyn Pinger>,
    pub update_trigger_tx: mpsc::Sender<()>,
    pub server_list_tx: broadcast::Sender<ServerListPush>,
}

impl AppState {
    /// Current record for `server_id`, or a 404.
    pub fn server(&self, server_id: &str) -> Result<Server, AppError> {
        self.store
            .get(server_id)
            .ok_or_else(|| AppError::server_not_found(server_id))
    }

    pub fn notify_changed(&self) {
        update_service::notify_changed(&self.update_trigger_tx);
    }

    /// Applies `mutate` to the latest record when the task succeeded.
    /// A record deleted while the task ran is left deleted.
    pub fn record_outcome<F>(&self, server_id: &str, outcome: TaskOutcome, mutate: F) -> Json<TaskOutcome>
    where
        F: FnOnce(&mut Server),
    {
        if outcome.success && self.store.update(server_id, mutate).is_some() {
            self.notify_changed();
        }
        Json(outcome)
    }
}

async fn health_check_handler() -> &'static str {
    "OK"
}

pub fn create_axum_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check_handler))
        .route("/ws/servers", get(websocket_handler::websocket_handler))
        .merge(monitor_routes::monitor_router())
        .merge(report_routes::report_router())
        .merge(server_routes::server_router())
        .merge(reboot_routes::reboot_router())
        .merge(memtest_routes::memtest_router())
        .merge(meminfo_routes::meminfo_router())
        .merge(acreboot_routes::acreboot_router())
        .with_state(app_state)
        .layer(cors)
}
