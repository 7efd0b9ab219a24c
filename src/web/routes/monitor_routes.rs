use axum::{Json, Router, extract::State, routing::post};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::db::models::Server;
use crate::web::{AppError, AppState};

#[derive(Serialize)]
pub struct RefreshResponse {
    results: Vec<Server>,
}

/// Probes every BMC and OS address at once, then writes only the two
/// reachability flags so webhook updates landing meanwhile are kept.
async fn refresh_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<RefreshResponse>, AppError> {
    let snapshot = app_state.store.list();
    let pinger = &app_state.pinger;

    let probes = snapshot.iter().map(|server| async move {
        let bmc = pinger.is_alive(&server.bmc_ip);
        let os = async {
            match server.os_address() {
                Some(os_ip) => pinger.is_alive(os_ip).await,
                None => false,
            }
        };
        let (bmc_online, os_online) = tokio::join!(bmc, os);
        (server.server_id.clone(), bmc_online, os_online)
    });
    let probed = join_all(probes).await;

    let results: Vec<Server> = probed
        .into_iter()
        .filter_map(|(server_id, bmc_online, os_online)| {
            app_state.store.update(&server_id, |server| {
                server.bmc_online = bmc_online;
                server.os_online = os_online;
            })
        })
        .collect();

    info!(servers = results.len(), "Refreshed reachability.");
    app_state.notify_changed();
    Ok(Json(RefreshResponse { results }))
}

pub fn monitor_router() -> Router<Arc<AppState>> {
    Router::new().route("/monitor/refresh", post(refresh_handler))
}
