use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::db::models::task_status;
use crate::services::{TaskOutcome, acreboot};
use crate::web::{AppError, AppState};

fn default_socket() -> String {
    "1".to_string()
}

#[derive(Deserialize)]
pub struct AcConfigRequest {
    #[serde(default)]
    ac_ip: String,
    #[serde(default = "default_socket")]
    ac_socket: String,
    #[serde(default)]
    ac_temp_ip: String,
}

async fn save_config_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
    Json(payload): Json<AcConfigRequest>,
) -> Result<Json<TaskOutcome>, AppError> {
    app_state
        .store
        .update(&server_id, |s| {
            s.ac_ip = payload.ac_ip.trim().to_string();
            s.ac_socket = payload.ac_socket.trim().to_string();
            s.ac_temp_ip = payload.ac_temp_ip.trim().to_string();
        })
        .ok_or_else(|| AppError::server_not_found(&server_id))?;

    info!(server_id = %server_id, "AC box config saved.");
    app_state.notify_changed();
    Ok(Json(TaskOutcome::ok("AC config saved")))
}

async fn deploy_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    let outcome = acreboot::deploy(&app_state.tasks, &server).await;
    Ok(app_state.record_outcome(&server_id, outcome, |s| {
        s.reboot_status = task_status::DEPLOYED.to_string();
        s.reboot_phase = "AC script deployed".to_string();
    }))
}

async fn start_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    let outcome = acreboot::start(&app_state.tasks, &server).await;
    Ok(app_state.record_outcome(&server_id, outcome, |s| {
        s.reboot_status = task_status::RUNNING.to_string();
        s.reboot_phase = "AC cycling in progress...".to_string();
    }))
}

async fn stop_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    let outcome = acreboot::stop(&app_state.tasks, &server).await;
    Ok(app_state.record_outcome(&server_id, outcome, |s| {
        s.reboot_status = task_status::STOPPED.to_string();
        s.reboot_phase = "AC cycling stopped".to_string();
    }))
}

async fn reset_handler(
    State(app_state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<TaskOutcome>, AppError> {
    let server = app_state.server(&server_id)?;
    let outcome = acreboot::reset(&app_state.tasks, &server).await;
    Ok(app_state.record_outcome(&server_id, outcome, |s| {
        s.reboot_status = task_status::IDLE.to_string();
        s.reboot_phase = "Environment reset".to_string();
        s.reboot_loop = "-".to_string();
    }))
}

pub fn acreboot_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/servers/{server_id}/acreboot/save_config", post(save_config_handler))
        .route("/servers/{server_id}/acreboot/deploy", post(deploy_handler))
        .route("/servers/{server_id}/acreboot/start", post(start_handler))
        .route("/servers/{server_id}/acreboot/stop", post(stop_handler))
        .route("/servers/{server_id}/acreboot/reset", post(reset_handler))
}

#[cfg(test)]
mod tests {
    use crate::services::acreboot::SCRIPT_AC_NAME;
    use crate::services::reboot::SCRIPT_MONITOR_NAME;
    use crate::web::testing::Harness;
    use serde_json::json;

    #[tokio::test]
    async fn save_config_applies_defaults() {
        let harness = Harness::new(&[], &[]).with_server("node-01");
        harness.state.store.update("node-01", |s| s.ac_socket = "3".to_string());

        let (_, body) = harness
            .json(
                "POST",
                "/servers/node-01/acreboot/save_config",
                Some(json!({ "ac_ip": "192.168.100.20" })),
            )
            .await;
        assert_eq!(body["success"], true);

        let server = harness.state.store.get("node-01").unwrap();
        assert_eq!(server.ac_ip, "192.168.100.20");
        assert_eq!(server.ac_socket, "1");
        assert_eq!(server.ac_temp_ip, "");
    }

    #[tokio::test]
    async fn save_config_for_unknown_server_is_404() {
        let harness = Harness::new(&[], &[]);
        let (status, _) = harness
            .json("POST", "/servers/ghost/acreboot/save_config", Some(json!({})))
            .await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn deploy_without_box_ip_fails_fast() {
        let harness = Harness::new(&[], &[]).with_server("node-01");

        let (status, body) = harness.json("POST", "/servers/node-01/acreboot/deploy", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["success"], false);
        assert!(harness.shell.commands().is_empty());
        assert_eq!(harness.state.store.get("node-01").unwrap().reboot_status, "Idle");
    }

    #[tokio::test]
    async fn deploy_then_start() {
        let harness = Harness::new(
            &[(SCRIPT_MONITOR_NAME, "m"), (SCRIPT_AC_NAME, "box_ip=\"\"\n")],
            &[],
        )
        .with_server("node-01");
        harness.state.store.update("node-01", |s| s.ac_ip = "192.168.100.20".to_string());

        let (_, body) = harness.json("POST", "/servers/node-01/acreboot/deploy", None).await;
        assert_eq!(body["success"], true, "{body}");
        let server = harness.state.store.get("node-01").unwrap();
        assert_eq!(server.reboot_status, "Deployed");
        assert_eq!(server.reboot_phase, "AC script deployed");

        harness.shell.reply_stdout("SUCCESS: ACReboot Started (Monitor:1, Cycle:2)");
        harness.json("POST", "/servers/node-01/acreboot/start", None).await;
        let server = harness.state.store.get("node-01").unwrap();
        assert_eq!(server.reboot_status, "Running");
        assert_eq!(server.reboot_phase, "AC cycling in progress...");
    }

    #[tokio::test]
    async fn stop_and_reset() {
        let harness = Harness::new(&[], &[]).with_server("node-01");
        harness.shell.reply_stdout("SUCCESS: Stopped (No logs)");
        harness.json("POST", "/servers/node-01/acreboot/stop", None).await;
        assert_eq!(
            harness.state.store.get("node-01").unwrap().reboot_phase,
            "AC cycling stopped"
        );

        harness.state.store.update("node-01", |s| s.reboot_loop = "9".to_string());
        harness.shell.reply_stdout("SUCCESS: Reset Done");
        harness.json("POST", "/servers/node-01/acreboot/reset", None).await;
        let server = harness.state.store.get("node-01").unwrap();
        assert_eq!(server.reboot_status, "Idle");
        assert_eq!(server.reboot_phase, "Environment reset");
        assert_eq!(server.reboot_loop, "-");
    }
}
