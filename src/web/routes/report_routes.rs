use axum::{Json, Router, extract::State, routing::post};
use chrono::Local;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::models::{TaskType, WebhookData};
use crate::web::AppState;

/// Progress callback posted by the daemons running on managed machines.
async fn webhook_handler(
    State(app_state): State<Arc<AppState>>,
    Json(report): Json<WebhookData>,
) -> Json<Value> {
    let now = Local::now().format("%H:%M:%S").to_string();

    let updated = app_state.store.update(&report.server_id, |server| {
        match report.task_type {
            TaskType::Memtest => {
                server.memtest_status = report.status.clone();
                server.memtest_phase = report.phase.clone();
            }
            TaskType::Reboot => {
                server.reboot_status = report.status.clone();
                server.reboot_phase = report.phase.clone();
                server.reboot_loop = report.loop_count.clone();
            }
        }
        server.last_report_time = now;
    });

    if updated.is_none() {
        warn!(server_id = %report.server_id, "Report for unknown server ignored.");
        return Json(json!({ "status": "ignored" }));
    }

    debug!(
        server_id = %report.server_id,
        task_type = ?report.task_type,
        status = %report.status,
        "Task report applied."
    );
    app_state.notify_changed();
    Json(json!({ "status": "ok" }))
}

pub fn report_router() -> Router<Arc<AppState>> {
    Router::new().route("/report/webhook", post(webhook_handler))
}

#[cfg(test)]
mod tests {
    use crate::web::testing::Harness;
    use serde_json::json;

    #[tokio::test]
    async fn reboot_report_updates_loop() {
        let mut harness = Harness::new(&[], &[]).with_server("node-01");
        let (status, body) = harness
            .json(
                "POST",
                "/report/webhook",
                Some(json!({
                    "server_id": "node-01",
                    "task_type": "reboot",
                    "status": "Running",
                    "phase": "Warm reboot",
                    "loop": "12"
                })),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({ "status": "ok" }));

        let server = harness.state.store.get("node-01").unwrap();
        assert_eq!(server.reboot_status, "Running");
        assert_eq!(server.reboot_phase, "Warm reboot");
        assert_eq!(server.reboot_loop, "12");
        assert_eq!(server.memtest_status, "Idle");
        let time = &server.last_report_time;
        assert_eq!(time.len(), 8);
        assert_eq!(time.as_bytes()[2], b':');
        assert!(harness.update_trigger_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn memtest_report_leaves_reboot_fields() {
        let harness = Harness::new(&[], &[]).with_server("node-01");
        harness
            .json(
                "POST",
                "/report/webhook",
                Some(json!({
                    "server_id": "node-01",
                    "task_type": "memtest",
                    "status": "Running",
                    "phase": "Pass 2",
                    "loop": "99"
                })),
            )
            .await;

        let server = harness.state.store.get("node-01").unwrap();
        assert_eq!(server.memtest_status, "Running");
        assert_eq!(server.memtest_phase, "Pass 2");
        assert_eq!(server.reboot_loop, "-");
        assert_eq!(server.reboot_status, "Idle");
    }

    #[tokio::test]
    async fn unknown_server_is_ignored() {
        let harness = Harness::new(&[], &[]);
        let (status, body) = harness
            .json(
                "POST",
                "/report/webhook",
                Some(json!({ "server_id": "ghost", "status": "Running", "phase": "x" })),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({ "status": "ignored" }));
        assert!(harness.state.store.is_empty());
    }

    #[tokio::test]
    async fn unknown_task_type_is_rejected() {
        let harness = Harness::new(&[], &[]).with_server("node-01");
        let response = harness
            .send(
                "POST",
                "/report/webhook",
                Some(json!({
                    "server_id": "node-01",
                    "task_type": "acreboot",
                    "status": "Running",
                    "phase": "x"
                })),
            )
            .await;
        assert_eq!(response.status(), 422);
        assert_eq!(harness.state.store.get("node-01").unwrap().reboot_status, "Idle");
    }
}
