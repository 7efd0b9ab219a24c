use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::debug;

use crate::db::models::Server;
use crate::db::ServerStore;

/// Quiet window between the first change signal and the push.
pub const DEBOUNCE_DURATION: Duration = Duration::from_millis(500);

/// Full inventory pushed to every dashboard session.
#[derive(Serialize, Debug, Clone)]
pub struct ServerListPush {
    pub servers: Vec<Server>,
}

/// Broadcasts the current inventory to all WebSocket subscribers.
pub fn broadcast_server_list(store: &ServerStore, broadcaster: &broadcast::Sender<ServerListPush>) {
    if broadcaster.receiver_count() == 0 {
        debug!("No web clients listening, skipping broadcast.");
        return;
    }
    let push = ServerListPush {
        servers: store.list(),
    };
    match broadcaster.send(push) {
        Ok(clients) => debug!(clients, "Broadcasted server list."),
        // Every subscriber left between the check and the send.
        Err(_) => debug!("Broadcast failed: No clients were listening."),
    }
}

/// Collapses bursts of change signals into one broadcast per `window`.
/// Returns once every trigger sender is dropped.
pub async fn run_debouncer(
    store: ServerStore,
    mut update_trigger_rx: mpsc::Receiver<()>,
    broadcaster: broadcast::Sender<ServerListPush>,
    window: Duration,
) {
    loop {
        if update_trigger_rx.recv().await.is_none() {
            break;
        }

        sleep(window).await;

        while update_trigger_rx.try_recv().is_ok() {}

        debug!("Debounce window finished. Broadcasting server list.");
        broadcast_server_list(&store, &broadcaster);
    }
}

/// Fire-and-forget change signal; a full queue already implies a pending push.
pub fn notify_changed(update_trigger_tx: &mpsc::Sender<()>) {
    let _ = update_trigger_tx.try_send(());
}
