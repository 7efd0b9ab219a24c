use burnin_monitor::db::ServerStore;
use burnin_monitor::server::config::ServerConfig;
use burnin_monitor::server::update_service::{self, DEBOUNCE_DURATION, ServerListPush};
use burnin_monitor::services::TaskContext;
use burnin_monitor::services::encryption_service::CredentialCipher;
use burnin_monitor::services::ping::IcmpPinger;
use burnin_monitor::services::scripts::ScriptLibrary;
use burnin_monitor::services::ssh::Ssh2Shell;
use burnin_monitor::web::{self, AppState};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Release builds stamp `APP_VERSION`; dev builds report the crate version.
const VERSION: &str = match option_env!("APP_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    // JSON file, rotated daily
    let file_appender = rolling::daily(log_dir, "server.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal.");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received.");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Logging needs the log dir, so config errors before that go to stderr.
    let config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load server configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&config.log_dir);
    info!("Starting burn-in monitor, version: {}", VERSION);
    info!(webhook_url = %config.webhook_url(), "Remote scripts will report here.");

    let cipher = match config.credential_key.as_deref() {
        Some(key) => Some(CredentialCipher::from_hex_key(key).map_err(|e| {
            error!("Invalid credential key: {}", e);
            e
        })?),
        None => None,
    };

    let store = ServerStore::open(config.inventory_path(), cipher)?;

    let tasks = TaskContext {
        shell: Arc::new(Ssh2Shell::new(
            config.ssh_connect_timeout(),
            config.ssh_command_timeout(),
        )),
        scripts: ScriptLibrary::new(&config.script_dir, config.webhook_url()),
        download_dir: config.download_dir.clone().into(),
    };

    // --- Debounced server list push ---
    let (update_trigger_tx, update_trigger_rx) = mpsc::channel::<()>(100);
    let (server_list_tx, _) = broadcast::channel::<ServerListPush>(16);
    let debouncer_task = tokio::spawn(update_service::run_debouncer(
        store.clone(),
        update_trigger_rx,
        server_list_tx.clone(),
        DEBOUNCE_DURATION,
    ));

    let app_state = Arc::new(AppState {
        store: store.clone(),
        tasks,
        pinger: Arc::new(IcmpPinger::new(config.ping_timeout())),
        update_trigger_tx,
        server_list_tx,
    });
    let app = web::create_axum_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("HTTP server listening on {}", config.listen_addr);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    debouncer_task.abort();
    if let Err(e) = store.flush() {
        error!(error = %e, "Failed to write the final inventory snapshot.");
    }
    info!("Server stopped.");
    Ok(())
}
