use burnin_monitor::proxy::forward::{ProxyState, create_proxy_router};
use burnin_monitor::proxy::{Preset, ProxyTable};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Puts the dashboard dev server and the monitor backend behind one origin.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Routing preset
    #[arg(short, long, value_enum, default_value_t = Preset::Local)]
    preset: Preset,

    /// Backend origin overriding the preset, e.g. http://10.0.0.5:8000
    #[arg(short, long)]
    target: Option<String>,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:5173")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .init();

    let mut table = ProxyTable::preset(args.preset);
    if let Some(target) = args.target.as_deref() {
        table = table.with_target(target)?;
    }
    for rule in &table.rules {
        info!(prefix = %rule.prefix, target = %rule.target, ws = rule.ws, "Proxy rule.");
    }

    let app = create_proxy_router(Arc::new(ProxyState::new(table)?));
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!("Dev proxy listening on {}", args.listen);
    axum::serve(listener, app).await?;
    Ok(())
}
