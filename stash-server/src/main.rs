//! stash-server - local HTTP API and live event stream for stash runs.

mod error;
mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use stash::engine::{Engine, EngineSettings};
use stash::io::adapter::{CodexAdapter, ExecutionAdapter};
use stash::io::config::load_config;
use stash::io::store::HistoryStore;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "stash-server")]
#[command(about = "Local HTTP API and event stream for stash runs")]
struct Args {
    /// Config file (TOML). Defaults apply when it does not exist.
    #[arg(long, default_value = ".stash/config.toml")]
    config: PathBuf,

    /// Address to bind the server to (overrides `server.bind`)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides `server.port`)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stash::logging::init_with_default("stash_server=info,stash=info");

    let args = Args::parse();
    let cfg = load_config(&args.config)?;

    let store = HistoryStore::open(&cfg.database_path)
        .with_context(|| format!("open history store {}", cfg.database_path.display()))?;
    let adapter: Arc<dyn ExecutionAdapter> = Arc::new(CodexAdapter::from_config(&cfg));
    let engine = Engine::start(Arc::new(store), adapter, EngineSettings::from_config(&cfg))
        .context("start run engine")?;
    let engine = Arc::new(engine);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = routes::app(AppState::new(Arc::clone(&engine))).layer(cors);

    let bind = args.bind.unwrap_or(cfg.server.bind);
    let port = args.port.unwrap_or(cfg.server.port);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {bind}:{port}"))?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("waiting for in-flight runs");
    tokio::task::spawn_blocking(move || engine.shutdown()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(err = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
