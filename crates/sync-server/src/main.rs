//! sync-server: replication server for the entity-change log.
//!
//! Serves pull/push/check/stats over a thin HTTP surface and runs the
//! partial-request buffer sweeper in the background.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use sync_core::store::Store;
use sync_server::partial::BufferSweeper;
use sync_server::routes::{AppState, router};

#[derive(Parser, Debug)]
#[command(name = "sync-server")]
#[command(about = "Entity-change replication server")]
struct Cli {
    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "SYNC_BIND")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8080, env = "SYNC_PORT")]
    port: u16,

    /// Instance id for this server (generated if not provided)
    #[arg(long, env = "SYNC_INSTANCE_ID")]
    instance_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sync_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let instance_id = cli
        .instance_id
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let store = Arc::new(Store::new(instance_id.clone()));
    let state = Arc::new(AppState::new(store));

    let mut sweeper = BufferSweeper::start(state.push.buffers());

    let app = router(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;
    tracing::info!("sync-server listening on {} (instance '{}')", addr, instance_id);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.stop();
    tracing::info!("sync-server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
