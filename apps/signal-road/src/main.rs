mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use webrtc_rpc::call_queue::{CallQueue, MemoryCallQueue};
use webrtc_rpc::signaling::{router, SignalingServer};

use crate::config::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Default to WARN plus our own INFO if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,signal_road=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let queue = build_queue(&cli).await?;
    let server = SignalingServer::new(queue);

    let app = router(server.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = cli.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, offer_deadline_secs = cli.offer_deadline().as_secs(), "signal-road listening");

    let shutdown_server = server.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for ctrl-c");
                return;
            }
            info!("shutting down");
            shutdown_server.shutdown().await;
        })
        .await
        .context("server error")?;
    Ok(())
}

#[cfg(feature = "redis-queue")]
async fn build_queue(cli: &Cli) -> Result<Arc<dyn CallQueue>> {
    use webrtc_rpc::call_queue::{DistributedCallQueue, RedisDocumentStore};

    match &cli.redis_url {
        Some(url) => {
            let store = RedisDocumentStore::connect(url, cli.offer_deadline())
                .await
                .context("failed to connect to redis")?;
            info!(redis_url = %url, "using distributed call queue");
            Ok(DistributedCallQueue::new(store))
        }
        None => Ok(memory_queue(cli)),
    }
}

#[cfg(not(feature = "redis-queue"))]
async fn build_queue(cli: &Cli) -> Result<Arc<dyn CallQueue>> {
    if cli.redis_url.is_some() {
        warn!("REDIS_URL ignored: built without the redis-queue feature");
    }
    Ok(memory_queue(cli))
}

fn memory_queue(cli: &Cli) -> Arc<dyn CallQueue> {
    info!("using in-memory call queue");
    MemoryCallQueue::new(cli.queue_config())
}
