//! Entry point (§4.10). Grounded on `oidc-discovery-server::run`'s shape: parse
//! `Args`, init `tracing-subscriber`, build the service, bind a listener, serve with
//! graceful shutdown.

use clap::Parser;
use reactive_collections::config::Args;
use reactive_collections::engine::ComputeEngine;
use reactive_collections::http;
use reactive_collections::service::Service;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let engine = ComputeEngine::new();
    // No resources are registered by default: the engine and the HTTP surface are
    // the product, resources are the embedder's domain-specific extension point.
    let service = Arc::new(Service::new(engine, Vec::new(), args.queue_capacity));

    if let Some(interval) = args.idle_sweep_interval() {
        let sweeper_service = service.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reclaimed = sweeper_service.sweep_idle(interval);
                if reclaimed > 0 {
                    tracing::info!(reclaimed, "idle sweep tick");
                }
            }
        });
    }

    let app = http::router(service);
    let listener = TcpListener::bind(args.socket_addr()).await?;
    tracing::info!(addr = %args.socket_addr(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    tracing::info!("shutdown signal received");
}
