use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kiln_core::{spawn_watchdog, ModelLayout, SdxlLoader, Service};
use kiln_server::{config::Args, router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    tracing::info!(root = %args.model_root.display(), "using model root");

    let loader = SdxlLoader::new(args.device_map());
    let service = Arc::new(Service::new(
        loader,
        ModelLayout::new(&args.model_root),
        args.idle_policy(),
    ));
    if !args.no_preload {
        service
            .preload(&args.default_model)
            .await
            .with_context(|| format!("failed to preload {}", args.default_model))?;
    }

    // --- Shutdown on ctrl-c or idle timeout ---
    let shutdown = CancellationToken::new();
    let watchdog = spawn_watchdog(
        service.clock().clone(),
        service.idle_policy(),
        shutdown.clone(),
    );
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("received ctrl-c, shutting down");
            shutdown.cancel();
        }
    });

    // --- Start the server ---
    let app = router(service);
    let listener = TcpListener::bind(args.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", args.bind_address()))?;
    tracing::info!(address = %listener.local_addr()?, "started server");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    watchdog.await.context("watchdog task failed")?;
    tracing::info!("server stopped");
    Ok(())
}
