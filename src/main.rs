use anyhow::Context;
use clap::Parser;
use spatial_overlay::config::NodeConfig;
use spatial_overlay::overlay::service::OverlayService;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = NodeConfig::parse();
    config.validate()?;

    tracing::info!(
        "Starting {}-dimensional node on {}",
        config.dims,
        config.listen_address()
    );
    match config.remote_address() {
        Some(remote) => tracing::info!("Entry point: {}", remote),
        None => tracing::info!("No entry point given, starting a new overlay"),
    }

    let (service, listener) = OverlayService::start(&config)
        .await
        .context("failed to start overlay node")?;
    tracing::info!("Node {:?} ready on {}", service.id().await.0, service.address());

    let server = tokio::spawn(service.clone().serve(listener));

    let signals = service.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown requested, leaving the overlay");
        signals.leave().await;
    });

    server.await.context("server task failed")?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Unable to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
