//! Encrypted mirror daemon
//!
//! Watches a source directory, keeps an encrypted copy of every file in a
//! destination directory, and serves the decrypted content over HTTP to
//! anyone holding the per-file key.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mirror_core::MetadataStore;
use mirror_daemon::{Args, AppState, mirror, server};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json, args.verbose);

    let config = args.into_config()?;
    info!(
        "Mirroring {:?} into {:?}",
        config.source, config.destination
    );

    let store = Arc::new(MetadataStore::new());
    let cancel = CancellationToken::new();

    let mirror = mirror::start(&config, Arc::clone(&store), cancel.clone()).await?;

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    let state = AppState::new(store, config.destination.clone());
    let server = tokio::spawn(server::serve(
        listener,
        state,
        cancel.clone(),
        config.shutdown_grace,
    ));

    shutdown_signal().await;
    cancel.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server error: {:#}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }
    mirror.join().await;

    info!("Mirror daemon shut down");
    Ok(())
}

fn init_tracing(json: bool, verbose: bool) {
    let default_filter = if verbose {
        "debug,mirror_daemon=debug"
    } else {
        "info,mirror_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
