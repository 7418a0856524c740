//! Spyglass Proxy - Entry Point
//!
//! Starts the proxy server with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod ca;
mod config;
mod error;
mod models;
mod proxy;
mod session;

use ca::CertificateAuthority;
use config::{Config, LogConfig, ProxyMode};
use models::RequestRecord;
use proxy::ProxyServer;

#[tokio::main]
async fn main() -> error::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log);
    info!("Starting Spyglass proxy");

    // In MITM mode the certificate authority must exist before the first
    // tunnel arrives; clients install its root certificate to trust the
    // forged identities.
    let ca = match config.proxy.mode {
        ProxyMode::Mitm => {
            let ca = CertificateAuthority::load_or_generate(&config.proxy.ca_dir).await?;
            info!(
                "Root CA certificate at {} (install it in client trust stores)",
                ca.ca_cert_path().display()
            );
            Some(Arc::new(ca))
        }
        ProxyMode::Normal => None,
    };

    // Create record broadcast channel (bounded to prevent memory leaks)
    let (record_sender, _) = broadcast::channel::<RequestRecord>(1024);

    // Create proxy server
    let server = ProxyServer::new(config.proxy.clone(), ca, Some(record_sender))?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!(
        "Proxy started - {}:{} ({} mode)",
        config.proxy.host, config.proxy.port, config.proxy.mode
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(server_task);

    info!("Spyglass stopped");
    Ok(())
}

/// Install the tracing subscriber from the logging configuration
fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("spyglass={}", log.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
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
