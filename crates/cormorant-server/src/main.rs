//! Cormorant - IMAP server entry point

use anyhow::Result;
use cormorant_common::config::{Config, LoggingConfig};
use cormorant_core::ImapServer;
use cormorant_storage::MemoryBackend;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Cormorant IMAP server...");

    // Initialize the message store
    let backend = Arc::new(MemoryBackend::from_config(&config.backend));
    info!(
        provisioning = ?config.backend.provisioning,
        users = config.backend.seed_users.len(),
        "In-memory store ready"
    );

    let imap_server = Arc::new(ImapServer::with_config(&config, backend));
    info!("Starting IMAP server on {}", config.imap.bind);

    let mut imap_handle = {
        let imap_server = imap_server.clone();
        tokio::spawn(async move { imap_server.run().await })
    };

    // Wait for shutdown signal or a listener failure
    tokio::select! {
        result = &mut imap_handle => {
            match result {
                Ok(Ok(())) => info!("IMAP server stopped"),
                Ok(Err(e)) => error!("IMAP server error: {}", e),
                Err(e) => error!("IMAP task panicked: {}", e),
            }
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
    }

    imap_server.shutdown();
    match imap_handle.await {
        Ok(Err(e)) => error!("IMAP server error during shutdown: {}", e),
        Err(e) => error!("IMAP task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Cormorant shutdown complete");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},cormorant=debug", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
