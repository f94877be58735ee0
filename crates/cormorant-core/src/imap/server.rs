//! IMAP Server
//!
//! Accepts TCP connections and runs one [`ImapHandler`] per connection.

use super::handler::{ImapHandler, SessionConfig};
use super::response::ImapResponse;
use crate::tls::create_tls_acceptor;

use anyhow::Result;
use cormorant_common::config::{Config, ImapConfig};
use cormorant_storage::Backend;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// IMAP Server
pub struct ImapServer {
    config: Arc<SessionConfig>,
    bind: String,
    backend: Arc<dyn Backend>,
    tls_acceptor: Option<TlsAcceptor>,
    max_connections: usize,
    connection_semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl ImapServer {
    /// Create a new IMAP server
    pub fn new(
        config: &ImapConfig,
        hostname: &str,
        backend: Arc<dyn Backend>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        let max_connections = config.max_connections.max(1);
        Self {
            config: Arc::new(SessionConfig::from_config(config, hostname)),
            bind: config.bind.clone(),
            backend,
            tls_acceptor,
            max_connections,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a new IMAP server with full config (includes TLS settings)
    pub fn with_config(full_config: &Config, backend: Arc<dyn Backend>) -> Self {
        let tls_acceptor = if let Some(ref tls_config) = full_config.tls {
            match create_tls_acceptor(tls_config) {
                Ok(acceptor) => {
                    info!("TLS configured successfully");
                    Some(acceptor)
                }
                Err(e) => {
                    warn!("Failed to initialize TLS: {}. STARTTLS will be disabled.", e);
                    None
                }
            }
        } else {
            None
        };

        if tls_acceptor.is_none() && !full_config.imap.allow_insecure_auth {
            warn!("No TLS and insecure auth disabled: clients will not be able to log in");
        }

        Self::new(
            &full_config.imap,
            &full_config.server.hostname,
            backend,
            tls_acceptor,
        )
    }

    /// Token cancelled by [`ImapServer::shutdown`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting connections and close every session with BYE
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Start the IMAP server
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let tls_status = if self.tls_acceptor.is_some() {
            "STARTTLS enabled"
        } else {
            "STARTTLS disabled"
        };
        info!("IMAP server listening on {} ({})", listener.local_addr()?, tls_status);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Max connections reached, rejecting {}", peer_addr);
                            tokio::spawn(reject(stream));
                            continue;
                        }
                    };

                    let handler = ImapHandler::new(
                        stream,
                        self.backend.clone(),
                        self.config.clone(),
                        self.tls_acceptor.clone(),
                        self.shutdown.child_token(),
                        peer_addr.to_string(),
                    );

                    tokio::spawn(async move {
                        if let Err(e) = handler.handle().await {
                            error!("IMAP session error from {}: {}", peer_addr, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("IMAP server stopped accepting connections");

        // Every session holds a permit until it has said BYE
        let total = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        if let Ok(permits) = self.connection_semaphore.acquire_many(total).await {
            drop(permits);
        }
        info!("All IMAP sessions closed");
        Ok(())
    }
}

async fn reject(mut stream: TcpStream) {
    let bye = ImapResponse::bye("Too many connections");
    if stream.write_all(bye.as_bytes()).await.is_ok() {
        let _ = stream.shutdown().await;
    }
}
