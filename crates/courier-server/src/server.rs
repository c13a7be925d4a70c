//! Relay server implementation

use courier_control::{ConfigError, RelayConfig, RelayHandler};
use courier_proto::DEFAULT_PORT;
use courier_transport::{TransportError, TransportListener};
use courier_transport_websocket::{WebSocketConfig, WebSocketListener};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Listen address for the WebSocket server
    pub listen_addr: SocketAddr,
    pub websocket: WebSocketConfig,
    pub relay: RelayConfig,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            websocket: WebSocketConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// Relay server
pub struct RelayServer {
    listener: WebSocketListener,
    handler: RelayHandler,
}

impl RelayServer {
    /// Validate the configuration and bind the listener
    pub fn new(config: RelayServerConfig) -> Result<Self, ServerError> {
        config.relay.validate()?;

        let listener = WebSocketListener::new(config.listen_addr, Arc::new(config.websocket))?;
        let handler = RelayHandler::new(config.relay);

        Ok(Self { listener, handler })
    }

    /// Address the listener is actually bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handler(&self) -> &RelayHandler {
        &self.handler
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!("Relay listening on {}", self.local_addr()?);

        let sweeper = self.handler.sweeper().spawn();
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (connection, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Listener stopped accepting: {}", e);
                            break;
                        }
                    };

                    debug!("Accepted connection from {}", remote_addr);
                    let handler = self.handler.clone();
                    sessions.spawn(async move {
                        // Failures are already logged by the handler
                        let _ = handler.handle_connection(Arc::new(connection)).await;
                    });
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Session task panicked: {}", e);
                        }
                    }
                }
            }
        }

        info!("Shutting down relay ({} active sessions)", sessions.len());

        self.listener.close().await;
        sweeper.abort();
        self.handler.close_all("relay shutting down").await;
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}

        info!("Relay stopped");
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM (ctrl-c elsewhere)
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers, falling back to ctrl-c: {}", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received ctrl-c");
}
