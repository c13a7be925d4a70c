//! WebSocket listener and connector implementations

use async_trait::async_trait;
use courier_transport::{TransportConnector, TransportError, TransportListener, TransportResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WebSocketConfig;
use crate::connection::WebSocketConnection;

type Accepted = (WebSocketConnection, SocketAddr);

/// WebSocket listener for accepting incoming connections
///
/// TCP accepts run on a background task and every upgrade runs on its own
/// task, so a peer that stalls mid-upgrade never holds up the others.
pub struct WebSocketListener {
    local_addr: SocketAddr,
    accept_rx: Mutex<mpsc::Receiver<Accepted>>,
    accept_task: JoinHandle<()>,
}

impl std::fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl WebSocketListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;

        // Create TCP listener synchronously using std
        let std_listener = std::net::TcpListener::bind(bind_addr).map_err(|e| {
            TransportError::BindError {
                address: bind_addr.ip().to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        std_listener.set_nonblocking(true).map_err(|e| {
            TransportError::ConfigurationError(format!("Failed to set nonblocking: {}", e))
        })?;

        let tcp_listener = TcpListener::from_std(std_listener).map_err(TransportError::IoError)?;
        let local_addr = tcp_listener.local_addr().map_err(TransportError::IoError)?;

        info!(
            "WebSocket listener bound to ws://{}{}",
            local_addr,
            config.request_path()
        );

        let (accept_tx, accept_rx) = mpsc::channel(64);
        let accept_task = tokio::spawn(Self::accept_loop(tcp_listener, config, accept_tx));

        Ok(Self {
            local_addr,
            accept_rx: Mutex::new(accept_rx),
            accept_task,
        })
    }

    async fn accept_loop(
        tcp_listener: TcpListener,
        config: Arc<WebSocketConfig>,
        accept_tx: mpsc::Sender<Accepted>,
    ) {
        loop {
            let (tcp_stream, remote_addr) = match tcp_listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning
                    warn!("Failed to accept TCP connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if accept_tx.is_closed() {
                break;
            }

            debug!("Incoming TCP connection from {}", remote_addr);
            let _ = tcp_stream.set_nodelay(true);

            let config = config.clone();
            let accept_tx = accept_tx.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(
                    config.upgrade_timeout,
                    Self::upgrade(tcp_stream, &config),
                )
                .await
                {
                    Ok(Ok(ws_stream)) => {
                        info!("WebSocket connection established from {}", remote_addr);
                        let connection = WebSocketConnection::new(ws_stream, remote_addr, &config);
                        if accept_tx.send((connection, remote_addr)).await.is_err() {
                            debug!("Listener closed, dropping connection from {}", remote_addr);
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("WebSocket handshake failed from {}: {}", remote_addr, e);
                    }
                    Err(_) => {
                        warn!("WebSocket handshake timed out from {}", remote_addr);
                    }
                }
            });
        }
    }

    /// Perform the WebSocket upgrade with path validation
    async fn upgrade(
        tcp_stream: TcpStream,
        config: &WebSocketConfig,
    ) -> Result<crate::connection::WsStream, tokio_tungstenite::tungstenite::Error> {
        let callback = |req: &Request, response: Response| {
            if config.accepts_path(req.uri().path()) {
                Ok(response)
            } else {
                let mut rejection = ErrorResponse::new(None);
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        };

        tokio_tungstenite::accept_hdr_async_with_config(
            tcp_stream,
            callback,
            Some(config.tungstenite_config()),
        )
        .await
    }
}

#[async_trait]
impl TransportListener for WebSocketListener {
    type Connection = WebSocketConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        let mut accept_rx = self.accept_rx.lock().await;
        accept_rx
            .recv()
            .await
            .ok_or_else(|| TransportError::ConnectionError("Listener closed".to_string()))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn close(&self) {
        info!("WebSocket listener closed");
        self.accept_task.abort();
        self.accept_rx.lock().await.close();
    }
}

impl Drop for WebSocketListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// WebSocket connector for establishing outgoing connections
pub struct WebSocketConnector {
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector").finish()
    }
}

impl WebSocketConnector {
    pub fn new(config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;
        debug!("WebSocket connector created");
        Ok(Self { config })
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    type Connection = WebSocketConnection;

    async fn connect(&self, addr: SocketAddr) -> TransportResult<Self::Connection> {
        let ws_url = Url::parse(&format!("ws://{}{}", addr, self.config.request_path()))
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL: {}", e)))?;

        debug!("Connecting to WebSocket server: {}", ws_url);

        let tcp_stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        let _ = tcp_stream.set_nodelay(true);

        let (ws_stream, _response) = tokio_tungstenite::client_async_with_config(
            ws_url.as_str(),
            tcp_stream,
            Some(self.config.tungstenite_config()),
        )
        .await
        .map_err(|e| {
            TransportError::ConnectionError(format!("WebSocket handshake failed: {}", e))
        })?;

        info!("WebSocket connection established to {}", ws_url);

        Ok(WebSocketConnection::new(ws_stream, addr, &self.config))
    }
}
