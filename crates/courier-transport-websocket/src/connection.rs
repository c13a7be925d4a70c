//! WebSocket connection implementation

use async_trait::async_trait;
use courier_proto::{CodecError, Frame, FrameCodec};
use courier_transport::{ConnectionStats, TransportConnection, TransportError, TransportResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, trace};

use crate::config::{WebSocketConfig, MAX_INTERVAL};

pub(crate) type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Shared between the connection and its writer task
struct Shared {
    closed: AtomicBool,
    close_notify: Notify,
    bytes_sent: AtomicU64,
}

impl Shared {
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }
}

/// A relay session carried over one WebSocket
pub struct WebSocketConnection {
    /// Connection ID for logging
    connection_id: String,
    /// Remote address
    remote_addr: SocketAddr,
    codec: FrameCodec,
    /// Channel for sending messages to the writer task
    frame_tx: mpsc::Sender<Message>,
    /// Read half; only one receiver at a time
    source: Mutex<SplitStream<WsStream>>,
    shared: Arc<Shared>,
    /// Connection created timestamp
    created_at: Instant,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl WebSocketConnection {
    /// Wrap an established WebSocket stream and spawn its writer task
    pub(crate) fn new(
        ws_stream: WsStream,
        remote_addr: SocketAddr,
        config: &WebSocketConfig,
    ) -> Self {
        let connection_id = format!("ws-{}", uuid::Uuid::new_v4());

        let (ws_sink, ws_source) = ws_stream.split();
        let (frame_tx, frame_rx) = mpsc::channel::<Message>(config.send_queue);

        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            bytes_sent: AtomicU64::new(0),
        });

        let writer_shared = shared.clone();
        let keep_alive = config.keep_alive_interval;
        let conn_id = connection_id.clone();
        tokio::spawn(async move {
            Self::writer_task(ws_sink, frame_rx, keep_alive, writer_shared, conn_id).await;
        });

        Self {
            connection_id,
            remote_addr,
            codec: config.codec(),
            frame_tx,
            source: Mutex::new(ws_source),
            shared,
            created_at: Instant::now(),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Writer task - drains the outbound queue and sends keep-alive pings
    async fn writer_task(
        mut sink: SplitSink<WsStream, Message>,
        mut rx: mpsc::Receiver<Message>,
        keep_alive: Option<Duration>,
        shared: Arc<Shared>,
        conn_id: String,
    ) {
        // A disabled keep-alive still needs a timer to select on
        let period = keep_alive.unwrap_or(MAX_INTERVAL).min(MAX_INTERVAL);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    let is_close = matches!(message, Message::Close(_));
                    let len = message.len() as u64;

                    if let Err(e) = sink.send(message).await {
                        error!("[{}] WebSocket send error: {}", conn_id, e);
                        break;
                    }
                    shared.bytes_sent.fetch_add(len, Ordering::Relaxed);

                    if is_close {
                        break;
                    }
                }
                _ = ticker.tick(), if keep_alive.is_some() => {
                    trace!("[{}] Sending keep-alive ping", conn_id);
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        debug!("[{}] Keep-alive ping failed: {}", conn_id, e);
                        break;
                    }
                }
            }
        }

        debug!("[{}] WebSocket writer task ended", conn_id);
        shared.mark_closed();
        let _ = sink.close().await;
    }

    fn decode(&self, result: Result<Frame, CodecError>) -> TransportResult<Option<Frame>> {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        result.map(Some).map_err(TransportError::from)
    }
}

fn map_read_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Capacity(e) => TransportError::ProtocolError(e.to_string()),
        tungstenite::Error::Protocol(e) => TransportError::ProtocolError(e.to_string()),
        tungstenite::Error::Io(e) => TransportError::IoError(e),
        other => TransportError::ConnectionError(other.to_string()),
    }
}

#[async_trait]
impl TransportConnection for WebSocketConnection {
    async fn send_frame(&self, frame: &Frame) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let text = self.codec.encode(frame)?;
        self.frame_tx
            .send(Message::Text(text))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        trace!("[{}] Queued {} frame", self.connection_id, frame.name());
        Ok(())
    }

    async fn recv_frame(&self) -> TransportResult<Option<Frame>> {
        let notified = self.shared.close_notify.notified();
        tokio::pin!(notified);

        if self.is_closed() {
            return Ok(None);
        }

        let mut source = self.source.lock().await;

        loop {
            let next = tokio::select! {
                _ = &mut notified => return Ok(None),
                next = source.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    self.bytes_received
                        .fetch_add(text.len() as u64, Ordering::Relaxed);
                    return self.decode(self.codec.decode(&text));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.bytes_received
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    return self.decode(self.codec.decode_bytes(&data));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pong replies are queued by tungstenite itself
                    trace!("[{}] Control frame received", self.connection_id);
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!("[{}] WebSocket closed by peer", self.connection_id);
                    self.shared.mark_closed();
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.shared.mark_closed();
                    return Err(map_read_error(e));
                }
            }
        }
    }

    async fn close(&self, reason: &str) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("[{}] Closing connection: {}", self.connection_id, reason);
        // The writer may already be gone; nothing left to flush then
        let _ = self.frame_tx.try_send(Message::Close(None));
        self.shared.close_notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}
