//! In-process transport
//!
//! [`MemoryConnection::pair`] returns two connected ends. Frames still pass
//! through the JSON codec so that decoding faults behave exactly as they do
//! on a socket.

use crate::{ConnectionStats, TransportConnection, TransportError, TransportResult};
use async_trait::async_trait;
use courier_proto::{Frame, FrameCodec};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace};

static NEXT_PORT: AtomicU16 = AtomicU16::new(1);

/// One end of an in-process duplex channel
pub struct MemoryConnection {
    connection_id: String,
    remote_addr: SocketAddr,
    codec: FrameCodec,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    /// Set when this end closes
    closed: Arc<AtomicBool>,
    /// Shared with the other end's `closed`
    remote_closed: Arc<AtomicBool>,
    close_notify: Notify,
    created_at: Instant,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl MemoryConnection {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        Self::pair_with_codec(FrameCodec::new())
    }

    pub fn pair_with_codec(codec: FrameCodec) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let a_closed = Arc::new(AtomicBool::new(false));
        let b_closed = Arc::new(AtomicBool::new(false));

        let a_port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let b_port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);

        let a = Self::new(
            SocketAddr::from(([127, 0, 0, 1], b_port)),
            codec,
            a_tx,
            a_rx,
            a_closed.clone(),
            b_closed.clone(),
        );
        let b = Self::new(
            SocketAddr::from(([127, 0, 0, 1], a_port)),
            codec,
            b_tx,
            b_rx,
            b_closed,
            a_closed,
        );

        (a, b)
    }

    fn new(
        remote_addr: SocketAddr,
        codec: FrameCodec,
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
        closed: Arc<AtomicBool>,
        remote_closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection_id: format!("mem-{}", uuid::Uuid::new_v4()),
            remote_addr,
            codec,
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(inbound),
            closed,
            remote_closed,
            close_notify: Notify::new(),
            created_at: Instant::now(),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Send text that bypasses the encoder, e.g. a malformed frame
    pub async fn send_raw(&self, text: &str) -> TransportResult<()> {
        self.push(text.to_string()).await
    }

    async fn push(&self, text: String) -> TransportResult<()> {
        if self.is_closed() || self.remote_closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let len = text.len() as u64;
        let outbound = self.outbound.lock().await;
        match outbound.as_ref() {
            Some(tx) => tx
                .send(text)
                .map_err(|_| TransportError::ConnectionClosed)?,
            None => return Err(TransportError::ConnectionClosed),
        }

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn send_frame(&self, frame: &Frame) -> TransportResult<()> {
        let text = self.codec.encode(frame)?;
        self.push(text).await?;
        trace!("[{}] Sent {} frame", self.connection_id, frame.name());
        Ok(())
    }

    async fn recv_frame(&self) -> TransportResult<Option<Frame>> {
        let notified = self.close_notify.notified();
        if self.is_closed() {
            return Ok(None);
        }

        let mut inbound = self.inbound.lock().await;
        let text = tokio::select! {
            _ = notified => return Ok(None),
            text = inbound.recv() => text,
        };

        match text {
            Some(text) => {
                self.frames_received.fetch_add(1, Ordering::Relaxed);
                self.bytes_received
                    .fetch_add(text.len() as u64, Ordering::Relaxed);
                let frame = self.codec.decode(&text)?;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[{}] Closing connection: {}", self.connection_id, reason);
        self.outbound.lock().await.take();
        self.close_notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_proto::Handshake;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = MemoryConnection::pair();

        a.send_frame(&Frame::Ping { timestamp: 1 }).await.unwrap();
        a.send_frame(&Frame::Ping { timestamp: 2 }).await.unwrap();

        assert_eq!(
            b.recv_frame().await.unwrap(),
            Some(Frame::Ping { timestamp: 1 })
        );
        assert_eq!(
            b.recv_frame().await.unwrap(),
            Some(Frame::Ping { timestamp: 2 })
        );
        assert_eq!(a.stats().frames_sent, 2);
        assert_eq!(b.stats().frames_received, 2);
    }

    #[tokio::test]
    async fn test_close_ends_remote_receive() {
        let (a, b) = MemoryConnection::pair();

        a.send_frame(&Frame::Handshake(Handshake::controller()))
            .await
            .unwrap();
        a.close("done").await;

        // Buffered frames are still delivered before the close is observed
        assert!(matches!(
            b.recv_frame().await.unwrap(),
            Some(Frame::Handshake(_))
        ));
        assert_eq!(b.recv_frame().await.unwrap(), None);

        let err = b.send_frame(&Frame::Ping { timestamp: 0 }).await;
        assert!(matches!(err, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_local_close_wakes_pending_receive() {
        let (a, _b) = MemoryConnection::pair();
        let a = Arc::new(a);

        let receiver = a.clone();
        let handle = tokio::spawn(async move { receiver.recv_frame().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close("superseded").await;

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("receive should wake on close")
            .unwrap();
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_text_is_protocol_error() {
        let (a, b) = MemoryConnection::pair();

        a.send_raw("{not json").await.unwrap();

        let err = b.recv_frame().await.unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_connection_ids_are_distinct() {
        let (a, b) = MemoryConnection::pair();
        assert_ne!(a.connection_id(), b.connection_id());
        assert_ne!(a.remote_address(), b.remote_address());
    }
}
