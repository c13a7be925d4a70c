//! WebSocket transport configuration

use courier_proto::{FrameCodec, MAX_FRAME_SIZE};
use courier_transport::{TransportError, TransportResult};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as TungsteniteConfig;

/// Longest accepted keep-alive or upgrade timeout (one day)
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Only accept upgrades on this path (e.g., "/relay"); `None` accepts any path
    pub path: Option<String>,

    /// Keep-alive interval (ping frames); `None` disables pings
    pub keep_alive_interval: Option<Duration>,

    /// Maximum time a peer may take to complete the WebSocket upgrade
    pub upgrade_timeout: Duration,

    /// Maximum message size
    pub max_message_size: usize,

    /// Outbound queue depth per connection
    pub send_queue: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: None,
            keep_alive_interval: Some(Duration::from_secs(30)),
            upgrade_timeout: Duration::from_secs(10),
            max_message_size: MAX_FRAME_SIZE,
            send_queue: 256,
        }
    }
}

impl WebSocketConfig {
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> TransportResult<()> {
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(TransportError::ConfigurationError(format!(
                    "WebSocket path must start with '/': {}",
                    path
                )));
            }
        }

        if self.max_message_size == 0 {
            return Err(TransportError::ConfigurationError(
                "max_message_size must be greater than zero".to_string(),
            ));
        }

        if self.send_queue == 0 {
            return Err(TransportError::ConfigurationError(
                "send_queue must be greater than zero".to_string(),
            ));
        }

        if self.keep_alive_interval == Some(Duration::ZERO) {
            return Err(TransportError::ConfigurationError(
                "keep_alive_interval must be greater than zero".to_string(),
            ));
        }

        if self.keep_alive_interval.is_some_and(|interval| interval > MAX_INTERVAL) {
            return Err(TransportError::ConfigurationError(format!(
                "keep_alive_interval must not exceed {} seconds",
                MAX_INTERVAL.as_secs()
            )));
        }

        if self.upgrade_timeout > MAX_INTERVAL {
            return Err(TransportError::ConfigurationError(format!(
                "upgrade_timeout must not exceed {} seconds",
                MAX_INTERVAL.as_secs()
            )));
        }

        Ok(())
    }

    /// Whether an upgrade request for `request_path` should be accepted
    pub fn accepts_path(&self, request_path: &str) -> bool {
        match &self.path {
            None => true,
            Some(path) => {
                let expected = path.trim_end_matches('/');
                let requested = request_path.trim_end_matches('/');
                expected == requested
            }
        }
    }

    /// Path used by the connector when building the request URL
    pub fn request_path(&self) -> &str {
        self.path.as_deref().unwrap_or("/")
    }

    pub(crate) fn codec(&self) -> FrameCodec {
        FrameCodec::with_max_frame_size(self.max_message_size)
    }

    pub(crate) fn tungstenite_config(&self) -> TungsteniteConfig {
        let mut config = TungsteniteConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}
