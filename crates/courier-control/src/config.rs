//! Relay configuration

use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("{field} must not exceed {max_secs} seconds")]
    WindowTooLarge { field: &'static str, max_secs: u64 },

    #[error("max_pending must be greater than zero")]
    ZeroPendingCapacity,
}

/// Upper bound for every configured window (ten years)
pub const MAX_WINDOW: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// What to do when a handshake asks for an id that a live session holds
///
/// A record whose session already ended (in its grace window) can always be
/// resumed; this only matters while the previous channel is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateIdPolicy {
    /// Last writer wins: the older session is told to disconnect and closed
    #[default]
    Replace,
    /// Refuse the newcomer and keep the live session
    RejectLive,
}

/// Tunables for the registry, router and sweeper
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Command records older than this are removed regardless of response status
    pub retention: Duration,
    /// How long a disconnected peer stays registered before it is purged
    pub grace_period: Duration,
    /// Period of the background sweeper
    pub sweep_interval: Duration,
    /// How long a new connection may take to send its handshake frame
    pub handshake_timeout: Duration,
    pub duplicate_ids: DuplicateIdPolicy,
    /// Cap on each controller's queue of undeliverable commands
    pub max_pending: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            grace_period: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            duplicate_ids: DuplicateIdPolicy::Replace,
            max_pending: 256,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention.is_zero() {
            return Err(ConfigError::ZeroDuration("retention"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("sweep_interval"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("handshake_timeout"));
        }
        if self.max_pending == 0 {
            return Err(ConfigError::ZeroPendingCapacity);
        }

        for (field, window) in [
            ("retention", self.retention),
            ("grace_period", self.grace_period),
            ("sweep_interval", self.sweep_interval),
            ("handshake_timeout", self.handshake_timeout),
        ] {
            if window > MAX_WINDOW {
                return Err(ConfigError::WindowTooLarge {
                    field,
                    max_secs: MAX_WINDOW.as_secs(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn retention_window(&self) -> chrono::Duration {
        to_chrono(self.retention)
    }

    pub(crate) fn grace_window(&self) -> chrono::Duration {
        to_chrono(self.grace_period)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.min(MAX_WINDOW)).unwrap_or(chrono::Duration::MAX)
}
