//! Courier relay - routes commands from controllers to agents
//!
//! Accepts controller and agent sessions over WebSocket and relays commands
//! and their responses between them.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use courier_control::{DuplicateIdPolicy, RelayConfig};
use courier_server::{RelayServer, RelayServerConfig};
use courier_transport_websocket::WebSocketConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command relay between controllers and agents
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Run a command relay server", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// WebSocket listen address
    #[arg(long, env = "COURIER_LISTEN", default_value = "0.0.0.0:6857")]
    listen: SocketAddr,

    /// Only accept WebSocket upgrades on this path (e.g., /relay)
    #[arg(long, env = "COURIER_PATH")]
    path: Option<String>,

    /// Command record retention in seconds
    #[arg(long, env = "COURIER_RETENTION_SECS", default_value = "86400")]
    retention_secs: u64,

    /// How long a disconnected peer stays listed, in seconds
    #[arg(long, env = "COURIER_GRACE_SECS", default_value = "10")]
    grace_secs: u64,

    /// Retention sweep period in seconds
    #[arg(long, env = "COURIER_SWEEP_INTERVAL_SECS", default_value = "5")]
    sweep_interval_secs: u64,

    /// Time allowed for a new connection to send its handshake, in seconds
    #[arg(long, env = "COURIER_HANDSHAKE_TIMEOUT_SECS", default_value = "10")]
    handshake_timeout_secs: u64,

    /// What to do when a handshake claims an id held by a live session
    #[arg(long, env = "COURIER_DUPLICATE_IDS", value_enum, default_value_t = DuplicateIds::Replace)]
    duplicate_ids: DuplicateIds,

    /// Cap on each controller's queue of undeliverable commands
    #[arg(long, env = "COURIER_MAX_PENDING", default_value = "256")]
    max_pending: usize,

    /// WebSocket ping interval in seconds (0 disables pings)
    #[arg(long, env = "COURIER_KEEP_ALIVE_SECS", default_value = "30")]
    keep_alive_secs: u64,

    /// Maximum size of a single message in bytes
    #[arg(long, env = "COURIER_MAX_MESSAGE_SIZE", default_value = "16777216")]
    max_message_size: usize,

    /// Enable verbose logging
    #[arg(short, long, env = "COURIER_VERBOSE")]
    verbose: bool,

    /// Log output format
    #[arg(long, env = "COURIER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DuplicateIds {
    /// Newest registration wins; the older session is disconnected
    Replace,
    /// Refuse the newcomer while the existing session is live
    RejectLive,
}

impl From<DuplicateIds> for DuplicateIdPolicy {
    fn from(value: DuplicateIds) -> Self {
        match value {
            DuplicateIds::Replace => DuplicateIdPolicy::Replace,
            DuplicateIds::RejectLive => DuplicateIdPolicy::RejectLive,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn server_config(&self) -> RelayServerConfig {
        let keep_alive =
            (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs));

        let mut websocket = WebSocketConfig::default()
            .with_keep_alive(keep_alive)
            .with_max_message_size(self.max_message_size);
        if let Some(path) = &self.path {
            websocket = websocket.with_path(path.clone());
        }

        RelayServerConfig {
            listen_addr: self.listen,
            websocket,
            relay: RelayConfig {
                retention: Duration::from_secs(self.retention_secs),
                grace_period: Duration::from_secs(self.grace_secs),
                sweep_interval: Duration::from_secs(self.sweep_interval_secs),
                handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
                duplicate_ids: self.duplicate_ids.into(),
                max_pending: self.max_pending,
            },
        }
    }
}

/// Setup logging; RUST_LOG takes precedence over --verbose
fn init_logging(verbose: bool, format: LogFormat) -> Result<()> {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format).context("Failed to initialize logging")?;

    info!(
        version = env!("GIT_TAG"),
        commit = env!("GIT_HASH"),
        "Starting courier relay"
    );

    let config = cli.server_config();
    info!(
        retention_secs = config.relay.retention.as_secs(),
        grace_secs = config.relay.grace_period.as_secs(),
        duplicate_ids = ?config.relay.duplicate_ids,
        "Relay configuration"
    );

    let server = RelayServer::new(config)
        .with_context(|| format!("Failed to start relay on {}", cli.listen))?;
    server.run().await.context("Relay server failed")?;

    Ok(())
}
