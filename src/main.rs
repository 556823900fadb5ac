//! Hyperion Relay - TCP relay between clients and a fixed gateway
//!
//! Accepts client connections on the configured endpoint and relays each one
//! to the gateway until either side closes.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{LogLevel, RelayConfig, DEFAULT_CONFIG_FILE};
use hyperion_server_tcp::{GatewayTarget, RelayServer, RelayServerConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit status for an unusable bind address
const EXIT_INVALID_BIND_ADDRESS: i32 = 3;

/// Hyperion Relay - relay client connections to a gateway
#[derive(Parser, Debug)]
#[command(name = "hyperion-relay")]
#[command(about = "Relay client TCP connections to a fixed gateway", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Configuration file (written with defaults if missing)
    #[arg(short, long, env = "HYPERION_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Address to listen on (overrides the configuration file)
    #[arg(long, env = "HYPERION_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// Port to listen on (overrides the configuration file)
    #[arg(long, env = "HYPERION_BIND_PORT")]
    bind_port: Option<u16>,

    /// Maximum simultaneous client connections
    #[arg(long, env = "HYPERION_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Gateway host (IP address or DNS name)
    #[arg(long, env = "HYPERION_GATEWAY_HOST")]
    gateway_host: Option<String>,

    /// Gateway port
    #[arg(long, env = "HYPERION_GATEWAY_PORT")]
    gateway_port: Option<u16>,

    /// Gateway connect timeout in seconds
    #[arg(long, env = "HYPERION_CONNECT_TIMEOUT")]
    connect_timeout: Option<u64>,

    /// Log level (RUST_LOG takes precedence when set)
    #[arg(long, env = "HYPERION_LOG_LEVEL", value_enum)]
    log_level: Option<LogLevel>,

    /// Enable verbose logging (same as --log-level debug)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut RelayConfig) {
        if let Some(ref address) = self.bind_address {
            config.bind_address = address.clone();
        }
        if let Some(port) = self.bind_port {
            config.bind_port = port as i64;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = i64::try_from(max).unwrap_or(i64::MAX);
        }
        if let Some(ref host) = self.gateway_host {
            config.gateway_host = host.clone();
        }
        if let Some(port) = self.gateway_port {
            config.gateway_port = port;
        }
        if let Some(secs) = self.connect_timeout {
            config.connect_timeout_secs = secs;
        }
        if let Some(level) = self.log_level {
            config.log_level = level.to_string();
        }
        if self.verbose {
            config.log_level = LogLevel::Debug.to_string();
        }
    }
}

/// Setup logging with the specified log level
fn setup_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RelayConfig::load_or_create(&cli.config)
        .context("Failed to obtain relay configuration")?;
    cli.apply_overrides(&mut config);
    let fixes = config.validate();

    setup_logging(config.level());

    info!(
        "Hyperion Relay {} (commit {}, built {})",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );
    info!("Configuration: {:?}", cli.config);
    for fix in &fixes {
        warn!("Configuration adjusted: {}", fix);
    }

    let ip: IpAddr = match config.bind_address.trim().parse() {
        Ok(ip) => ip,
        Err(_) => {
            error!("Invalid bind address supplied: {}", config.bind_address);
            std::process::exit(EXIT_INVALID_BIND_ADDRESS);
        }
    };
    let bind_addr = SocketAddr::new(ip, config.port());

    let mut gateway = GatewayTarget::new(config.gateway_host.clone(), config.gateway_port);
    gateway.connect_timeout = config.connect_timeout();

    let mut server_config = RelayServerConfig::new(bind_addr, gateway);
    server_config.max_connections = config.connection_limit();

    info!("Bind address: {}", bind_addr);
    info!(
        "Gateway: {}:{} (connect timeout {}s)",
        config.gateway_host, config.gateway_port, config.connect_timeout_secs
    );
    info!("Max connections: {}", server_config.max_connections);
    info!("Log level: {}", config.level());

    let server = Arc::new(RelayServer::new(server_config));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            server.request_shutdown().await;
        }
        result = server.start() => {
            if let Err(e) = result {
                error!("Relay server error: {}", e);
                return Err(e.into());
            }
        }
    }

    info!("Hyperion Relay stopped");
    Ok(())
}
