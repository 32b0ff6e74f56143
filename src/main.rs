//! Portgate - TCP relay for host-gateway tunnels
//!
//! Listens on one address (by default the docker bridge gateway) and forwards
//! every connection to a fixed upstream (by default a loopback-only port such
//! as an SSH reverse tunnel).

use anyhow::{Context, Result};
use clap::Parser;
use portgate_config::RelayConfig;
use portgate_relay::RelayServer;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portgate - forward TCP connections from a listen address to a fixed upstream
#[derive(Parser, Debug, Default)]
#[command(name = "portgate")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Portgate accepts TCP connections on one address and forwards each of them,
byte for byte, to a fixed upstream address.

Typical use: containers reach the host gateway (172.17.0.1) while the real
service only listens on 127.0.0.1, e.g. behind an SSH reverse tunnel:

  laptop$ ssh -N -R 127.0.0.1:13306:127.0.0.1:3306 vm
  vm$     portgate --listen-host 172.17.0.1 --upstream-port 13306

EXAMPLES:
  # Defaults: 172.17.0.1:13306 -> 127.0.0.1:13306
  portgate

  # Forward a local PostgreSQL to the bridge, one session at a time
  portgate --listen-port 5432 --upstream-port 5432 --max-sessions 1

  # Load settings from a YAML file, override the upstream host
  portgate --config portgate.yml --upstream-host 10.0.0.5

ENVIRONMENT VARIABLES:
  LISTEN_HOST            Address to listen on
  LISTEN_PORT            Port to listen on
  UPSTREAM_HOST          Address to forward to
  UPSTREAM_PORT          Port to forward to
  PORTGATE_CONFIG        YAML configuration file
"#)]
struct Args {
    /// Address to listen on [default: 172.17.0.1]
    #[arg(long, env = "LISTEN_HOST")]
    listen_host: Option<String>,

    /// Port to listen on [default: 13306]
    #[arg(long, env = "LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Upstream address every connection is forwarded to [default: 127.0.0.1]
    #[arg(long, env = "UPSTREAM_HOST")]
    upstream_host: Option<String>,

    /// Upstream port [default: 13306]
    #[arg(long, env = "UPSTREAM_PORT")]
    upstream_port: Option<u16>,

    /// Upstream connect timeout in seconds [default: 10]
    #[arg(long, env = "CONNECT_TIMEOUT_SECS")]
    connect_timeout_secs: Option<u64>,

    /// Readiness wait interval in seconds; idle sessions are never closed [default: 60]
    #[arg(long, env = "IDLE_TICK_SECS")]
    idle_tick_secs: Option<u64>,

    /// Maximum bytes read per socket per wakeup [default: 65536]
    #[arg(long, env = "CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// Maximum concurrent sessions, 1 = strictly sequential [default: 64]
    #[arg(long, env = "MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Set TCP_NODELAY on relayed sockets [default: true]
    #[arg(long, env = "TCP_NODELAY")]
    nodelay: Option<bool>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "PORTGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level or filter (trace, debug, info, warn, error, or an EnvFilter directive)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Merge defaults, the optional config file and CLI/env args, in increasing precedence
fn build_relay_config(args: &Args) -> Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            RelayConfig::load(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?
        }
        None => RelayConfig::default(),
    };

    if let Some(host) = &args.listen_host {
        config.listen.host = host.clone();
    }
    if let Some(port) = args.listen_port {
        config.listen.port = port;
    }
    if let Some(host) = &args.upstream_host {
        config.upstream.host = host.clone();
    }
    if let Some(port) = args.upstream_port {
        config.upstream.port = port;
    }
    if let Some(secs) = args.connect_timeout_secs {
        config.connect_timeout_secs = secs;
    }
    if let Some(secs) = args.idle_tick_secs {
        config.idle_tick_secs = secs;
    }
    if let Some(size) = args.chunk_size {
        config.chunk_size = size;
    }
    if let Some(max) = args.max_sessions {
        config.max_sessions = max;
    }
    if let Some(nodelay) = args.nodelay {
        config.nodelay = nodelay;
    }

    config.validate().context("Invalid relay configuration")?;
    Ok(config)
}

/// Bind the listen endpoint; failure here is fatal and ends the process
async fn bind_relay(config: &RelayConfig) -> Result<RelayServer> {
    RelayServer::bind(config)
        .await
        .with_context(|| format!("Failed to start TCP relay on {}", config.listen))
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Portgate starting...");

    let config = build_relay_config(&args).context("Failed to build relay configuration")?;

    info!("Listen: {}", config.listen);
    info!("Upstream: {}", config.upstream);
    info!(
        "Max sessions: {}, idle tick: {}s, connect timeout: {}s",
        config.max_sessions, config.idle_tick_secs, config.connect_timeout_secs
    );

    let server = bind_relay(&config).await?;

    server.run_until(shutdown_signal()).await?;

    info!("Portgate stopped");
    Ok(())
}
