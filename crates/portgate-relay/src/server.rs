//! Relay server: the accept loop
//!
//! Listens on the configured address, pairs every accepted client with a new
//! upstream connection and hands the pair to the pump. Session failures are
//! logged and never stop the loop; only binding can fail fatally.

use portgate_config::{Endpoint, RelayConfig, LISTEN_BACKLOG};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::connector::{TcpConnector, UpstreamConnector};
use crate::error::RelayError;
use crate::metrics::{RelayMetrics, SessionIdGenerator};
use crate::pair::ConnectionPair;
use crate::pump::{pump, PumpOptions};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum sessions pumped at once; 1 serves pairs strictly one after another
    pub max_sessions: usize,
    pub pump: PumpOptions,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: portgate_config::DEFAULT_MAX_SESSIONS,
            pump: PumpOptions::default(),
        }
    }
}

impl From<&RelayConfig> for RelayServerConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_sessions: config.max_sessions,
            pump: PumpOptions::from(config),
        }
    }
}

/// TCP relay server
pub struct RelayServer<C = TcpConnector> {
    listener: TcpListener,
    connector: Arc<C>,
    config: RelayServerConfig,
    sessions: Arc<Semaphore>,
    session_ids: SessionIdGenerator,
    metrics: Arc<RelayMetrics>,
}

impl RelayServer<TcpConnector> {
    /// Bind the listen endpoint and connect sessions to the configured upstream.
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let listener = bind_listener(&config.listen).await?;
        Ok(Self::new(
            listener,
            TcpConnector::from_config(config),
            RelayServerConfig::from(config),
        ))
    }
}

impl<C: UpstreamConnector> RelayServer<C> {
    /// Build a server around an already-bound listener
    pub fn new(listener: TcpListener, connector: C, config: RelayServerConfig) -> Self {
        let max_sessions = config.max_sessions.max(1);
        Self {
            listener,
            connector: Arc::new(connector),
            config,
            sessions: Arc::new(Semaphore::new(max_sessions)),
            session_ids: SessionIdGenerator::new(),
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        self.metrics.clone()
    }

    /// Accept connections forever
    pub async fn run(self) -> Result<(), RelayError> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// A session permit is taken before each accept, so no more than
    /// `max_sessions` pairs are ever pumped at once. Sessions already running
    /// when shutdown fires are left to finish on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            "TCP relay listening on {}, forwarding to {}",
            self.listener.local_addr()?,
            self.connector.target()
        );

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.sessions.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("Session limiter closed, no longer accepting");
                        break;
                    }
                },
            };

            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            let session_id = self.session_ids.generate();
            self.metrics.record_accepted();
            debug!(session_id, peer = %peer_addr, "Accepted TCP connection");

            tokio::spawn(serve_session(
                session_id,
                stream,
                peer_addr,
                self.connector.clone(),
                self.config.pump.clone(),
                self.metrics.clone(),
                permit,
            ));
        }

        info!("TCP relay stopped accepting connections");
        Ok(())
    }
}

/// Pair one accepted client with an upstream connection and pump it.
///
/// The session permit is held until the pair is closed.
async fn serve_session<C: UpstreamConnector>(
    session_id: u64,
    client: TcpStream,
    peer_addr: SocketAddr,
    connector: Arc<C>,
    options: PumpOptions,
    metrics: Arc<RelayMetrics>,
    _permit: OwnedSemaphorePermit,
) {
    let upstream = match connector.connect().await {
        Ok(upstream) => upstream,
        Err(e) => {
            metrics.record_upstream_failure();
            warn!(
                session_id,
                peer = %peer_addr,
                upstream = %connector.target(),
                error = %e,
                "Upstream connect failed, closing client"
            );
            drop(client);
            return;
        }
    };

    debug!(
        session_id,
        peer = %peer_addr,
        upstream = %connector.target(),
        "Upstream connected, pumping"
    );

    let _active = metrics.session_started();
    let pair = ConnectionPair::new(session_id, peer_addr, client, upstream);
    let report = pump(pair, &options).await;
    metrics.record_completed(&report);

    info!(
        session_id,
        peer = %peer_addr,
        reason = %report.reason,
        bytes_to_upstream = report.client_to_upstream,
        bytes_to_client = report.upstream_to_client,
        duration_ms = report.duration.as_millis() as u64,
        "Session closed"
    );
}

/// Bind a listener with SO_REUSEADDR and the relay backlog.
///
/// The host may be a name; each resolved address is tried in order and the
/// first that binds wins. Failure is fatal and is not retried.
pub async fn bind_listener(endpoint: &Endpoint) -> Result<TcpListener, RelayError> {
    let addrs: Vec<SocketAddr> = lookup_host((endpoint.host_for_connect(), endpoint.port))
        .await
        .map_err(|source| RelayError::ResolveError {
            host: endpoint.host.clone(),
            source,
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match bind_reuseaddr(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!("Bind attempt on {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(RelayError::BindError {
        address: endpoint.host.clone(),
        port: endpoint.port,
        reason: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "host resolved to no addresses".to_string()),
    })
}

fn bind_reuseaddr(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}
