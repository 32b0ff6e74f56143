//! Upstream connection factory

use async_trait::async_trait;
use portgate_config::{Endpoint, RelayConfig};
use std::time::Duration;
use tokio::net::TcpStream;

use crate::error::ConnectError;

/// Opens the outbound half of a connection pair.
///
/// Every accepted client is paired with exactly one stream returned from
/// [`UpstreamConnector::connect`]. The relay never retries a failed attempt;
/// the client is closed instead.
#[async_trait]
pub trait UpstreamConnector: Send + Sync + 'static {
    /// Connect to the upstream target
    async fn connect(&self) -> Result<TcpStream, ConnectError>;

    /// Human-readable target, used in log fields
    fn target(&self) -> String;
}

/// Connects to a fixed host/port over TCP with a bounded wait.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    upstream: Endpoint,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(upstream: Endpoint, timeout: Duration) -> Self {
        Self { upstream, timeout }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.upstream.clone(), config.connect_timeout())
    }
}

#[async_trait]
impl UpstreamConnector for TcpConnector {
    async fn connect(&self) -> Result<TcpStream, ConnectError> {
        let target = (self.upstream.host_for_connect(), self.upstream.port);

        match tokio::time::timeout(self.timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectError::ConnectionFailed {
                address: self.upstream.to_string(),
                source,
            }),
            Err(_) => Err(ConnectError::Timeout {
                address: self.upstream.to_string(),
                after: self.timeout,
            }),
        }
    }

    fn target(&self) -> String {
        self.upstream.to_string()
    }
}
