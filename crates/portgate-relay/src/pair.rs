//! A client/upstream socket pair under forwarding

use std::fmt;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// One end of a [`ConnectionPair`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    /// Where bytes read from this side are written.
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Upstream,
            Side::Upstream => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Upstream => f.write_str("upstream"),
        }
    }
}

/// Both sockets of one forwarding session.
///
/// The pair is moved into the pump and released through [`ConnectionPair::close`],
/// which consumes it, so each socket is closed exactly once. If the owning
/// task is dropped early the sockets are still closed by `Drop`.
pub struct ConnectionPair {
    session_id: u64,
    peer_addr: SocketAddr,
    client: TcpStream,
    upstream: TcpStream,
}

impl ConnectionPair {
    pub fn new(
        session_id: u64,
        peer_addr: SocketAddr,
        client: TcpStream,
        upstream: TcpStream,
    ) -> Self {
        Self {
            session_id,
            peer_addr,
            client,
            upstream,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Apply TCP_NODELAY to both sockets. Failure is logged and ignored.
    pub fn set_nodelay(&self, nodelay: bool) {
        for (side, stream) in [(Side::Client, &self.client), (Side::Upstream, &self.upstream)] {
            if let Err(e) = stream.set_nodelay(nodelay) {
                debug!(
                    session_id = self.session_id,
                    side = %side,
                    error = %e,
                    "Failed to set TCP_NODELAY"
                );
            }
        }
    }

    pub(crate) fn streams_mut(&mut self) -> (&mut TcpStream, &mut TcpStream) {
        (&mut self.client, &mut self.upstream)
    }

    /// Shut down and release both sockets.
    ///
    /// Each shutdown is attempted independently; an error on one side does
    /// not skip the other. The descriptors are closed when `self` drops at
    /// the end of this call.
    pub async fn close(mut self) {
        if let Err(e) = self.client.shutdown().await {
            debug!(session_id = self.session_id, error = %e, "Client shutdown failed");
        }
        if let Err(e) = self.upstream.shutdown().await {
            debug!(session_id = self.session_id, error = %e, "Upstream shutdown failed");
        }
        debug!(session_id = self.session_id, "Connection pair closed");
    }
}

impl fmt::Debug for ConnectionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPair")
            .field("session_id", &self.session_id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
