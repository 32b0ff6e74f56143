//! Bidirectional byte pump
//!
//! Both read halves of a [`ConnectionPair`] are polled together on the tokio
//! reactor. Whichever side becomes readable first is read (up to one chunk)
//! and the bytes are written in full to its peer. The first EOF or I/O error
//! in either direction tears down the whole pair; half-close is not kept
//! alive.

use portgate_config::{RelayConfig, DEFAULT_CHUNK_SIZE, DEFAULT_IDLE_TICK_SECS};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::pair::{ConnectionPair, Side};

/// Per-session pump settings
#[derive(Debug, Clone)]
pub struct PumpOptions {
    /// Maximum bytes read from a socket per readiness event
    pub chunk_size: usize,
    /// Bounded readiness wait; elapsing re-arms the wait and never closes the pair
    pub idle_tick: Duration,
    pub nodelay: bool,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_tick: Duration::from_secs(DEFAULT_IDLE_TICK_SECS),
            nodelay: true,
        }
    }
}

impl From<&RelayConfig> for PumpOptions {
    fn from(config: &RelayConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            idle_tick: config.idle_tick(),
            nodelay: config.nodelay,
        }
    }
}

/// Why a pair stopped forwarding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The client performed an orderly close
    ClientClosed,
    /// The upstream performed an orderly close
    UpstreamClosed,
    /// Reading from this side failed
    ReadFailed(Side),
    /// Writing to this side failed
    WriteFailed(Side),
}

impl Termination {
    fn closed_by(side: Side) -> Self {
        match side {
            Side::Client => Termination::ClientClosed,
            Side::Upstream => Termination::UpstreamClosed,
        }
    }

    /// True for orderly closes, false for I/O failures
    pub fn is_clean(&self) -> bool {
        matches!(self, Termination::ClientClosed | Termination::UpstreamClosed)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::ClientClosed => f.write_str("client_closed"),
            Termination::UpstreamClosed => f.write_str("upstream_closed"),
            Termination::ReadFailed(side) => write!(f, "{}_read_failed", side),
            Termination::WriteFailed(side) => write!(f, "{}_write_failed", side),
        }
    }
}

/// Outcome of one pump run
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: u64,
    pub reason: Termination,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub duration: Duration,
}

/// Forward bytes between the two sockets of `pair` until either side closes
/// or fails, then close both sockets.
///
/// This never returns an error: every way a session can end is a
/// [`Termination`] in the returned report.
pub async fn pump(mut pair: ConnectionPair, options: &PumpOptions) -> SessionReport {
    let started = Instant::now();
    let session_id = pair.session_id();
    let chunk_size = options.chunk_size.max(1);

    if options.nodelay {
        pair.set_nodelay(true);
    }

    let mut client_to_upstream = 0u64;
    let mut upstream_to_client = 0u64;

    let reason = {
        let (client, upstream) = pair.streams_mut();
        let (mut client_read, mut client_write) = client.split();
        let (mut upstream_read, mut upstream_write) = upstream.split();

        let mut client_buf = vec![0u8; chunk_size];
        let mut upstream_buf = vec![0u8; chunk_size];

        loop {
            // Both reads are cancel safe: the losing branch consumes nothing
            let (source, result) = tokio::select! {
                result = client_read.read(&mut client_buf) => (Side::Client, result),
                result = upstream_read.read(&mut upstream_buf) => (Side::Upstream, result),
                _ = tokio::time::sleep(options.idle_tick) => {
                    trace!(session_id, "Idle tick, waiting again");
                    continue;
                }
            };

            let n = match result {
                Ok(0) => {
                    debug!(session_id, side = %source, "Orderly close");
                    break Termination::closed_by(source);
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(session_id, side = %source, error = %e, "Read failed");
                    break Termination::ReadFailed(source);
                }
            };

            let data = match source {
                Side::Client => &client_buf[..n],
                Side::Upstream => &upstream_buf[..n],
            };
            let destination = match source.peer() {
                Side::Client => &mut client_write,
                Side::Upstream => &mut upstream_write,
            };

            if let Err(e) = destination.write_all(data).await {
                warn!(session_id, side = %source.peer(), error = %e, "Write failed");
                break Termination::WriteFailed(source.peer());
            }

            trace!(session_id, from = %source, bytes = n, "Forwarded");
            match source {
                Side::Client => client_to_upstream += n as u64,
                Side::Upstream => upstream_to_client += n as u64,
            }
        }
    };

    pair.close().await;

    SessionReport {
        session_id,
        reason,
        client_to_upstream,
        upstream_to_client,
        duration: started.elapsed(),
    }
}
