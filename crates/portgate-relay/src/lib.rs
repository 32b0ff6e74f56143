//! TCP relay
//!
//! Accepts inbound connections on one address and forwards each to a fixed
//! upstream address, moving bytes in both directions until either side
//! closes or errors.
//!
//! ```text
//!   client ──► RelayServer (accept) ──► UpstreamConnector (connect)
//!                    │
//!                    ▼
//!              ConnectionPair ──► pump ──► both sockets closed
//! ```
//!
//! Each pair runs on its own task and owns its sockets exclusively. A failed
//! upstream connect or a broken session only affects that one client.

mod connector;
mod error;
mod metrics;
mod pair;
mod pump;
mod server;

pub use connector::{TcpConnector, UpstreamConnector};
pub use error::{ConnectError, RelayError};
pub use metrics::{ActiveSession, MetricsSnapshot, RelayMetrics, SessionIdGenerator};
pub use pair::{ConnectionPair, Side};
pub use pump::{pump, PumpOptions, SessionReport, Termination};
pub use server::{bind_listener, RelayServer, RelayServerConfig};
