use std::time::Duration;
use thiserror::Error;

/// Relay server errors. All of these are startup-time conditions.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to resolve listen host {host}: {source}")]
    ResolveError {
        host: String,
        source: std::io::Error,
    },

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Check that {address} is assigned to a local interface (e.g. the docker0 bridge)\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Errors from a single upstream connect attempt
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to connect to upstream {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to upstream {address} after {after:?}")]
    Timeout { address: String, after: Duration },
}
