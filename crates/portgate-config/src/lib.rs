//! Relay configuration
//!
//! A single [`RelayConfig`] is built once at process start (defaults, then an
//! optional YAML file, then CLI/environment overrides applied by the binary)
//! and passed by value into the relay. Nothing here is global.

mod endpoint;
mod error;

pub use endpoint::Endpoint;
pub use error::ConfigError;

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_LISTEN_HOST: &str = "172.17.0.1";
pub const DEFAULT_LISTEN_PORT: u16 = 13306;
pub const DEFAULT_UPSTREAM_HOST: &str = "127.0.0.1";
pub const DEFAULT_UPSTREAM_PORT: u16 = 13306;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_IDLE_TICK_SECS: u64 = 60;
pub const DEFAULT_CHUNK_SIZE: usize = 65536;
pub const DEFAULT_MAX_SESSIONS: usize = 64;
pub const LISTEN_BACKLOG: u32 = 128;

/// Complete relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Address the acceptor binds to
    pub listen: Endpoint,

    /// Address every accepted connection is paired against
    pub upstream: Endpoint,

    /// Upper bound on a single upstream connect attempt
    pub connect_timeout_secs: u64,

    /// Bounded readiness wait of the pump; elapsing only re-arms the wait
    pub idle_tick_secs: u64,

    /// Maximum bytes read from one socket per readiness event
    pub chunk_size: usize,

    /// Maximum concurrently pumped sessions (1 = strictly sequential)
    pub max_sessions: usize,

    /// Set TCP_NODELAY on both sockets of a pair
    pub nodelay: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: Endpoint::new(DEFAULT_LISTEN_HOST, DEFAULT_LISTEN_PORT),
            upstream: Endpoint::new(DEFAULT_UPSTREAM_HOST, DEFAULT_UPSTREAM_PORT),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_tick_secs: DEFAULT_IDLE_TICK_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_sessions: DEFAULT_MAX_SESSIONS,
            nodelay: true,
        }
    }
}

impl RelayConfig {
    /// Load config from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    /// Parse config from a YAML string. Missing keys keep their defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the relay relies on.
    ///
    /// A listen port of 0 is accepted and binds an ephemeral port.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.host.trim().is_empty() {
            return Err(ConfigError::Invalid("listen host cannot be empty".into()));
        }
        if self.upstream.host.trim().is_empty() {
            return Err(ConfigError::Invalid("upstream host cannot be empty".into()));
        }
        if self.upstream.port == 0 {
            return Err(ConfigError::Invalid("upstream port cannot be 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".into()));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "max_sessions must be at least 1".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_secs must be at least 1".into(),
            ));
        }
        if self.idle_tick_secs == 0 {
            return Err(ConfigError::Invalid(
                "idle_tick_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_secs(self.idle_tick_secs)
    }
}
