//! # Configuration Module
//!
//! [`DispatcherConfig`] holds everything a dispatcher needs to bind, pace
//! and police its workers. It is immutable once a dispatcher is built.
//!
//! Values come from three places, in the order the CLI applies them:
//!
//! 1. Defaults (`DispatcherConfig::default()`)
//! 2. A YAML file (`DispatcherConfig::from_yaml_file`)
//! 3. Environment variables (`DispatcherConfig::from_env` /
//!    [`DispatcherConfig::apply_env`])
//!
//! ## Environment Variables
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `FORKSERVE_HOST` | `host` | `0.0.0.0` |
//! | `FORKSERVE_PORT` | `port` | `3000` |
//! | `FORKSERVE_THROTTLE_MS` | `throttle_ms` | `0` |
//! | `FORKSERVE_TIMEOUT_MS` | `timeout_ms` | `60000` |
//! | `FORKSERVE_MAX_PROCESSORS` | `max_processors` | `950` |
//! | `FORKSERVE_MIN_CHILDREN` | `min_children` | `1` |
//! | `FORKSERVE_MAX_CHILDREN` | `max_children` | `0` (unlimited) |
//! | `FORKSERVE_STACK_SIZE` | `stack_size` | `0x10000` |
//!
//! `FORKSERVE_STACK_SIZE` accepts decimal (`65536`) or hex (`0x10000`).
//!
//! ## Example
//!
//! ```yaml
//! host: 127.0.0.1
//! port: 8080
//! timeout_ms: 30000
//! min_children: 2
//! max_children: 16
//! ```

use crate::error::DispatchError;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Which scheduling model a dispatcher runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// In-process workers, one per connection
    Tcp,
    /// Forked children fed over local control sockets
    Unix,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Tcp => write!(f, "tcp"),
            Domain::Unix => write!(f, "unix"),
        }
    }
}

/// Dispatcher settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Interface to bind
    pub host: String,
    /// Port to bind (0 picks an ephemeral port)
    pub port: u16,
    /// Pause after each dispatched connection; 0 disables pacing
    pub throttle_ms: u64,
    /// Longest a worker or child may hold one connection
    pub timeout_ms: u64,
    /// Threaded model: live workers allowed before new connections are dropped
    pub max_processors: usize,
    /// Process model: children kept alive even when idle
    pub min_children: usize,
    /// Process model: hard cap on children, 0 for no cap
    pub max_children: usize,
    /// Process model: upper bound on one multiplexed wait
    pub poll_interval_ms: u64,
    /// Process model: how long a new child may take to announce readiness
    pub spawn_timeout_ms: u64,
    /// Process model: SIGTERM-to-SIGKILL grace period during eviction
    pub kill_grace_ms: u64,
    /// Threaded model: coroutine stack size in bytes
    pub stack_size: usize,
    /// Apply deferred-accept / corking / accept filters where supported
    pub socket_tuning: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            throttle_ms: 0,
            timeout_ms: 60_000,
            max_processors: 950,
            min_children: 1,
            max_children: 0,
            poll_interval_ms: 60_000,
            spawn_timeout_ms: 10_000,
            kill_grace_ms: 2_000,
            stack_size: 0x10000, // 64KB
            socket_tuning: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_stack_size(s: &str) -> Option<usize> {
    if let Some(hex) = s.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

impl DispatcherConfig {
    /// Defaults bound to `host:port`
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Defaults overridden by `FORKSERVE_*` environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay any `FORKSERVE_*` variables that are set and parse cleanly
    pub fn apply_env(&mut self) {
        if let Ok(host) = env::var("FORKSERVE_HOST") {
            self.host = host;
        }
        if let Some(port) = env_parse("FORKSERVE_PORT") {
            self.port = port;
        }
        if let Some(v) = env_parse("FORKSERVE_THROTTLE_MS") {
            self.throttle_ms = v;
        }
        if let Some(v) = env_parse("FORKSERVE_TIMEOUT_MS") {
            self.timeout_ms = v;
        }
        if let Some(v) = env_parse("FORKSERVE_MAX_PROCESSORS") {
            self.max_processors = v;
        }
        if let Some(v) = env_parse("FORKSERVE_MIN_CHILDREN") {
            self.min_children = v;
        }
        if let Some(v) = env_parse("FORKSERVE_MAX_CHILDREN") {
            self.max_children = v;
        }
        if let Some(v) = env::var("FORKSERVE_STACK_SIZE")
            .ok()
            .and_then(|s| parse_stack_size(s.trim()))
        {
            self.stack_size = v;
        }
    }

    /// Load a YAML file; missing keys keep their defaults
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self, DispatchError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse YAML text; missing keys keep their defaults
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on malformed YAML or unknown value types.
    pub fn from_yaml_str(text: &str) -> Result<Self, DispatchError> {
        serde_yaml::from_str(text).map_err(|e| DispatchError::InvalidConfig(e.to_string()))
    }

    /// Check cross-field invariants
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first violated rule.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.host.trim().is_empty() {
            return Err(DispatchError::InvalidConfig("host is empty".to_string()));
        }
        if self.max_processors == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_processors must be at least 1".to_string(),
            ));
        }
        if let Some(max) = self.max_children() {
            if self.min_children > max {
                return Err(DispatchError::InvalidConfig(
                    "max_children is set lower than min_children".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// `host:port` as accepted by `ToSocketAddrs`
    #[must_use]
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    #[must_use]
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `None` when the pool is uncapped
    #[must_use]
    pub fn max_children(&self) -> Option<usize> {
        (self.max_children != 0).then_some(self.max_children)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    #[must_use]
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms.max(1))
    }

    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Sleep between drain sweeps: a tenth of the timeout, never below 10ms
    #[must_use]
    pub fn drain_interval(&self) -> Duration {
        (self.timeout() / 10).max(Duration::from_millis(10))
    }
}
